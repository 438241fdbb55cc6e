use fxhash::FxHashMap;
use uuid::Uuid;

use crate::asset::{Attribute, ElementType};
use crate::error::DeviceError;
use crate::renderer::device::{BufferId, BufferKind, GraphicsDevice};

/// GPU mirror of one [`Attribute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub buffer: BufferId,
    pub element_type: ElementType,
    pub bytes_per_element: usize,
    /// Source version this buffer was last synced to.
    pub version: u64,
    /// Scalar component count.
    pub count: usize,
}

/// Buffers keyed by attribute id.
///
/// The only invalidation rule is the version counter: an entry is created and
/// fully uploaded when missing, re-uploaded when the cached version is older
/// than the source, and left alone otherwise.
#[derive(Default)]
pub struct AttributeCache {
    buffers: FxHashMap<Uuid, GpuBuffer>,
}

impl AttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&GpuBuffer> {
        self.buffers.get(id)
    }

    pub fn update(
        &mut self,
        device: &mut dyn GraphicsDevice,
        attribute: &mut Attribute,
        kind: BufferKind,
    ) -> Result<GpuBuffer, DeviceError> {
        let count = attribute.data.len();

        let Some(entry) = self.buffers.get_mut(&attribute.id) else {
            let gpu = create_buffer(device, attribute, kind)?;
            attribute.update_range = None;
            self.buffers.insert(attribute.id, gpu);
            return Ok(gpu);
        };

        if entry.count != count || entry.element_type != attribute.data.element_type() {
            log::trace!(
                "Attribute {} resized ({} -> {} components); recreating buffer",
                attribute.id,
                entry.count,
                count
            );
            device.delete_buffer(entry.buffer);
            let gpu = create_buffer(device, attribute, kind)?;
            attribute.update_range = None;
            *entry = gpu;
            return Ok(gpu);
        }

        if entry.version < attribute.version {
            let bytes = attribute.data.as_bytes();
            match attribute.update_range.take() {
                Some(range) if range.start < range.end && range.end <= count => {
                    let start = range.start * entry.bytes_per_element;
                    let end = range.end * entry.bytes_per_element;
                    device.write_buffer(entry.buffer, start as u64, &bytes[start..end])?;
                }
                _ => device.write_buffer(entry.buffer, 0, bytes)?,
            }
            entry.version = attribute.version;
        }

        Ok(*entry)
    }

    pub fn remove(&mut self, device: &mut dyn GraphicsDevice, id: &Uuid) {
        if let Some(entry) = self.buffers.remove(id) {
            device.delete_buffer(entry.buffer);
        }
    }

    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.buffers.drain() {
            device.delete_buffer(entry.buffer);
        }
    }

    /// Forgets every entry without touching the device. Used after the
    /// context was lost and the handles are already invalid.
    pub fn reset(&mut self) {
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

fn create_buffer(
    device: &mut dyn GraphicsDevice,
    attribute: &Attribute,
    kind: BufferKind,
) -> Result<GpuBuffer, DeviceError> {
    let element_type = attribute.data.element_type();
    let buffer = device.create_buffer(kind, attribute.data.as_bytes())?;
    Ok(GpuBuffer {
        buffer,
        element_type,
        bytes_per_element: element_type.size(),
        version: attribute.version,
        count: attribute.data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AttributeData;
    use crate::renderer::recording::DeviceCommand;
    use crate::renderer::RecordingDevice;

    fn attribute() -> Attribute {
        Attribute::new(AttributeData::F32(vec![0.0; 12]), 3)
    }

    #[test]
    fn unchanged_version_uploads_once() {
        let mut device = RecordingDevice::new();
        let mut cache = AttributeCache::new();
        let mut attribute = attribute();

        let first = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();
        let second = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(device.uploads_for(first.buffer), 1);
    }

    #[test]
    fn bumped_version_uploads_exactly_once_more() {
        let mut device = RecordingDevice::new();
        let mut cache = AttributeCache::new();
        let mut attribute = attribute();
        let gpu = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        attribute.bump_version();
        cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();
        cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        assert_eq!(device.uploads_for(gpu.buffer), 2);
        assert_eq!(cache.get(&attribute.id).unwrap().version, attribute.version);
    }

    #[test]
    fn ranged_update_writes_only_the_range_and_consumes_it() {
        let mut device = RecordingDevice::new();
        let mut cache = AttributeCache::new();
        let mut attribute = attribute();
        let gpu = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        attribute.mark_range(3..6);
        cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        assert!(attribute.update_range.is_none());
        assert!(device.commands().contains(&DeviceCommand::WriteBuffer {
            id: gpu.buffer,
            offset: 12,
            size: 12,
        }));
    }

    #[test]
    fn resized_attribute_gets_a_new_buffer() {
        let mut device = RecordingDevice::new();
        let mut cache = AttributeCache::new();
        let mut attribute = attribute();
        let old = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        attribute.data = AttributeData::F32(vec![1.0; 24]);
        attribute.bump_version();
        let new = cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        assert_ne!(old.buffer, new.buffer);
        assert_eq!(new.count, 24);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn reset_forgets_without_deleting() {
        let mut device = RecordingDevice::new();
        let mut cache = AttributeCache::new();
        let mut attribute = attribute();
        cache
            .update(&mut device, &mut attribute, BufferKind::Vertex)
            .unwrap();

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(device.live_buffers(), 1);
    }
}
