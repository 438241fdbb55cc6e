use std::num::NonZeroU64;

use crate::renderer::device::UniformSlot;

const SLOT_COUNT: usize = UniformSlot::COUNT;

/// Per-slot uniform chunks written between two flushes.
///
/// Every `set_uniforms` appends a chunk at an aligned offset; draws capture
/// the current offsets and bind them as dynamic offsets. A flush uploads all
/// slots at once and rebuilds the bind group when a buffer grew or a slot's
/// binding size changed.
pub(crate) struct UniformRing {
    alignment: u64,
    slots: [SlotStaging; SLOT_COUNT],
    buffers: [Option<wgpu::Buffer>; SLOT_COUNT],
    binding_sizes: [u64; SLOT_COUNT],
    bind_group: Option<wgpu::BindGroup>,
    pub(crate) layout: wgpu::BindGroupLayout,
}

#[derive(Default)]
struct SlotStaging {
    bytes: Vec<u8>,
    current: Option<u64>,
    current_len: u64,
    max_len: u64,
}

impl SlotStaging {
    fn push(&mut self, data: &[u8], alignment: u64) -> u64 {
        let offset = align_to(self.bytes.len() as u64, alignment);
        self.bytes.resize(offset as usize, 0);
        self.bytes.extend_from_slice(data);
        let len = padded_len(data.len() as u64);
        self.bytes.resize((offset + len) as usize, 0);
        self.current = Some(offset);
        self.current_len = len;
        self.max_len = self.max_len.max(len);
        offset
    }

    /// Keeps only the current chunk, moved to offset zero.
    fn restart(&mut self) {
        match self.current {
            Some(offset) => {
                let start = offset as usize;
                let end = start + self.current_len as usize;
                let chunk = self.bytes[start..end].to_vec();
                self.bytes = chunk;
                self.current = Some(0);
                self.max_len = self.current_len;
            }
            None => {
                self.bytes.clear();
                self.max_len = 0;
            }
        }
    }
}

impl UniformRing {
    pub(crate) fn new(device: &wgpu::Device) -> Self {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = UniformSlot::ALL
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("UniformsBindLayout"),
            entries: &entries,
        });

        Self {
            alignment: device.limits().min_uniform_buffer_offset_alignment as u64,
            slots: Default::default(),
            buffers: Default::default(),
            binding_sizes: [0; SLOT_COUNT],
            bind_group: None,
            layout,
        }
    }

    pub(crate) fn write(&mut self, slot: UniformSlot, data: &[u8]) {
        self.slots[slot as usize].push(data, self.alignment);
    }

    /// Dynamic offsets of the latest chunk of every slot, in binding order.
    /// `None` until every slot received data.
    pub(crate) fn offsets(&self) -> Option<[u32; SLOT_COUNT]> {
        let mut offsets = [0u32; SLOT_COUNT];
        for (offset, slot) in offsets.iter_mut().zip(&self.slots) {
            *offset = slot.current? as u32;
        }
        Some(offsets)
    }

    /// Uploads staged chunks and returns the bind group to draw with.
    pub(crate) fn flush(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Option<wgpu::BindGroup> {
        let mut rebuild = self.bind_group.is_none();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.bytes.is_empty() {
                return None;
            }
            let binding_size = slot.max_len.max(16);
            // The latest chunk sits last; a full binding must fit behind it.
            let required = slot.current.unwrap_or(0) + binding_size;
            slot.bytes.resize(required as usize, 0);

            let capacity = self.buffers[index].as_ref().map_or(0, wgpu::Buffer::size);
            if capacity < required {
                let size = required.max(capacity * 2);
                log::debug!(
                    "Growing uniform buffer {:?}: {} -> {} bytes",
                    UniformSlot::ALL[index],
                    capacity,
                    size
                );
                self.buffers[index] = Some(device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("UniformRing"),
                    size,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }));
                rebuild = true;
            }
            if self.binding_sizes[index] != binding_size {
                self.binding_sizes[index] = binding_size;
                rebuild = true;
            }
            if let Some(buffer) = &self.buffers[index] {
                queue.write_buffer(buffer, 0, &slot.bytes);
            }
        }

        if rebuild {
            let mut entries = Vec::with_capacity(SLOT_COUNT);
            for (index, slot) in UniformSlot::ALL.iter().enumerate() {
                let buffer = self.buffers[index].as_ref()?;
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding(),
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: NonZeroU64::new(self.binding_sizes[index]),
                    }),
                });
            }
            self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("UniformsBindGroup"),
                layout: &self.layout,
                entries: &entries,
            }));
        }
        self.bind_group.clone()
    }

    /// Starts a new batch. The latest chunk of each slot carries over so
    /// uniforms set before a flush stay bound after it.
    pub(crate) fn restart(&mut self) {
        for slot in &mut self.slots {
            slot.restart();
        }
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

/// Uniform chunks are padded to whole vec4s.
fn padded_len(len: u64) -> u64 {
    align_to(len.max(16), 16)
}

/// CPU copy of a vertex or index buffer, kept so partial writes can be
/// widened to the 4 byte copy alignment wgpu requires.
pub(crate) struct MirroredBuffer {
    pub(crate) buffer: wgpu::Buffer,
    contents: Vec<u8>,
}

impl MirroredBuffer {
    pub(crate) fn new(device: &wgpu::Device, usage: wgpu::BufferUsages, data: &[u8]) -> Self {
        let size = align_to(data.len().max(4) as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GeometryBuffer"),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut contents = data.to_vec();
        contents.resize(size as usize, 0);
        Self { buffer, contents }
    }

    /// Uploads everything; used right after creation.
    pub(crate) fn upload_all(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, &self.contents);
    }

    /// Returns `false` when the write does not fit.
    pub(crate) fn write(&mut self, queue: &wgpu::Queue, offset: u64, data: &[u8]) -> bool {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.contents.len() {
            return false;
        }
        self.contents[start..end].copy_from_slice(data);

        let alignment = wgpu::COPY_BUFFER_ALIGNMENT as usize;
        let aligned_start = start / alignment * alignment;
        let aligned_end = end.div_ceil(alignment) * alignment;
        queue.write_buffer(
            &self.buffer,
            aligned_start as u64,
            &self.contents[aligned_start..aligned_end.min(self.contents.len())],
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_land_on_aligned_offsets() {
        let mut slot = SlotStaging::default();
        assert_eq!(slot.push(&[1; 64], 256), 0);
        assert_eq!(slot.push(&[2; 20], 256), 256);
        assert_eq!(slot.current_len, 32);
        assert_eq!(slot.max_len, 64);
    }

    #[test]
    fn restart_keeps_latest_chunk() {
        let mut slot = SlotStaging::default();
        slot.push(&[1; 16], 256);
        slot.push(&[7; 16], 256);
        slot.restart();

        assert_eq!(slot.current, Some(0));
        assert_eq!(slot.bytes, vec![7; 16]);
        assert_eq!(slot.max_len, 16);
    }

    #[test]
    fn empty_uniforms_still_take_one_vec4() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(17), 32);
        assert_eq!(align_to(300, 256), 512);
    }
}
