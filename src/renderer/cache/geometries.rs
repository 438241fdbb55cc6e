use fxhash::FxHashMap;
use uuid::Uuid;

use super::attributes::AttributeCache;
use crate::asset::{geometry::POSITION, Geometry};
use crate::error::DeviceError;
use crate::renderer::device::{BufferId, BufferKind, GraphicsDevice};

#[derive(Debug, Clone, Copy)]
pub struct WireframeBuffer {
    pub buffer: BufferId,
    /// Number of u32 indices.
    pub count: u32,
    source_version: u64,
}

#[derive(Default)]
struct GeometryEntry {
    attributes: Vec<Uuid>,
    wireframe: Option<WireframeBuffer>,
    synced_frame: Option<u64>,
}

/// Tracks which attribute buffers belong to which geometry so disposal can
/// release all of them, and owns the derived wireframe index buffers.
#[derive(Default)]
pub struct GeometryCache {
    entries: FxHashMap<Uuid, GeometryEntry>,
}

impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Syncs index, attributes and morph attributes. Runs at most once per
    /// geometry per frame.
    pub fn update(
        &mut self,
        device: &mut dyn GraphicsDevice,
        attributes: &mut AttributeCache,
        geometry: &mut Geometry,
        frame: u64,
    ) -> Result<(), DeviceError> {
        let entry = self.entries.entry(geometry.id).or_insert_with(|| {
            log::trace!("Registering geometry {}", geometry.id);
            GeometryEntry::default()
        });
        if entry.synced_frame == Some(frame) {
            return Ok(());
        }

        entry.attributes.clear();
        if let Some(index) = geometry.index.as_mut() {
            attributes.update(device, index, BufferKind::Index)?;
            entry.attributes.push(index.id);
        }
        for attribute in geometry.attributes.values_mut() {
            attributes.update(device, attribute, BufferKind::Vertex)?;
            entry.attributes.push(attribute.id);
        }
        for targets in geometry.morph_attributes.values_mut() {
            for attribute in targets.iter_mut() {
                attributes.update(device, attribute, BufferKind::Vertex)?;
                entry.attributes.push(attribute.id);
            }
        }

        entry.synced_frame = Some(frame);
        Ok(())
    }

    /// Line-list index buffer with three segments per triangle, rebuilt when
    /// the source index (or vertex count for non-indexed geometry) changes.
    pub fn wireframe(
        &mut self,
        device: &mut dyn GraphicsDevice,
        geometry: &Geometry,
    ) -> Result<WireframeBuffer, DeviceError> {
        let entry = self.entries.entry(geometry.id).or_default();
        let source_version = wireframe_source_version(geometry);

        if let Some(wireframe) = entry.wireframe {
            if wireframe.source_version == source_version {
                return Ok(wireframe);
            }
            device.delete_buffer(wireframe.buffer);
            entry.wireframe = None;
        }

        let indices = wireframe_indices(geometry);
        let buffer = device.create_buffer(BufferKind::Index, bytemuck::cast_slice(&indices))?;
        let wireframe = WireframeBuffer {
            buffer,
            count: indices.len() as u32,
            source_version,
        };
        entry.wireframe = Some(wireframe);
        Ok(wireframe)
    }

    /// Releases the index, every attribute, morph attributes and the
    /// wireframe buffer of a geometry.
    pub fn dispose(
        &mut self,
        device: &mut dyn GraphicsDevice,
        attributes: &mut AttributeCache,
        geometry: &Geometry,
    ) {
        let Some(entry) = self.entries.remove(&geometry.id) else {
            return;
        };
        for id in entry.attributes {
            attributes.remove(device, &id);
        }
        // Attributes added since the last sync are released too.
        for id in all_attribute_ids(geometry) {
            attributes.remove(device, &id);
        }
        if let Some(wireframe) = entry.wireframe {
            device.delete_buffer(wireframe.buffer);
        }
        log::trace!("Disposed geometry {}", geometry.id);
    }

    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.entries.drain() {
            if let Some(wireframe) = entry.wireframe {
                device.delete_buffer(wireframe.buffer);
            }
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn all_attribute_ids(geometry: &Geometry) -> impl Iterator<Item = Uuid> + '_ {
    geometry
        .index
        .iter()
        .chain(geometry.attributes.values())
        .chain(geometry.morph_attributes.values().flatten())
        .map(|attribute| attribute.id)
}

fn wireframe_source_version(geometry: &Geometry) -> u64 {
    match &geometry.index {
        Some(index) => index.version,
        None => geometry
            .attribute(POSITION)
            .map(|position| position.count() as u64)
            .unwrap_or(0),
    }
}

fn wireframe_indices(geometry: &Geometry) -> Vec<u32> {
    let triangle = |a: u32, b: u32, c: u32| [a, b, b, c, c, a];
    match &geometry.index {
        Some(index) => {
            let count = index.data.len();
            (0..count / 3)
                .filter_map(|t| {
                    let a = index.data.index_at(t * 3)?;
                    let b = index.data.index_at(t * 3 + 1)?;
                    let c = index.data.index_at(t * 3 + 2)?;
                    Some(triangle(a, b, c))
                })
                .flatten()
                .collect()
        }
        None => {
            let count = geometry
                .attribute(POSITION)
                .map(|position| position.count())
                .unwrap_or(0) as u32;
            (0..count / 3)
                .flat_map(|t| triangle(t * 3, t * 3 + 1, t * 3 + 2))
                .collect()
        }
    }
}
