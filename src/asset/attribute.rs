use std::ops::Range;

use uuid::Uuid;

/// Scalar type stored by an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    U32,
    U16,
    U8,
    I16,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::U32 => 4,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U8 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeData {
    F32(Vec<f32>),
    U32(Vec<u32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
    I16(Vec<i16>),
}

impl AttributeData {
    pub fn element_type(&self) -> ElementType {
        match self {
            AttributeData::F32(_) => ElementType::F32,
            AttributeData::U32(_) => ElementType::U32,
            AttributeData::U16(_) => ElementType::U16,
            AttributeData::U8(_) => ElementType::U8,
            AttributeData::I16(_) => ElementType::I16,
        }
    }

    /// Number of scalar components.
    pub fn len(&self) -> usize {
        match self {
            AttributeData::F32(v) => v.len(),
            AttributeData::U32(v) => v.len(),
            AttributeData::U16(v) => v.len(),
            AttributeData::U8(v) => v.len(),
            AttributeData::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeData::F32(v) => bytemuck::cast_slice(v),
            AttributeData::U32(v) => bytemuck::cast_slice(v),
            AttributeData::U16(v) => bytemuck::cast_slice(v),
            AttributeData::U8(v) => v.as_slice(),
            AttributeData::I16(v) => bytemuck::cast_slice(v),
        }
    }

    /// Reads component `index` widened to `u32`; used for index buffers.
    pub(crate) fn index_at(&self, index: usize) -> Option<u32> {
        match self {
            AttributeData::U32(v) => v.get(index).copied(),
            AttributeData::U16(v) => v.get(index).map(|&i| i as u32),
            AttributeData::U8(v) => v.get(index).map(|&i| i as u32),
            _ => None,
        }
    }
}

/// A typed array of per-vertex (or per-index) data with an explicit version
/// counter. Mutating `data` does nothing on its own; call
/// [`Attribute::bump_version`] so caches pick the change up.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: Uuid,
    pub data: AttributeData,
    pub item_size: u32,
    pub normalized: bool,
    pub version: u64,
    /// Component range to upload on the next sync instead of the whole array.
    pub update_range: Option<Range<usize>>,
}

impl Attribute {
    pub fn new(data: AttributeData, item_size: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            item_size: item_size.max(1),
            normalized: false,
            version: 0,
            update_range: None,
        }
    }

    pub fn positions(values: Vec<[f32; 3]>) -> Self {
        Self::new(
            AttributeData::F32(values.into_iter().flatten().collect()),
            3,
        )
    }

    pub fn indices(values: Vec<u32>) -> Self {
        Self::new(AttributeData::U32(values), 1)
    }

    /// Number of items (vertices or indices).
    pub fn count(&self) -> usize {
        self.data.len() / self.item_size as usize
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Marks a component range dirty and bumps the version.
    pub fn mark_range(&mut self, range: Range<usize>) {
        self.update_range = Some(range);
        self.bump_version();
    }

    pub(crate) fn vec3_at(&self, index: usize) -> Option<glam::Vec3> {
        if self.item_size < 3 {
            return None;
        }
        match &self.data {
            AttributeData::F32(values) => {
                let base = index * self.item_size as usize;
                let slice = values.get(base..base + 3)?;
                Some(glam::Vec3::new(slice[0], slice[1], slice[2]))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_items_not_components() {
        let attribute = Attribute::positions(vec![[0.0; 3], [1.0; 3]]);
        assert_eq!(attribute.count(), 2);
        assert_eq!(attribute.data.as_bytes().len(), 24);
    }

    #[test]
    fn mark_range_bumps_version() {
        let mut attribute = Attribute::indices(vec![0, 1, 2]);
        attribute.mark_range(1..2);
        assert_eq!(attribute.version, 1);
        assert_eq!(attribute.update_range, Some(1..2));
    }
}
