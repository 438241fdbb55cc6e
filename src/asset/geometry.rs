use std::collections::BTreeMap;

use glam::Vec3;
use uuid::Uuid;

use super::attribute::{Attribute, AttributeData};
use crate::scene::Sphere;

pub const POSITION: &str = "position";
pub const NORMAL: &str = "normal";
pub const UV: &str = "uv";
pub const COLOR: &str = "color";
pub const SKIN_INDEX: &str = "skin_index";
pub const SKIN_WEIGHT: &str = "skin_weight";

/// A sub-range of the index (or vertex) stream drawn with its own material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGroup {
    pub start: u32,
    pub count: u32,
    pub material_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRange {
    pub start: u32,
    pub count: Option<u32>,
}

impl Default for DrawRange {
    fn default() -> Self {
        Self {
            start: 0,
            count: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Geometry {
    pub id: Uuid,
    pub attributes: BTreeMap<String, Attribute>,
    pub index: Option<Attribute>,
    pub morph_attributes: BTreeMap<String, Vec<Attribute>>,
    pub groups: Vec<GeometryGroup>,
    pub draw_range: DrawRange,
    pub bounding_sphere: Option<Sphere>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new()
    }
}

impl Geometry {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            attributes: BTreeMap::new(),
            index: None,
            morph_attributes: BTreeMap::new(),
            groups: Vec::new(),
            draw_range: DrawRange::default(),
            bounding_sphere: None,
        }
    }

    pub fn with_attribute(mut self, name: &str, attribute: Attribute) -> Self {
        self.set_attribute(name, attribute);
        self
    }

    pub fn with_index(mut self, index: Vec<u32>) -> Self {
        self.index = Some(Attribute::indices(index));
        self
    }

    pub fn set_attribute(&mut self, name: &str, attribute: Attribute) {
        self.attributes.insert(name.to_string(), attribute);
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn add_group(&mut self, start: u32, count: u32, material_index: usize) {
        self.groups.push(GeometryGroup {
            start,
            count,
            material_index,
        });
    }

    pub fn has_morph_targets(&self) -> bool {
        self.morph_attributes.values().any(|targets| !targets.is_empty())
    }

    /// Elements drawn for the whole geometry: indices when indexed,
    /// vertices otherwise, clamped by the draw range.
    pub fn element_count(&self) -> u32 {
        let total = match &self.index {
            Some(index) => index.count(),
            None => self
                .attribute(POSITION)
                .map(Attribute::count)
                .unwrap_or(0),
        } as u32;
        let start = self.draw_range.start.min(total);
        let available = total - start;
        self.draw_range
            .count
            .map_or(available, |count| count.min(available))
    }

    /// Recomputes the bounding sphere from the position attribute.
    ///
    /// Returns `false` when the positions produced a NaN bound. In that case
    /// the previous sphere is kept (or an empty one when there was none).
    pub fn compute_bounding_sphere(&mut self) -> bool {
        let Some(position) = self.attribute(POSITION) else {
            self.bounding_sphere = Some(Sphere::EMPTY);
            return true;
        };

        let count = position.count();
        if count == 0 {
            self.bounding_sphere = Some(Sphere::EMPTY);
            return true;
        }

        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for i in 0..count {
            if let Some(p) = position.vec3_at(i) {
                min = min.min(p);
                max = max.max(p);
            }
        }
        let center = (min + max) * 0.5;
        let mut radius_sq = 0.0f32;
        let mut saw_nan = false;
        for i in 0..count {
            if let Some(p) = position.vec3_at(i) {
                if p.is_nan() {
                    saw_nan = true;
                }
                radius_sq = radius_sq.max(center.distance_squared(p));
            }
        }

        let sphere = Sphere::new(center, radius_sq.sqrt());
        if saw_nan || sphere.center.is_nan() || sphere.radius.is_nan() {
            log::error!(
                "Geometry {} produced a NaN bounding sphere; position data is invalid",
                self.id
            );
            if self.bounding_sphere.is_none() {
                self.bounding_sphere = Some(Sphere::EMPTY);
            }
            return false;
        }

        self.bounding_sphere = Some(sphere);
        true
    }

    /// Builds a triangle-list geometry from positions and an optional index.
    pub fn from_triangles(positions: Vec<[f32; 3]>, index: Option<Vec<u32>>) -> Self {
        let mut geometry = Geometry::new().with_attribute(POSITION, Attribute::positions(positions));
        if let Some(index) = index {
            geometry.index = Some(Attribute::indices(index));
        }
        geometry
    }

    /// Axis-aligned box centred on the origin with the given edge lengths.
    pub fn cuboid(width: f32, height: f32, depth: f32) -> Self {
        let (x, y, z) = (width * 0.5, height * 0.5, depth * 0.5);
        let corners = vec![
            [-x, -y, z],
            [x, -y, z],
            [x, y, z],
            [-x, y, z],
            [-x, -y, -z],
            [x, -y, -z],
            [x, y, -z],
            [-x, y, -z],
        ];
        let index = vec![
            0, 1, 2, 2, 3, 0, // front
            5, 4, 7, 7, 6, 5, // back
            4, 0, 3, 3, 7, 4, // left
            1, 5, 6, 6, 2, 1, // right
            3, 2, 6, 6, 7, 3, // top
            4, 5, 1, 1, 0, 4, // bottom
        ];
        let normals: Vec<f32> = corners
            .iter()
            .flat_map(|c| Vec3::from_array(*c).normalize_or_zero().to_array())
            .collect();
        Geometry::from_triangles(corners, Some(index))
            .with_attribute(NORMAL, Attribute::new(AttributeData::F32(normals), 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_sphere_encloses_all_positions() {
        let mut geometry = Geometry::cuboid(2.0, 2.0, 2.0);
        assert!(geometry.compute_bounding_sphere());

        let sphere = geometry.bounding_sphere.unwrap();
        assert!(sphere.center.abs_diff_eq(Vec3::ZERO, 1e-6));
        assert!((sphere.radius - 3.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn nan_positions_keep_last_valid_sphere() {
        let mut geometry = Geometry::cuboid(2.0, 2.0, 2.0);
        geometry.compute_bounding_sphere();
        let valid = geometry.bounding_sphere;

        geometry.set_attribute(
            POSITION,
            Attribute::positions(vec![[f32::NAN, 0.0, 0.0], [1.0, 1.0, 1.0]]),
        );
        assert!(!geometry.compute_bounding_sphere());
        assert_eq!(geometry.bounding_sphere, valid);
    }

    #[test]
    fn nan_positions_without_previous_bound_fall_back_to_empty() {
        let mut geometry =
            Geometry::from_triangles(vec![[f32::NAN, 0.0, 0.0], [0.0, 1.0, 0.0]], None);
        assert!(!geometry.compute_bounding_sphere());
        assert!(geometry.bounding_sphere.unwrap().is_empty());
    }

    #[test]
    fn element_count_respects_draw_range() {
        let mut geometry = Geometry::cuboid(1.0, 1.0, 1.0);
        assert_eq!(geometry.element_count(), 36);

        geometry.draw_range = DrawRange {
            start: 30,
            count: Some(12),
        };
        assert_eq!(geometry.element_count(), 6);
    }
}
