use glam::{Mat4, Vec4};

use crate::asset::Material;
use crate::scene::Plane;

/// Plane counts a program is compiled for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClippingCounts {
    pub num_planes: u32,
    pub num_intersection: u32,
}

/// Last projection of a material's local planes.
#[derive(Clone, Debug, Default)]
pub struct ClippingCache {
    source: Vec<Plane>,
    view: Option<Mat4>,
    projected: Vec<Vec4>,
}

/// Active clip planes for the next draw, in view space.
///
/// The effective list is the material's local planes followed by the global
/// planes. Local planes only apply when local clipping is enabled.
#[derive(Default)]
pub struct ClippingState {
    global_planes: Vec<Plane>,
    global_projected: Vec<Vec4>,
    num_global_planes: u32,
    local_enabled: bool,
    rendering_shadows: bool,
    uniform: Vec<Vec4>,
    pub num_planes: u32,
    pub num_intersection: u32,
}

impl ClippingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether clipping is in play at all this frame.
    pub fn init(&mut self, planes: &[Plane], enable_local: bool) -> bool {
        let enabled = !planes.is_empty() || enable_local;
        self.global_planes.clear();
        self.global_planes.extend_from_slice(planes);
        self.num_global_planes = planes.len() as u32;
        self.local_enabled = enable_local;
        enabled
    }

    pub fn begin_shadows(&mut self) {
        self.rendering_shadows = true;
        self.project_none();
    }

    pub fn end_shadows(&mut self) {
        self.rendering_shadows = false;
        self.reset_global_state();
    }

    pub fn is_rendering_shadows(&self) -> bool {
        self.rendering_shadows
    }

    /// Projects the global planes into the space of `view`.
    pub fn set_global_state(&mut self, view: &Mat4) {
        self.global_projected.clear();
        self.global_projected
            .extend(self.global_planes.iter().map(|plane| project(plane, view)));
        self.reset_global_state();
    }

    /// Sets the planes for drawing with `material`.
    ///
    /// `shadow_clip_global` is the light shadow's request to keep global
    /// planes during the shadow pass; it is ignored outside of it.
    pub fn set_state(
        &mut self,
        material: &Material,
        cache: &mut ClippingCache,
        view: &Mat4,
        use_cache: bool,
        shadow_clip_global: bool,
    ) {
        let planes = &material.clipping_planes;
        let keep_global = !self.rendering_shadows || shadow_clip_global;

        if !self.local_enabled
            || planes.is_empty()
            || (self.rendering_shadows && !material.clip_shadows)
        {
            if self.rendering_shadows {
                if keep_global {
                    self.reset_global_state();
                } else {
                    self.project_none();
                }
            } else {
                self.reset_global_state();
            }
            return;
        }

        let cached = use_cache
            && cache.view.as_ref() == Some(view)
            && cache.source.as_slice() == planes.as_slice();
        if !cached {
            cache.source.clear();
            cache.source.extend_from_slice(planes);
            cache.projected.clear();
            cache
                .projected
                .extend(planes.iter().map(|plane| project(plane, view)));
            cache.view = Some(*view);
        }

        let global = if keep_global {
            self.global_projected.as_slice()
        } else {
            &[]
        };

        self.uniform.clear();
        self.uniform.extend_from_slice(&cache.projected);
        self.uniform.extend_from_slice(global);

        let local = planes.len() as u32;
        self.num_intersection = if material.clip_intersection { local } else { 0 };
        self.num_planes = local + global.len() as u32;
    }

    pub fn counts(&self) -> ClippingCounts {
        ClippingCounts {
            num_planes: self.num_planes,
            num_intersection: self.num_intersection,
        }
    }

    pub fn uniform(&self) -> &[Vec4] {
        &self.uniform
    }

    /// Uniform blob; at least one zeroed plane.
    pub fn uniform_bytes(&self) -> Vec<u8> {
        if self.uniform.is_empty() {
            return vec![0; std::mem::size_of::<Vec4>()];
        }
        let planes: Vec<[f32; 4]> = self.uniform.iter().map(|p| p.to_array()).collect();
        bytemuck::cast_slice(&planes).to_vec()
    }

    fn reset_global_state(&mut self) {
        self.uniform.clear();
        self.uniform.extend_from_slice(&self.global_projected);
        self.num_planes = self.global_projected.len() as u32;
        self.num_intersection = 0;
    }

    fn project_none(&mut self) {
        self.uniform.clear();
        self.num_planes = 0;
        self.num_intersection = 0;
    }
}

fn project(plane: &Plane, view: &Mat4) -> Vec4 {
    plane.apply_matrix(view).to_vec4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn planes(n: usize) -> Vec<Plane> {
        (0..n)
            .map(|i| Plane::new(Vec3::X, i as f32))
            .collect()
    }

    fn material_with(local: usize) -> Material {
        Material::basic(Vec3::ONE).with_clipping_planes(planes(local))
    }

    #[test]
    fn local_plus_global_plane_count() {
        let mut state = ClippingState::new();
        assert!(state.init(&planes(2), true));
        state.set_global_state(&Mat4::IDENTITY);

        let material = material_with(3);
        let mut cache = ClippingCache::default();
        state.set_state(&material, &mut cache, &Mat4::IDENTITY, false, false);

        assert_eq!(state.num_planes, 5);
        assert_eq!(state.num_intersection, 0);
        assert_eq!(state.uniform().len(), 5);
    }

    #[test]
    fn intersection_counts_local_planes() {
        let mut state = ClippingState::new();
        state.init(&planes(1), true);
        state.set_global_state(&Mat4::IDENTITY);

        let mut material = material_with(2);
        material.clip_intersection = true;
        state.set_state(&material, &mut ClippingCache::default(), &Mat4::IDENTITY, false, false);

        assert_eq!(state.counts(), ClippingCounts {
            num_planes: 3,
            num_intersection: 2,
        });
    }

    #[test]
    fn local_planes_ignored_when_disabled() {
        let mut state = ClippingState::new();
        state.init(&planes(2), false);
        state.set_global_state(&Mat4::IDENTITY);
        state.set_state(&material_with(4), &mut ClippingCache::default(), &Mat4::IDENTITY, false, false);

        assert_eq!(state.num_planes, 2);
    }

    #[test]
    fn shadow_pass_suspends_global_planes() {
        let mut state = ClippingState::new();
        state.init(&planes(2), true);
        state.set_global_state(&Mat4::IDENTITY);
        state.begin_shadows();

        state.set_state(&material_with(0), &mut ClippingCache::default(), &Mat4::IDENTITY, false, false);
        assert_eq!(state.num_planes, 0);

        state.set_state(&material_with(0), &mut ClippingCache::default(), &Mat4::IDENTITY, false, true);
        assert_eq!(state.num_planes, 2);

        let mut clipped = material_with(3);
        clipped.clip_shadows = true;
        state.set_state(&clipped, &mut ClippingCache::default(), &Mat4::IDENTITY, false, false);
        assert_eq!(state.num_planes, 3);

        let unclipped = material_with(3);
        state.set_state(&unclipped, &mut ClippingCache::default(), &Mat4::IDENTITY, false, false);
        assert_eq!(state.num_planes, 0);

        state.end_shadows();
        assert_eq!(state.num_planes, 2);
    }

    #[test]
    fn planes_are_projected_into_view_space() {
        let mut state = ClippingState::new();
        state.init(&[Plane::new(Vec3::Y, 0.0)], false);
        let view = Mat4::from_translation(Vec3::new(0.0, -2.0, 0.0));
        state.set_global_state(&view);

        let plane = state.uniform()[0];
        assert!(plane.truncate().abs_diff_eq(Vec3::Y, 1e-6));
        assert!((plane.w - 2.0).abs() < 1e-5);
    }

    #[test]
    fn cached_projection_is_reused_for_same_view() {
        let mut state = ClippingState::new();
        state.init(&[], true);
        state.set_global_state(&Mat4::IDENTITY);
        let material = material_with(1);
        let mut cache = ClippingCache::default();

        state.set_state(&material, &mut cache, &Mat4::IDENTITY, true, false);
        let first = state.uniform().to_vec();
        state.set_state(&material, &mut cache, &Mat4::IDENTITY, true, false);
        assert_eq!(state.uniform(), first.as_slice());

        let moved = Mat4::from_translation(Vec3::X);
        state.set_state(&material, &mut cache, &moved, true, false);
        assert_ne!(state.uniform(), first.as_slice());
    }
}
