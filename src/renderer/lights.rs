use std::hash::{Hash, Hasher};

use bytemuck::{Pod, Zeroable};
use fxhash::{FxHashMap, FxHashSet, FxHasher};
use glam::{Mat3, Mat4, UVec2, Vec3};

use crate::scene::{Light, LightKind};

/// A light found while projecting the scene.
#[derive(Clone, Copy, Debug)]
pub struct FrameLight {
    pub entity: hecs::Entity,
    pub light: Light,
    pub world_matrix: Mat4,
}

impl FrameLight {
    pub fn position(&self) -> Vec3 {
        self.world_matrix.w_axis.truncate()
    }
}

/// Output of the shadow pass for one light.
#[derive(Clone, Copy, Debug)]
pub struct ShadowInfo {
    pub matrix: Mat4,
    pub map_size: UVec2,
    pub near: f32,
    pub far: f32,
}

/// Per-kind light and shadow counts. Programs depend on these, so any change
/// invalidates them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LightCounts {
    pub directional: u32,
    pub point: u32,
    pub spot: u32,
    pub hemisphere: u32,
    pub rect_area: u32,
    pub directional_shadows: u32,
    pub point_shadows: u32,
    pub spot_shadows: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightRaw {
    pub direction_shadow: [f32; 4],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightRaw {
    pub position_distance: [f32; 4],
    pub color_decay: [f32; 4],
    pub shadow: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SpotLightRaw {
    pub position_distance: [f32; 4],
    pub direction_cone_cos: [f32; 4],
    pub color_penumbra_cos: [f32; 4],
    pub decay_shadow: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct HemisphereLightRaw {
    pub direction: [f32; 4],
    pub sky_color: [f32; 4],
    pub ground_color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RectAreaLightRaw {
    pub position: [f32; 4],
    pub half_width: [f32; 4],
    pub half_height: [f32; 4],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ShadowRaw {
    pub matrix: [[f32; 4]; 4],
    /// bias, normal bias, radius, map width
    pub params: [f32; 4],
    /// map height, near, far, unused
    pub extra: [f32; 4],
}

impl ShadowRaw {
    fn from_info(info: &ShadowInfo, light: &Light) -> Self {
        let (bias, normal_bias, radius) = light
            .shadow
            .map(|s| (s.bias, s.normal_bias, s.radius))
            .unwrap_or((0.0, 0.0, 1.0));
        Self {
            matrix: info.matrix.to_cols_array_2d(),
            params: [bias, normal_bias, radius, info.map_size.x as f32],
            extra: [info.map_size.y as f32, info.near, info.far, 0.0],
        }
    }
}

/// Cached per-light record; its shape follows the light kind.
#[derive(Clone, Copy, Debug, PartialEq)]
enum LightRecord {
    Directional(DirectionalLightRaw),
    Point(PointLightRaw),
    Spot(SpotLightRaw),
    Hemisphere(HemisphereLightRaw),
    RectArea(RectAreaLightRaw),
}

impl LightRecord {
    fn for_kind(kind: &LightKind) -> Option<Self> {
        Some(match kind {
            LightKind::Ambient => return None,
            LightKind::Directional { .. } => Self::Directional(Default::default()),
            LightKind::Point { .. } => Self::Point(Default::default()),
            LightKind::Spot { .. } => Self::Spot(Default::default()),
            LightKind::Hemisphere { .. } => Self::Hemisphere(Default::default()),
            LightKind::RectArea { .. } => Self::RectArea(Default::default()),
        })
    }

    fn matches(&self, kind: &LightKind) -> bool {
        matches!(
            (self, kind),
            (Self::Directional(_), LightKind::Directional { .. })
                | (Self::Point(_), LightKind::Point { .. })
                | (Self::Spot(_), LightKind::Spot { .. })
                | (Self::Hemisphere(_), LightKind::Hemisphere { .. })
                | (Self::RectArea(_), LightKind::RectArea { .. })
        )
    }
}

/// World-space vectors kept so view-space fields can be rewritten per camera.
#[derive(Clone, Copy, Debug)]
struct WorldVectors {
    position: Vec3,
    direction: Vec3,
    half_width: Vec3,
    half_height: Vec3,
}

/// Packs the frame's lights into uniform arrays.
///
/// `setup` runs once per frame after the shadow pass; `setup_view` rewrites
/// positions and directions into the space of each camera that draws.
#[derive(Default)]
pub struct LightsState {
    records: FxHashMap<hecs::Entity, LightRecord>,

    pub ambient: Vec3,
    pub directional: Vec<DirectionalLightRaw>,
    pub point: Vec<PointLightRaw>,
    pub spot: Vec<SpotLightRaw>,
    pub hemisphere: Vec<HemisphereLightRaw>,
    pub rect_area: Vec<RectAreaLightRaw>,
    pub directional_shadows: Vec<ShadowRaw>,
    pub point_shadows: Vec<ShadowRaw>,
    pub spot_shadows: Vec<ShadowRaw>,

    world_directional: Vec<WorldVectors>,
    world_point: Vec<WorldVectors>,
    world_spot: Vec<WorldVectors>,
    world_hemisphere: Vec<WorldVectors>,
    world_rect_area: Vec<WorldVectors>,

    pub counts: LightCounts,
    pub hash: u64,
}

impl LightsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `shadow_of` returns the shadow pass output for a light, if any.
    pub fn setup(
        &mut self,
        lights: &[FrameLight],
        shadow_of: impl Fn(hecs::Entity) -> Option<ShadowInfo>,
    ) {
        self.ambient = Vec3::ZERO;
        self.directional.clear();
        self.point.clear();
        self.spot.clear();
        self.hemisphere.clear();
        self.rect_area.clear();
        self.directional_shadows.clear();
        self.point_shadows.clear();
        self.spot_shadows.clear();
        self.world_directional.clear();
        self.world_point.clear();
        self.world_spot.clear();
        self.world_hemisphere.clear();
        self.world_rect_area.clear();

        let mut seen = FxHashSet::default();

        for frame_light in lights {
            let light = &frame_light.light;
            let color = light.color * light.intensity;

            if matches!(light.kind, LightKind::Ambient) {
                self.ambient += color;
                continue;
            }

            let Some(fresh) = LightRecord::for_kind(&light.kind) else {
                continue;
            };
            seen.insert(frame_light.entity);
            let record = self.records.entry(frame_light.entity).or_insert(fresh);
            if !record.matches(&light.kind) {
                *record = fresh;
            }

            let position = frame_light.position();
            let rotation = Mat3::from_mat4(frame_light.world_matrix);
            let shadow = if light.cast_shadow {
                shadow_of(frame_light.entity).map(|info| ShadowRaw::from_info(&info, light))
            } else {
                None
            };

            match (record, light.kind) {
                (LightRecord::Directional(raw), LightKind::Directional { target }) => {
                    let shadow_index = push_shadow(&mut self.directional_shadows, shadow);
                    raw.direction_shadow[3] = shadow_index;
                    raw.color = color.extend(0.0).to_array();
                    self.directional.push(*raw);
                    self.world_directional.push(WorldVectors {
                        position,
                        direction: (position - target).normalize_or_zero(),
                        half_width: Vec3::ZERO,
                        half_height: Vec3::ZERO,
                    });
                }
                (LightRecord::Point(raw), LightKind::Point { distance, decay }) => {
                    raw.position_distance[3] = distance;
                    raw.color_decay = color.extend(decay).to_array();
                    raw.shadow[0] = push_shadow(&mut self.point_shadows, shadow);
                    self.point.push(*raw);
                    self.world_point.push(WorldVectors {
                        position,
                        direction: Vec3::ZERO,
                        half_width: Vec3::ZERO,
                        half_height: Vec3::ZERO,
                    });
                }
                (
                    LightRecord::Spot(raw),
                    LightKind::Spot {
                        target,
                        distance,
                        decay,
                        angle,
                        penumbra,
                    },
                ) => {
                    raw.position_distance[3] = distance;
                    raw.direction_cone_cos[3] = angle.cos();
                    raw.color_penumbra_cos = color
                        .extend((angle * (1.0 - penumbra)).cos())
                        .to_array();
                    raw.decay_shadow[0] = decay;
                    raw.decay_shadow[1] = push_shadow(&mut self.spot_shadows, shadow);
                    self.spot.push(*raw);
                    self.world_spot.push(WorldVectors {
                        position,
                        direction: (position - target).normalize_or_zero(),
                        half_width: Vec3::ZERO,
                        half_height: Vec3::ZERO,
                    });
                }
                (LightRecord::Hemisphere(raw), LightKind::Hemisphere { ground_color }) => {
                    raw.sky_color = color.extend(0.0).to_array();
                    raw.ground_color = (ground_color * light.intensity).extend(0.0).to_array();
                    self.hemisphere.push(*raw);
                    self.world_hemisphere.push(WorldVectors {
                        position,
                        direction: position.normalize_or_zero(),
                        half_width: Vec3::ZERO,
                        half_height: Vec3::ZERO,
                    });
                }
                (LightRecord::RectArea(raw), LightKind::RectArea { width, height }) => {
                    raw.color = color.extend(0.0).to_array();
                    self.rect_area.push(*raw);
                    self.world_rect_area.push(WorldVectors {
                        position,
                        direction: Vec3::ZERO,
                        half_width: rotation * Vec3::new(width * 0.5, 0.0, 0.0),
                        half_height: rotation * Vec3::new(0.0, height * 0.5, 0.0),
                    });
                }
                _ => {}
            }
        }

        self.records.retain(|entity, _| seen.contains(entity));

        self.counts = LightCounts {
            directional: self.directional.len() as u32,
            point: self.point.len() as u32,
            spot: self.spot.len() as u32,
            hemisphere: self.hemisphere.len() as u32,
            rect_area: self.rect_area.len() as u32,
            directional_shadows: self.directional_shadows.len() as u32,
            point_shadows: self.point_shadows.len() as u32,
            spot_shadows: self.spot_shadows.len() as u32,
        };
        let mut hasher = FxHasher::default();
        self.counts.hash(&mut hasher);
        self.hash = hasher.finish();
    }

    /// Rewrites positions and directions into view space.
    pub fn setup_view(&mut self, view: &Mat4) {
        let view_rotation = Mat3::from_mat4(*view);
        let to_view_point = |p: Vec3| view.transform_point3(p);
        let to_view_dir = |d: Vec3| (view_rotation * d).normalize_or_zero();

        for (raw, world) in self.directional.iter_mut().zip(&self.world_directional) {
            let d = to_view_dir(world.direction);
            raw.direction_shadow[..3].copy_from_slice(&d.to_array());
        }
        for (raw, world) in self.point.iter_mut().zip(&self.world_point) {
            let p = to_view_point(world.position);
            raw.position_distance[..3].copy_from_slice(&p.to_array());
        }
        for (raw, world) in self.spot.iter_mut().zip(&self.world_spot) {
            let p = to_view_point(world.position);
            let d = to_view_dir(world.direction);
            raw.position_distance[..3].copy_from_slice(&p.to_array());
            raw.direction_cone_cos[..3].copy_from_slice(&d.to_array());
        }
        for (raw, world) in self.hemisphere.iter_mut().zip(&self.world_hemisphere) {
            let d = to_view_dir(world.direction);
            raw.direction[..3].copy_from_slice(&d.to_array());
        }
        for (raw, world) in self.rect_area.iter_mut().zip(&self.world_rect_area) {
            raw.position[..3].copy_from_slice(&to_view_point(world.position).to_array());
            raw.half_width[..3].copy_from_slice(&(view_rotation * world.half_width).to_array());
            raw.half_height[..3].copy_from_slice(&(view_rotation * world.half_height).to_array());
        }
    }

    /// Uniform blob. Every array takes at least one (zeroed) element so the
    /// shader layout never has zero-sized arrays.
    pub fn uniform_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1024);
        bytes.extend_from_slice(bytemuck::bytes_of(&self.ambient.extend(0.0).to_array()));
        append_padded(&mut bytes, &self.directional);
        append_padded(&mut bytes, &self.point);
        append_padded(&mut bytes, &self.spot);
        append_padded(&mut bytes, &self.hemisphere);
        append_padded(&mut bytes, &self.rect_area);
        append_padded(&mut bytes, &self.directional_shadows);
        append_padded(&mut bytes, &self.point_shadows);
        append_padded(&mut bytes, &self.spot_shadows);
        bytes
    }

    pub fn tracked_lights(&self) -> usize {
        self.records.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn push_shadow(shadows: &mut Vec<ShadowRaw>, shadow: Option<ShadowRaw>) -> f32 {
    match shadow {
        Some(shadow) => {
            shadows.push(shadow);
            (shadows.len() - 1) as f32
        }
        None => -1.0,
    }
}

fn append_padded<T: Pod + Zeroable>(bytes: &mut Vec<u8>, items: &[T]) {
    if items.is_empty() {
        bytes.extend_from_slice(bytemuck::bytes_of(&T::zeroed()));
    } else {
        bytes.extend_from_slice(bytemuck::cast_slice(items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hecs::World;

    fn frame_light(world: &mut World, light: Light, position: Vec3) -> FrameLight {
        FrameLight {
            entity: world.spawn(()),
            light,
            world_matrix: Mat4::from_translation(position),
        }
    }

    #[test]
    fn ambient_lights_are_summed() {
        let mut world = World::new();
        let lights = vec![
            frame_light(&mut world, Light::ambient(Vec3::new(1.0, 0.0, 0.0), 0.5), Vec3::ZERO),
            frame_light(&mut world, Light::ambient(Vec3::new(0.0, 1.0, 0.0), 2.0), Vec3::ZERO),
        ];
        let mut state = LightsState::new();
        state.setup(&lights, |_| None);

        assert_eq!(state.ambient, Vec3::new(0.5, 2.0, 0.0));
        assert_eq!(state.counts, LightCounts::default());
        assert_eq!(state.tracked_lights(), 0);
    }

    #[test]
    fn hash_changes_with_counts_only() {
        let mut world = World::new();
        let point = frame_light(&mut world, Light::point(Vec3::ONE, 1.0, 10.0), Vec3::ONE);
        let mut state = LightsState::new();

        state.setup(&[point], |_| None);
        let one_point = state.hash;

        let mut brighter = point;
        brighter.light.intensity = 5.0;
        state.setup(&[brighter], |_| None);
        assert_eq!(state.hash, one_point);

        let spot = frame_light(&mut world, Light::spot(Vec3::ONE, 1.0, 0.5, 0.2), Vec3::Y);
        state.setup(&[brighter, spot], |_| None);
        assert_ne!(state.hash, one_point);
        assert_eq!(state.counts.spot, 1);
    }

    #[test]
    fn spot_cone_cosines() {
        let mut world = World::new();
        let spot = frame_light(&mut world, Light::spot(Vec3::ONE, 1.0, 0.6, 0.5), Vec3::Y);
        let mut state = LightsState::new();
        state.setup(&[spot], |_| None);

        let raw = state.spot[0];
        assert_relative_eq!(raw.direction_cone_cos[3], 0.6f32.cos());
        assert_relative_eq!(raw.color_penumbra_cos[3], 0.3f32.cos());
        assert_eq!(raw.decay_shadow[1], -1.0);
    }

    #[test]
    fn view_space_positions_follow_camera() {
        let mut world = World::new();
        let point = frame_light(&mut world, Light::point(Vec3::ONE, 1.0, 0.0), Vec3::new(0.0, 0.0, -5.0));
        let mut state = LightsState::new();
        state.setup(&[point], |_| None);

        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        state.setup_view(&view);
        assert_relative_eq!(state.point[0].position_distance[2], -10.0, epsilon = 1e-5);
    }

    #[test]
    fn shadow_fields_only_for_casting_lights() {
        let mut world = World::new();
        let caster = frame_light(&mut world, Light::directional(Vec3::ONE, 1.0).with_shadow(), Vec3::Y);
        let plain = frame_light(&mut world, Light::directional(Vec3::ONE, 1.0), Vec3::Y);
        let info = ShadowInfo {
            matrix: Mat4::IDENTITY,
            map_size: UVec2::splat(512),
            near: 0.5,
            far: 500.0,
        };
        let mut state = LightsState::new();
        state.setup(&[caster, plain], |_| Some(info));

        assert_eq!(state.counts.directional, 2);
        assert_eq!(state.counts.directional_shadows, 1);
        assert_eq!(state.directional[0].direction_shadow[3], 0.0);
        assert_eq!(state.directional[1].direction_shadow[3], -1.0);
    }

    #[test]
    fn empty_arrays_are_padded_in_blob_only() {
        let state = LightsState::new();
        let expected = 16
            + std::mem::size_of::<DirectionalLightRaw>()
            + std::mem::size_of::<PointLightRaw>()
            + std::mem::size_of::<SpotLightRaw>()
            + std::mem::size_of::<HemisphereLightRaw>()
            + std::mem::size_of::<RectAreaLightRaw>()
            + 3 * std::mem::size_of::<ShadowRaw>();
        assert_eq!(state.uniform_bytes().len(), expected);
        assert!(state.directional.is_empty());
    }

    #[test]
    fn records_are_released_with_their_lights() {
        let mut world = World::new();
        let a = frame_light(&mut world, Light::point(Vec3::ONE, 1.0, 0.0), Vec3::ZERO);
        let b = frame_light(&mut world, Light::point(Vec3::ONE, 1.0, 0.0), Vec3::ZERO);
        let mut state = LightsState::new();

        state.setup(&[a, b], |_| None);
        assert_eq!(state.tracked_lights(), 2);
        state.setup(&[a], |_| None);
        assert_eq!(state.tracked_lights(), 1);
    }
}
