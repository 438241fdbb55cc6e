//! Shadow map sub-pass bookkeeping.
//!
//! Every shadow casting light owns an RGBA8 render target holding packed
//! depth (directional, spot) or packed distance to the light (point). Point
//! lights render six faces into cells of a 4x2 grid of the per-face size.
//! The renderer asks [`ShadowMapPass::prepare`] for the jobs of the frame
//! and draws the casters of each face itself.

use fxhash::{FxHashMap, FxHashSet};
use glam::{Mat4, UVec2, Vec3};

use super::device::{
    GraphicsDevice, RenderTargetDescriptor, RenderTargetId, TextureFormat, TextureId, Viewport,
};
use super::lights::{FrameLight, ShadowInfo};
use super::render_list::{culling_sphere, visit_visible, DrawItem};
use crate::asset::{GeometryGroup, Handle, Material, MaterialKind};
use crate::error::DeviceError;
use crate::scene::{
    Layers, LightKind, LightShadow, MaterialSlot, Renderable, Scene, ShadowProjection, Sphere,
};
use crate::settings::ShadowMapSettings;

/// Maps clip space xy to texture space; depth is left as is.
pub const SHADOW_BIAS: Mat4 = Mat4::from_cols_array(&[
    0.5, 0.0, 0.0, 0.0, //
    0.0, -0.5, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.5, 0.5, 0.0, 1.0,
]);

/// Point light faces: look direction, up vector and (column, row) cell.
const CUBE_FACES: [(Vec3, Vec3, (u32, u32)); 6] = [
    (Vec3::X, Vec3::Y, (2, 1)),
    (Vec3::NEG_X, Vec3::Y, (0, 1)),
    (Vec3::Z, Vec3::Y, (3, 1)),
    (Vec3::NEG_Z, Vec3::Y, (1, 1)),
    (Vec3::Y, Vec3::Z, (3, 0)),
    (Vec3::NEG_Y, Vec3::NEG_Z, (1, 0)),
];

/// Cleared value; unpacks to just above the farthest depth.
pub const SHADOW_CLEAR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowFace {
    pub view: Mat4,
    pub projection: Mat4,
    pub viewport: Viewport,
}

/// One light's work for this frame.
#[derive(Debug, Clone)]
pub struct ShadowJob {
    pub entity: hecs::Entity,
    pub target: RenderTargetId,
    pub faces: Vec<ShadowFace>,
    pub position: Vec3,
    pub near: f32,
    pub far: f32,
    /// Omni lights write distances instead of depth.
    pub point: bool,
    pub clip_shadows: bool,
}

struct ShadowEntry {
    target: RenderTargetId,
    target_size: UVec2,
    info: ShadowInfo,
}

pub struct ShadowMapPass {
    entries: FxHashMap<hecs::Entity, ShadowEntry>,
    depth_variants: [Material; 4],
    distance_variants: [Material; 4],
    /// Requests one render while `auto_update` is off.
    pub needs_update: bool,
}

impl Default for ShadowMapPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMapPass {
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            depth_variants: std::array::from_fn(|i| variant(MaterialKind::Depth, i)),
            distance_variants: std::array::from_fn(|i| variant(MaterialKind::Distance, i)),
            needs_update: false,
        }
    }

    /// Two bit index: bit 0 morph targets, bit 1 skinning.
    pub fn variant_index(morph: bool, skinned: bool) -> usize {
        usize::from(morph) | (usize::from(skinned) << 1)
    }

    pub fn depth_material(&self, morph: bool, skinned: bool) -> &Material {
        &self.depth_variants[Self::variant_index(morph, skinned)]
    }

    pub fn distance_material(&self, morph: bool, skinned: bool) -> &Material {
        &self.distance_variants[Self::variant_index(morph, skinned)]
    }

    /// Whether the sub-pass runs at all this frame.
    pub fn should_render(&self, settings: &ShadowMapSettings, lights: &[FrameLight]) -> bool {
        if !settings.enabled {
            return false;
        }
        if !settings.auto_update && !self.needs_update {
            return false;
        }
        lights.iter().any(casts_shadow)
    }

    /// Creates or resizes targets and computes cameras for every light whose
    /// shadow is due. Lights that stopped casting lose their targets.
    pub fn prepare(
        &mut self,
        device: &mut dyn GraphicsDevice,
        lights: &[FrameLight],
    ) -> Result<Vec<ShadowJob>, DeviceError> {
        self.prune(device, lights);

        let mut jobs = Vec::new();
        for frame_light in lights.iter().filter(|l| casts_shadow(l)) {
            let Some(shadow) = frame_light.light.shadow else {
                continue;
            };
            if !shadow.auto_update && !shadow.needs_update {
                continue;
            }

            let point = matches!(frame_light.light.kind, LightKind::Point { .. });
            let target_size = if point {
                UVec2::new(shadow.map_size.x * 4, shadow.map_size.y * 2)
            } else {
                shadow.map_size
            };

            let target = match self.entries.get(&frame_light.entity) {
                Some(entry) if entry.target_size == target_size => entry.target,
                existing => {
                    if let Some(entry) = existing {
                        device.delete_render_target(entry.target);
                    }
                    let target = device.create_render_target(&RenderTargetDescriptor {
                        label: format!("ShadowMap {:?}", frame_light.entity),
                        width: target_size.x,
                        height: target_size.y,
                        format: TextureFormat::Rgba8Unorm,
                    })?;
                    log::debug!(
                        "Shadow map for {} light {:?} at {}x{}",
                        frame_light.light.kind.name(),
                        frame_light.entity,
                        target_size.x,
                        target_size.y
                    );
                    target
                }
            };

            let (near, far) = clip_range(&frame_light.light.kind, &shadow);
            let faces = shadow_faces(frame_light, &shadow);
            let position = frame_light.position();
            let matrix = if point {
                Mat4::from_translation(-position)
            } else {
                faces
                    .first()
                    .map_or(Mat4::IDENTITY, |face| SHADOW_BIAS * face.projection * face.view)
            };

            self.entries.insert(
                frame_light.entity,
                ShadowEntry {
                    target,
                    target_size,
                    info: ShadowInfo {
                        matrix,
                        map_size: shadow.map_size,
                        near,
                        far,
                    },
                },
            );

            jobs.push(ShadowJob {
                entity: frame_light.entity,
                target,
                faces,
                position,
                near,
                far,
                point,
                clip_shadows: shadow.clip_shadows,
            });
        }

        self.needs_update = false;
        Ok(jobs)
    }

    pub fn shadow_info(&self, entity: hecs::Entity) -> Option<ShadowInfo> {
        self.entries.get(&entity).map(|entry| entry.info)
    }

    pub fn shadow_texture(
        &self,
        device: &dyn GraphicsDevice,
        entity: hecs::Entity,
    ) -> Option<TextureId> {
        self.entries
            .get(&entity)
            .and_then(|entry| device.render_target_texture(entry.target))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every target without touching the device.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn dispose(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.entries.drain() {
            device.delete_render_target(entry.target);
        }
    }

    /// Deletes the targets of lights that no longer cast shadows.
    pub fn prune(&mut self, device: &mut dyn GraphicsDevice, lights: &[FrameLight]) {
        let casting: FxHashSet<hecs::Entity> = lights
            .iter()
            .filter(|l| casts_shadow(l))
            .map(|l| l.entity)
            .collect();
        self.entries.retain(|entity, entry| {
            let keep = casting.contains(entity);
            if !keep {
                device.delete_render_target(entry.target);
            }
            keep
        });
    }
}

/// Shadow casting draw work of the whole scene with its world bounds, tested
/// per face against the shadow camera frustum.
pub(crate) fn collect_casters(scene: &Scene) -> Vec<(DrawItem, Option<Sphere>)> {
    let mut casters = Vec::new();
    let world = &scene.world;
    let assets = &scene.assets;

    visit_visible(scene, |entity, world_matrix| {
        let layers = world.get::<&Layers>(entity).map_or(Layers::default(), |l| *l);
        if !layers.test(Layers::default()) {
            return;
        }
        let Ok(renderable) = world.get::<&Renderable>(entity) else {
            return;
        };
        if !renderable.cast_shadow {
            return;
        }
        let Some(geometry) = assets.geometries.get(renderable.geometry) else {
            return;
        };
        let sphere = if renderable.frustum_culled {
            culling_sphere(&renderable, geometry, world_matrix)
        } else {
            None
        };

        let mut emit = |material: Handle<Material>, group: Option<GeometryGroup>| {
            if !assets.materials.get(material).is_some_and(|m| m.visible) {
                return;
            }
            let item = DrawItem {
                id: casters.len() as u32,
                entity,
                kind: renderable.kind,
                geometry: renderable.geometry,
                material,
                program: None,
                render_order: renderable.render_order,
                z: 0.0,
                group,
                world_matrix: *world_matrix,
                receive_shadow: false,
            };
            casters.push((item, sphere));
        };
        match &renderable.material {
            MaterialSlot::Single(material) => emit(*material, None),
            MaterialSlot::Multi(materials) => {
                for group in &geometry.groups {
                    if let Some(material) = materials.get(group.material_index) {
                        emit(*material, Some(*group));
                    }
                }
            }
        }
    });

    casters
}

fn variant(kind: MaterialKind, index: usize) -> Material {
    let mut material = Material::new(kind);
    material.name = format!("ShadowVariant{index}");
    material.morph_targets = index & 1 != 0;
    material.skinning = index & 2 != 0;
    material.fog = false;
    material.lights = false;
    material
}

fn casts_shadow(light: &FrameLight) -> bool {
    light.light.cast_shadow && light.light.kind.supports_shadows() && light.light.shadow.is_some()
}

/// Rectangles the faces of a light are rendered into, in pixels of its
/// shadow target.
pub fn face_viewports(kind: &LightKind, map_size: UVec2) -> Vec<Viewport> {
    let (w, h) = (map_size.x as f32, map_size.y as f32);
    match kind {
        LightKind::Point { .. } => CUBE_FACES
            .iter()
            .map(|&(_, _, (col, row))| Viewport::new(col as f32 * w, row as f32 * h, w, h))
            .collect(),
        _ => vec![Viewport::new(0.0, 0.0, w, h)],
    }
}

fn clip_range(kind: &LightKind, shadow: &LightShadow) -> (f32, f32) {
    let far = match kind {
        LightKind::Point { distance, .. } | LightKind::Spot { distance, .. } if *distance > 0.0 => {
            *distance
        }
        _ => shadow.far,
    };
    (shadow.near, far.max(shadow.near + f32::EPSILON))
}

fn shadow_faces(frame_light: &FrameLight, shadow: &LightShadow) -> Vec<ShadowFace> {
    let position = frame_light.position();
    let (near, far) = clip_range(&frame_light.light.kind, shadow);
    let viewports = face_viewports(&frame_light.light.kind, shadow.map_size);
    let aspect = shadow.map_size.x as f32 / shadow.map_size.y.max(1) as f32;

    match frame_light.light.kind {
        LightKind::Point { .. } => {
            let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far);
            CUBE_FACES
                .iter()
                .zip(viewports)
                .map(|(&(direction, up, _), viewport)| ShadowFace {
                    view: Mat4::look_at_rh(position, position + direction, up),
                    projection,
                    viewport,
                })
                .collect()
        }
        LightKind::Spot { target, angle, .. } => {
            let fov = (angle * 2.0).clamp(0.01, std::f32::consts::PI - 0.01);
            vec![ShadowFace {
                view: look_at(position, target),
                projection: Mat4::perspective_rh(fov, aspect, near, far),
                viewport: viewports[0],
            }]
        }
        LightKind::Directional { target } => {
            let projection = match shadow.projection {
                ShadowProjection::Orthographic {
                    left,
                    right,
                    bottom,
                    top,
                } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
                ShadowProjection::Perspective { fov_y } => {
                    Mat4::perspective_rh(fov_y, aspect, near, far)
                }
            };
            vec![ShadowFace {
                view: look_at(position, target),
                projection,
                viewport: viewports[0],
            }]
        }
        _ => Vec::new(),
    }
}

fn look_at(position: Vec3, target: Vec3) -> Mat4 {
    let direction = safe_normalize(target - position, Vec3::NEG_Y);
    Mat4::look_at_rh(position, position + direction, shadow_up(direction))
}

fn shadow_up(direction: Vec3) -> Vec3 {
    if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

fn safe_normalize(vec: Vec3, fallback: Vec3) -> Vec3 {
    if vec.length_squared() > 1e-6 {
        vec.normalize()
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::RecordingDevice;
    use crate::scene::Light;
    use glam::Vec4Swizzles;

    fn frame_light(world: &mut hecs::World, light: Light, position: Vec3) -> FrameLight {
        FrameLight {
            entity: world.spawn(()),
            light,
            world_matrix: Mat4::from_translation(position),
        }
    }

    #[test]
    fn omni_viewports_fill_distinct_grid_cells() {
        let size = UVec2::new(256, 128);
        let kind = LightKind::Point {
            distance: 0.0,
            decay: 2.0,
        };
        let viewports = face_viewports(&kind, size);
        assert_eq!(viewports.len(), 6);

        let mut cells = FxHashSet::default();
        for v in &viewports {
            assert_eq!((v.width, v.height), (256.0, 128.0));
            assert_eq!(v.x % 256.0, 0.0);
            assert_eq!(v.y % 128.0, 0.0);
            assert!(v.x + v.width <= 4.0 * 256.0);
            assert!(v.y + v.height <= 2.0 * 128.0);
            assert!(cells.insert(((v.x / 256.0) as u32, (v.y / 128.0) as u32)));
        }
        for (i, a) in viewports.iter().enumerate() {
            for b in &viewports[i + 1..] {
                let overlap_x = a.x < b.x + b.width && b.x < a.x + a.width;
                let overlap_y = a.y < b.y + b.height && b.y < a.y + a.height;
                assert!(!(overlap_x && overlap_y));
            }
        }
    }

    #[test]
    fn directional_light_has_one_full_viewport() {
        let viewports = face_viewports(&LightKind::Directional { target: Vec3::ZERO }, UVec2::splat(512));
        assert_eq!(viewports, vec![Viewport::new(0.0, 0.0, 512.0, 512.0)]);
    }

    #[test]
    fn variant_index_packs_morph_and_skinning() {
        assert_eq!(ShadowMapPass::variant_index(false, false), 0);
        assert_eq!(ShadowMapPass::variant_index(true, false), 1);
        assert_eq!(ShadowMapPass::variant_index(false, true), 2);
        assert_eq!(ShadowMapPass::variant_index(true, true), 3);

        let pass = ShadowMapPass::new();
        let material = pass.depth_material(true, true);
        assert!(material.morph_targets && material.skinning);
        assert_eq!(pass.distance_material(false, false).kind, MaterialKind::Distance);
    }

    #[test]
    fn directional_matrix_maps_target_to_texture_center() {
        let mut world = hecs::World::new();
        let light = frame_light(
            &mut world,
            Light::directional(Vec3::ONE, 1.0).with_shadow(),
            Vec3::new(0.0, 10.0, 0.0),
        );
        let mut device = RecordingDevice::new();
        let mut pass = ShadowMapPass::new();

        let jobs = pass.prepare(&mut device, &[light]).unwrap();
        assert_eq!(jobs.len(), 1);
        let info = pass.shadow_info(light.entity).unwrap();
        let uv = info.matrix * Vec3::ZERO.extend(1.0);
        assert!(uv.xy().abs_diff_eq(glam::Vec2::splat(0.5), 1e-5));
        assert!(uv.z > 0.0 && uv.z < 1.0);
    }

    #[test]
    fn point_light_matrix_is_inverse_translation() {
        let mut world = hecs::World::new();
        let position = Vec3::new(1.0, 2.0, 3.0);
        let light = frame_light(&mut world, Light::point(Vec3::ONE, 1.0, 0.0).with_shadow(), position);
        let mut device = RecordingDevice::new();
        let mut pass = ShadowMapPass::new();

        let jobs = pass.prepare(&mut device, &[light]).unwrap();
        assert_eq!(jobs[0].faces.len(), 6);
        assert!(jobs[0].point);
        let info = pass.shadow_info(light.entity).unwrap();
        assert!(info.matrix.abs_diff_eq(Mat4::from_translation(-position), 1e-6));
    }

    #[test]
    fn target_is_recreated_only_on_size_change() {
        let mut world = hecs::World::new();
        let mut light = frame_light(
            &mut world,
            Light::directional(Vec3::ONE, 1.0).with_shadow(),
            Vec3::Y,
        );
        let mut device = RecordingDevice::new();
        let mut pass = ShadowMapPass::new();

        let first = pass.prepare(&mut device, &[light]).unwrap()[0].target;
        let second = pass.prepare(&mut device, &[light]).unwrap()[0].target;
        assert_eq!(first, second);

        if let Some(shadow) = light.light.shadow.as_mut() {
            shadow.map_size = UVec2::splat(1024);
        }
        let third = pass.prepare(&mut device, &[light]).unwrap()[0].target;
        assert_ne!(first, third);
        assert_eq!(pass.len(), 1);
    }

    #[test]
    fn disabled_or_idle_pass_is_skipped() {
        let mut world = hecs::World::new();
        let light = frame_light(
            &mut world,
            Light::directional(Vec3::ONE, 1.0).with_shadow(),
            Vec3::Y,
        );
        let pass = ShadowMapPass::new();
        let mut settings = ShadowMapSettings {
            enabled: true,
            ..ShadowMapSettings::default()
        };
        assert!(pass.should_render(&settings, &[light]));

        settings.auto_update = false;
        assert!(!pass.should_render(&settings, &[light]));

        settings.auto_update = true;
        settings.enabled = false;
        assert!(!pass.should_render(&settings, &[light]));

        let unlit = frame_light(&mut world, Light::directional(Vec3::ONE, 1.0), Vec3::Y);
        settings.enabled = true;
        assert!(!pass.should_render(&settings, &[unlit]));
    }

    #[test]
    fn lights_that_stop_casting_release_their_target() {
        let mut world = hecs::World::new();
        let mut light = frame_light(
            &mut world,
            Light::directional(Vec3::ONE, 1.0).with_shadow(),
            Vec3::Y,
        );
        let mut device = RecordingDevice::new();
        let mut pass = ShadowMapPass::new();
        pass.prepare(&mut device, &[light]).unwrap();
        assert_eq!(device.live_textures(), 1);

        light.light.cast_shadow = false;
        pass.prepare(&mut device, &[light]).unwrap();
        assert!(pass.is_empty());
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn casters_skip_non_casting_and_hidden_objects() {
        use crate::asset::Geometry;
        use crate::scene::{Transform, Visible};

        let mut scene = Scene::new();
        let geometry = scene.assets.geometries.insert(Geometry::cuboid(1.0, 1.0, 1.0));
        let material = scene
            .assets
            .materials
            .insert(Material::basic(Vec3::ONE));
        let mut casting = Renderable::mesh(geometry, material);
        casting.cast_shadow = true;

        let caster = scene
            .entity()
            .with_transform(Transform::default())
            .with_renderable(casting.clone())
            .spawn();
        scene
            .entity()
            .with_renderable(Renderable::mesh(geometry, material))
            .spawn();
        let hidden = scene.entity().with_renderable(casting).spawn();
        scene.world.insert_one(hidden, Visible(false)).unwrap();
        scene.update_world_transforms();

        let casters = collect_casters(&scene);
        assert_eq!(casters.len(), 1);
        assert_eq!(casters[0].0.entity, caster);
    }
}
