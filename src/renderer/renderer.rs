// renderer/renderer.rs
use std::hash::{Hash, Hasher};

use fxhash::FxHasher;
use glam::Mat4;

use super::cache::{AttributeCache, GeometryCache, TextureCache};
use super::clipping::ClippingState;
use super::device::{
    BlendMode, BufferId, BufferKind, CullMode, DrawCall, GraphicsDevice, IndexFormat,
    PipelineState, ScissorRect, TextureId, Topology, UniformSlot, VertexAttributeLayout,
    VertexBinding, VertexStep, Viewport,
};
use super::info::RenderInfo;
use super::lights::{FrameLight, LightCounts, LightsState, ShadowInfo};
use super::programs::{
    MapBinding, ProgramCache, ProgramFeatures, ProgramParameters, ShadowUnits, VertexInput,
};
use super::properties::{ProgramTrigger, PropertiesStore};
use super::render_list::{
    painter_sort_stable, project_scene, reverse_painter_sort_stable, DrawItem, Projection,
    RenderList, RenderLists, SortFn,
};
use super::shader::locations;
use super::shadows::{collect_casters, ShadowMapPass, SHADOW_CLEAR};
use super::state::GpuState;
use super::uniforms::{skinning_bytes, CameraUniform, MaterialUniform, ObjectUniform};
use crate::asset::{
    Attribute, Blending, ElementType, Handle, Material, MaterialKind, Side, TextureEncoding,
};
use crate::asset::geometry::{COLOR, NORMAL, POSITION, SKIN_INDEX, SKIN_WEIGHT, UV};
use crate::error::{DeviceError, RenderError};
use crate::scene::{
    Camera, DrawableKind, Fog, Frustum, InstanceMatrices, Light, LightKind,
    MorphTargetInfluences, Plane, Scene, Skeleton,
};
use crate::settings::{RenderSettings, ToneMapping};

/// vec4 slots the vertex stage keeps for everything that is not a bone.
const RESERVED_VERTEX_VECTORS: u32 = 20;

const MORPH_TARGET_NAMES: [&str; 4] = [
    "morph_target0",
    "morph_target1",
    "morph_target2",
    "morph_target3",
];
const MORPH_NORMAL_NAMES: [&str; 2] = ["morph_normal0", "morph_normal1"];
const INSTANCE_MATRIX_NAMES: [&str; 4] = [
    "instance_matrix0",
    "instance_matrix1",
    "instance_matrix2",
    "instance_matrix3",
];

/// Shadow map textures of the frame in the order the light uniforms
/// reference them.
#[derive(Default)]
struct ShadowMaps {
    directional: Vec<Option<TextureId>>,
    spot: Vec<Option<TextureId>>,
    point: Vec<Option<TextureId>>,
}

impl ShadowMaps {
    fn clear(&mut self) {
        self.directional.clear();
        self.spot.clear();
        self.point.clear();
    }

    fn total(&self) -> usize {
        self.directional.len() + self.spot.len() + self.point.len()
    }
}

#[derive(Clone, Copy)]
struct ShadowDraw {
    point: bool,
    clip_global: bool,
}

#[derive(Clone, Copy)]
struct Pass {
    view: Mat4,
    shadow: Option<ShadowDraw>,
    /// Resolve programs only.
    compile_only: bool,
}

struct VertexLayout {
    inputs: Vec<VertexInput>,
    bindings: Vec<VertexBinding>,
}

impl VertexLayout {
    fn bind(
        &mut self,
        attributes: &AttributeCache,
        attribute: &Attribute,
        location: u32,
        name: &'static str,
        accepted: &[&str],
    ) -> bool {
        let Some(wgsl_type) = wgsl_type(attribute) else {
            return false;
        };
        if !accepted.is_empty() && !accepted.contains(&wgsl_type) {
            log::warn!(
                "Attribute '{}' has unsupported type {}; ignoring it",
                name,
                wgsl_type
            );
            return false;
        }
        let Some(gpu) = attributes.get(&attribute.id) else {
            return false;
        };
        self.inputs.push(VertexInput {
            location,
            name,
            wgsl_type,
        });
        self.bindings.push(VertexBinding {
            location,
            buffer: gpu.buffer,
            layout: VertexAttributeLayout {
                element_type: gpu.element_type,
                components: attribute.item_size,
                normalized: attribute.normalized,
                step: VertexStep::Vertex,
            },
        });
        true
    }
}

/// Retained-mode scene renderer.
///
/// Owns the graphics device and every GPU-side cache. Scene data is only
/// read, apart from version bookkeeping on attributes and the `needs_update`
/// flags of light shadows.
///
/// Every frame entry point takes `&mut self`, so a frame cannot start while
/// another one on the same renderer is still recording.
pub struct Renderer<D: GraphicsDevice> {
    device: D,
    settings: RenderSettings,
    size: (u32, u32),
    viewport: Viewport,
    scissor: Viewport,
    scissor_test: bool,
    clipping_planes: Vec<Plane>,

    attributes: AttributeCache,
    geometries: GeometryCache,
    textures: TextureCache,
    programs: ProgramCache,
    properties: PropertiesStore,
    lights: LightsState,
    clipping: ClippingState,
    shadows: ShadowMapPass,
    render_lists: RenderLists,
    state: GpuState,

    frame_lights: Vec<FrameLight>,
    shadow_maps: ShadowMaps,
    opaque_sort: SortFn,
    transparent_sort: SortFn,
    info: RenderInfo,
}

impl<D: GraphicsDevice> Renderer<D> {
    pub fn new(device: D, settings: RenderSettings) -> Self {
        let settings = settings.validate();
        let (width, height) = device.size();
        let ratio = settings.pixel_ratio;
        let size = (
            ((width as f32 / ratio).round() as u32).max(1),
            ((height as f32 / ratio).round() as u32).max(1),
        );
        let full = Viewport::new(0.0, 0.0, size.0 as f32, size.1 as f32);
        log::info!(
            "Renderer created at {}x{} (pixel ratio {})",
            size.0,
            size.1,
            ratio
        );

        Self {
            device,
            settings,
            size,
            viewport: full,
            scissor: full,
            scissor_test: false,
            clipping_planes: Vec::new(),
            attributes: AttributeCache::new(),
            geometries: GeometryCache::new(),
            textures: TextureCache::new(),
            programs: ProgramCache::new(),
            properties: PropertiesStore::new(),
            lights: LightsState::new(),
            clipping: ClippingState::new(),
            shadows: ShadowMapPass::new(),
            render_lists: RenderLists::new(),
            state: GpuState::new(),
            frame_lights: Vec::new(),
            shadow_maps: ShadowMaps::default(),
            opaque_sort: painter_sort_stable,
            transparent_sort: reverse_painter_sort_stable,
            info: RenderInfo::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: RenderSettings) {
        let ratio_changed = settings.pixel_ratio != self.settings.pixel_ratio;
        self.settings = settings.validate();
        if ratio_changed {
            self.set_size(self.size.0, self.size.1);
        }
    }

    pub fn info(&self) -> &RenderInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut RenderInfo {
        &mut self.info
    }

    /// Forces the shadow maps to render on the next frame while
    /// `shadow_map.auto_update` is off.
    pub fn request_shadow_update(&mut self) {
        self.shadows.needs_update = true;
    }

    /// Logical size; the device is resized to `size * pixel_ratio`.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.size = (width.max(1), height.max(1));
        let ratio = self.settings.pixel_ratio;
        self.device.resize(
            (self.size.0 as f32 * ratio).round() as u32,
            (self.size.1 as f32 * ratio).round() as u32,
        );
        let full = Viewport::new(0.0, 0.0, self.size.0 as f32, self.size.1 as f32);
        self.viewport = full;
        self.scissor = full;
        log::info!("Renderer resized to {}x{}", self.size.0, self.size.1);
    }

    pub fn set_pixel_ratio(&mut self, ratio: f32) {
        self.settings.pixel_ratio = ratio;
        self.settings = self.settings.clone().validate();
        self.set_size(self.size.0, self.size.1);
    }

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.viewport = Viewport::new(x, y, width, height);
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_scissor(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.scissor = Viewport::new(x, y, width, height);
    }

    pub fn set_scissor_test(&mut self, enabled: bool) {
        self.scissor_test = enabled;
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.settings.clear_color = color;
    }

    /// Global clip planes in world space, applied to every material.
    pub fn set_clipping_planes(&mut self, planes: Vec<Plane>) {
        self.clipping_planes = planes;
    }

    pub fn clipping_planes(&self) -> &[Plane] {
        &self.clipping_planes
    }

    /// `None` restores the default front-to-back program grouping.
    pub fn set_opaque_sort(&mut self, sort: Option<SortFn>) {
        self.opaque_sort = sort.unwrap_or(painter_sort_stable);
    }

    /// `None` restores the default back-to-front ordering.
    pub fn set_transparent_sort(&mut self, sort: Option<SortFn>) {
        self.transparent_sort = sort.unwrap_or(reverse_painter_sort_stable);
    }

    /// Clears the default framebuffer with the clear color.
    pub fn clear(&mut self) -> Result<(), RenderError> {
        self.state
            .set_render_target(&mut self.device, None)
            .map_err(|err| self.frame_error(err))?;
        self.device.clear(Some(self.settings.clear_color), true);
        Ok(())
    }

    pub fn render(&mut self, scene: &mut Scene, camera: &Camera) -> Result<(), RenderError> {
        if self.device.is_lost() {
            self.handle_device_loss();
            return Err(RenderError::DeviceLost(
                "device unavailable at frame start".to_string(),
            ));
        }

        if self.info.auto_reset {
            self.info.reset();
        }
        self.info.frame += 1;

        let mut list = std::mem::take(self.render_lists.get(scene.id, camera.id));
        let result = self.render_frame(scene, camera, &mut list);
        *self.render_lists.get(scene.id, camera.id) = list;

        match result {
            Ok(()) => {
                self.update_totals();
                Ok(())
            }
            Err(err) => Err(self.frame_error(err)),
        }
    }

    /// Resolves the programs of everything `camera` would draw without
    /// issuing any draw.
    pub fn compile(&mut self, scene: &mut Scene, camera: &Camera) -> Result<(), RenderError> {
        if self.device.is_lost() {
            self.handle_device_loss();
            return Err(RenderError::DeviceLost(
                "device unavailable for compile".to_string(),
            ));
        }

        let mut list = RenderList::new();
        self.prepare_scene(scene, camera, &mut list);

        let configured: fxhash::FxHashSet<hecs::Entity> = self
            .frame_lights
            .iter()
            .filter(|frame_light| {
                self.settings.shadow_map.enabled && frame_light.light.shadow.is_some()
            })
            .map(|frame_light| frame_light.entity)
            .collect();
        let shadows = &self.shadows;
        self.lights.setup(&self.frame_lights, |entity| {
            if !configured.contains(&entity) {
                return None;
            }
            shadows.shadow_info(entity).or(Some(ShadowInfo {
                matrix: Mat4::IDENTITY,
                map_size: glam::UVec2::ONE,
                near: 0.0,
                far: 1.0,
            }))
        });
        self.collect_shadow_maps(true);

        let view = camera.view();
        self.lights.setup_view(&view);
        self.clipping.set_global_state(&view);
        let pass = Pass {
            view,
            shadow: None,
            compile_only: true,
        };

        let items: Vec<DrawItem> = list.opaque().chain(list.transparent()).copied().collect();
        for item in &items {
            self.submit(scene, item, &pass)
                .map_err(|err| self.frame_error(err))?;
        }
        self.update_totals();
        Ok(())
    }

    pub fn dispose_geometry(&mut self, geometry: &crate::asset::Geometry) {
        self.geometries
            .dispose(&mut self.device, &mut self.attributes, geometry);
    }

    pub fn dispose_texture(&mut self, texture: &crate::asset::Texture) {
        self.textures.remove(&mut self.device, &texture.id);
    }

    /// Releases every program the material acquired.
    pub fn dispose_material(&mut self, material: &Material) {
        let Some(mut properties) = self.properties.remove(&material.id) else {
            return;
        };
        for program in properties.take_programs() {
            self.programs.release(&mut self.device, program);
        }
    }

    /// Frees every GPU resource the renderer owns.
    pub fn dispose(&mut self) {
        self.attributes.clear(&mut self.device);
        self.geometries.clear(&mut self.device);
        self.textures.clear(&mut self.device);
        self.programs.clear(&mut self.device);
        self.shadows.dispose(&mut self.device);
        self.properties.reset();
        self.render_lists.dispose();
        self.lights.reset();
        self.state.reset();
        self.update_totals();
    }

    fn frame_error(&mut self, err: DeviceError) -> RenderError {
        if err.is_fatal() {
            self.handle_device_loss();
        } else {
            log::error!("Frame aborted: {}", err);
        }
        RenderError::from_frame_error(err)
    }

    fn handle_device_loss(&mut self) {
        log::error!("Graphics device lost; every GPU cache is invalidated");
        self.attributes.reset();
        self.geometries.reset();
        self.textures.reset();
        self.programs.reset();
        self.properties.reset();
        self.shadows.reset();
        self.lights.reset();
        self.state.reset();
        self.shadow_maps.clear();
        self.update_totals();
    }

    fn update_totals(&mut self) {
        self.info.programs = self.programs.len();
        self.info.geometries = self.geometries.len();
        self.info.textures = self.textures.len();
    }

    /// World transforms, bounds, the render list and the frame's lights.
    fn prepare_scene(&mut self, scene: &mut Scene, camera: &Camera, list: &mut RenderList) {
        if scene.auto_update {
            scene.update_world_transforms();
        }
        let degenerate = scene.assets.compute_missing_bounds();
        if degenerate > 0 {
            log::warn!(
                "{} geometries produced NaN bounding spheres; using empty bounds",
                degenerate
            );
            self.info.warnings += degenerate as u32;
        }

        self.clipping.init(
            &self.clipping_planes,
            self.settings.local_clipping_enabled,
        );

        list.init();
        self.frame_lights.clear();
        let properties = &self.properties;
        let materials = &scene.assets.materials;
        let program_of = |handle: Handle<Material>| {
            materials
                .get(handle)
                .and_then(|material| properties.get(&material.id))
                .and_then(|properties| properties.current_program())
        };
        project_scene(
            scene,
            camera,
            &Projection {
                sort_objects: self.settings.sort_objects,
                program_of: &program_of,
            },
            list,
            &mut self.frame_lights,
        );

        if self.settings.sort_objects {
            list.sort(Some(self.opaque_sort), Some(self.transparent_sort));
        }
    }

    fn render_frame(
        &mut self,
        scene: &mut Scene,
        camera: &Camera,
        list: &mut RenderList,
    ) -> Result<(), DeviceError> {
        self.device.begin_frame()?;
        self.prepare_scene(scene, camera, list);

        if self.settings.shadow_map.enabled {
            self.shadows.prune(&mut self.device, &self.frame_lights);
        }
        if self
            .shadows
            .should_render(&self.settings.shadow_map, &self.frame_lights)
        {
            self.clipping.begin_shadows();
            let result = self.render_shadows(scene);
            self.clipping.end_shadows();
            result?;
        }

        let shadows_enabled = self.settings.shadow_map.enabled;
        let shadows = &self.shadows;
        self.lights.setup(&self.frame_lights, |entity| {
            shadows_enabled
                .then(|| shadows.shadow_info(entity))
                .flatten()
        });
        self.collect_shadow_maps(false);

        let ratio = self.settings.pixel_ratio;
        self.state.set_render_target(&mut self.device, None)?;
        let scissor = self.scissor_test.then(|| scissor_rect(self.scissor.scaled(ratio)));
        self.state.set_scissor(&mut self.device, scissor);
        if self.settings.auto_clear {
            self.device.clear(Some(self.settings.clear_color), true);
        }

        if camera.sub_cameras.is_empty() {
            self.render_camera(scene, list, camera, self.viewport.scaled(ratio))?;
        } else {
            for sub in &camera.sub_cameras {
                self.render_camera(scene, list, &sub.camera, sub.viewport.scaled(ratio))?;
            }
        }

        self.device.end_frame()
    }

    fn render_shadows(&mut self, scene: &mut Scene) -> Result<(), DeviceError> {
        let jobs = self.shadows.prepare(&mut self.device, &self.frame_lights)?;
        if jobs.is_empty() {
            return Ok(());
        }

        for job in &jobs {
            if let Ok(mut light) = scene.world.get::<&mut Light>(job.entity) {
                if let Some(shadow) = light.shadow.as_mut() {
                    shadow.needs_update = false;
                }
            }
        }

        let casters = collect_casters(scene);
        let no_lights = LightsState::new().uniform_bytes();

        for job in &jobs {
            self.state
                .set_render_target(&mut self.device, Some(job.target))?;
            self.device.clear(Some(SHADOW_CLEAR), true);

            for face in &job.faces {
                self.state.set_viewport(&mut self.device, face.viewport);
                self.clipping.set_global_state(&face.view);

                let mut camera =
                    CameraUniform::from_matrices(face.view, face.projection, job.position, false);
                camera.clip = [job.near, job.far, face.viewport.height, 1.0];
                self.device
                    .set_uniforms(UniformSlot::Camera, bytemuck::bytes_of(&camera))?;
                self.device.set_uniforms(UniformSlot::Lights, &no_lights)?;

                let frustum = Frustum::from_matrix(&(face.projection * face.view));
                let pass = Pass {
                    view: face.view,
                    shadow: Some(ShadowDraw {
                        point: job.point,
                        clip_global: job.clip_shadows,
                    }),
                    compile_only: false,
                };
                for (item, sphere) in &casters {
                    if sphere.is_some_and(|sphere| !frustum.intersects_sphere(&sphere)) {
                        continue;
                    }
                    self.submit(scene, item, &pass)?;
                }
            }
            log::trace!(
                "Shadow map for {:?} rendered with {} faces",
                job.entity,
                job.faces.len()
            );
        }
        Ok(())
    }

    /// Shadow map textures in the order `LightsState::setup` assigned
    /// shadow slots. `placeholder` mirrors a setup that gave every casting
    /// light a shadow, whether or not its map exists yet.
    fn collect_shadow_maps(&mut self, placeholder: bool) {
        self.shadow_maps.clear();
        if !self.settings.shadow_map.enabled {
            return;
        }
        for frame_light in &self.frame_lights {
            if !frame_light.light.cast_shadow {
                continue;
            }
            let mapped = if placeholder {
                frame_light.light.shadow.is_some()
            } else {
                self.shadows.shadow_info(frame_light.entity).is_some()
            };
            if !mapped {
                continue;
            }
            let texture = self
                .shadows
                .shadow_texture(&self.device, frame_light.entity);
            let maps = match frame_light.light.kind {
                LightKind::Directional { .. } => &mut self.shadow_maps.directional,
                LightKind::Spot { .. } => &mut self.shadow_maps.spot,
                LightKind::Point { .. } => &mut self.shadow_maps.point,
                _ => continue,
            };
            maps.push(texture);
        }
    }

    fn render_camera(
        &mut self,
        scene: &mut Scene,
        list: &RenderList,
        camera: &Camera,
        viewport: Viewport,
    ) -> Result<(), DeviceError> {
        self.state.set_viewport(&mut self.device, viewport);

        let view = camera.view();
        self.lights.setup_view(&view);
        self.clipping.set_global_state(&view);

        let uniform = self.camera_uniform(scene.fog, camera, viewport);
        self.device
            .set_uniforms(UniformSlot::Camera, bytemuck::bytes_of(&uniform))?;
        self.device
            .set_uniforms(UniformSlot::Lights, &self.lights.uniform_bytes())?;

        let pass = Pass {
            view,
            shadow: None,
            compile_only: false,
        };
        for item in list.opaque().chain(list.transparent()) {
            self.submit(scene, item, &pass)?;
        }
        Ok(())
    }

    fn camera_uniform(&self, fog: Option<Fog>, camera: &Camera, viewport: Viewport) -> CameraUniform {
        let mut uniform = CameraUniform::from_matrices(
            camera.view(),
            camera.proj(),
            camera.position(),
            camera.is_orthographic(),
        );
        uniform.tone = [
            self.settings.tone_mapping_exposure,
            self.settings.tone_mapping.shader_index() as f32,
            if self.settings.output_encoding == TextureEncoding::Srgb {
                1.0
            } else {
                0.0
            },
            0.0,
        ];
        match fog {
            Some(Fog::Linear { color, near, far }) => {
                uniform.fog_color = color.extend(1.0).to_array();
                uniform.fog_params = [near, far, 0.0, 0.0];
            }
            Some(Fog::Exp2 { color, density }) => {
                uniform.fog_color = color.extend(2.0).to_array();
                uniform.fog_params = [0.0, 0.0, density, 0.0];
            }
            None => {}
        }
        let ratio = self.settings.pixel_ratio;
        uniform.clip = [camera.near, camera.far, viewport.height / ratio, ratio];
        uniform
    }

    /// Draws one item. Errors that only concern this item are reported and
    /// swallowed; device loss is passed up.
    fn submit(&mut self, scene: &mut Scene, item: &DrawItem, pass: &Pass) -> Result<(), DeviceError> {
        match self.draw_item(scene, item, pass) {
            Err(err) if !err.is_fatal() => {
                log::warn!("Skipped draw of {:?}: {}", item.entity, err);
                self.info.warn();
                Ok(())
            }
            other => other,
        }
    }

    fn draw_item(&mut self, scene: &mut Scene, item: &DrawItem, pass: &Pass) -> Result<(), DeviceError> {
        let Self {
            device,
            settings,
            attributes,
            geometries: geometry_cache,
            textures: texture_cache,
            programs,
            properties,
            lights,
            clipping,
            shadows,
            state,
            shadow_maps,
            info,
            frame_lights: _,
            ..
        } = self;
        let device: &mut D = device;
        let frame = info.frame;

        let material_handle = match (pass.shadow, scene.override_material) {
            (None, Some(handle)) => handle,
            _ => item.material,
        };
        let materials = &scene.assets.materials;
        let Some(source) = materials.get(material_handle) else {
            log::warn!("Draw item {:?} lost its material", item.entity);
            info.warn();
            return Ok(());
        };
        let Some(geometry) = scene.assets.geometries.get_mut(item.geometry) else {
            log::warn!("Draw item {:?} lost its geometry", item.entity);
            info.warn();
            return Ok(());
        };

        geometry_cache.update(device, attributes, geometry, frame)?;
        let geometry = &*geometry;

        let Some(position) = geometry.attribute(POSITION) else {
            log::warn!(
                "Geometry {} has no position attribute; skipping {:?}",
                geometry.id,
                item.entity
            );
            info.warn();
            return Ok(());
        };

        let wants_morph = source.morph_targets && geometry.has_morph_targets();
        let wants_skin = item.kind == DrawableKind::SkinnedMesh && source.skinning;

        let (program_material, surface) = match pass.shadow {
            None => (source, source),
            Some(shadow) => {
                let custom = if shadow.point {
                    source.custom_distance_material
                } else {
                    source.custom_depth_material
                };
                match custom.and_then(|handle| materials.get(handle)) {
                    Some(custom) => (custom, custom),
                    None if shadow.point => (shadows.distance_material(wants_morph, wants_skin), source),
                    None => (shadows.depth_material(wants_morph, wants_skin), source),
                }
            }
        };
        let in_shadow_pass = pass.shadow.is_some();

        let mut layout = VertexLayout {
            inputs: Vec::new(),
            bindings: Vec::new(),
        };
        if !layout.bind(attributes, position, locations::POSITION, "position", &["vec3<f32>"]) {
            log::warn!("Position of geometry {} is not vec3<f32>", geometry.id);
            info.warn();
            return Ok(());
        }
        if let Some(normal) = geometry.attribute(NORMAL) {
            layout.bind(attributes, normal, locations::NORMAL, "normal", &["vec3<f32>"]);
        }
        if let Some(uv) = geometry.attribute(UV) {
            layout.bind(attributes, uv, locations::UV, "uv", &["vec2<f32>"]);
        }
        let mut vertex_colors = false;
        if program_material.vertex_colors {
            if let Some(color) = geometry.attribute(COLOR) {
                vertex_colors = layout.bind(
                    attributes,
                    color,
                    locations::COLOR,
                    "color",
                    &["vec3<f32>", "vec4<f32>"],
                );
            }
        }

        // Skinning
        let mut bones: &[Mat4] = &[];
        let mut skinning = false;
        let skeleton = scene.world.get::<&Skeleton>(item.entity).ok();
        if program_material.skinning && item.kind == DrawableKind::SkinnedMesh {
            match (
                skeleton.as_deref(),
                geometry.attribute(SKIN_INDEX),
                geometry.attribute(SKIN_WEIGHT),
            ) {
                (Some(skeleton), Some(index), Some(weight)) => {
                    let vec4 = ["vec4<f32>", "vec4<u32>", "vec4<i32>"];
                    skinning = layout.bind(attributes, index, locations::SKIN_INDEX, "skin_index", &vec4)
                        && layout.bind(attributes, weight, locations::SKIN_WEIGHT, "skin_weight", &vec4);
                    bones = &skeleton.bone_matrices;
                }
                _ => log::trace!("Skinned draw {:?} without skeleton data", item.entity),
            }
        }
        let mut max_bones = 0;
        if skinning {
            let capabilities = device.capabilities();
            let budget = settings.max_bones.min(
                capabilities
                    .max_vertex_uniform_vectors
                    .saturating_sub(RESERVED_VERTEX_VECTORS)
                    / 4,
            );
            if bones.len() as u32 > budget {
                log::warn!(
                    "Skeleton of {:?} has {} bones but only {} fit; extra bones are ignored",
                    item.entity,
                    bones.len(),
                    budget
                );
                info.warn();
                bones = &bones[..budget as usize];
            }
            max_bones = bones.len() as u32;
        }

        // Morph targets
        let mut morph_weights: Vec<f32> = Vec::new();
        let mut morph_normals = false;
        if program_material.morph_targets && geometry.has_morph_targets() {
            let targets = geometry
                .morph_attributes
                .get(POSITION)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let normal_targets = geometry
                .morph_attributes
                .get(NORMAL)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            morph_normals = program_material.morph_normals
                && !in_shadow_pass
                && !normal_targets.is_empty();
            let slots = if morph_normals { 2 } else { locations::MORPH_SLOTS as usize };
            let influences = scene
                .world
                .get::<&MorphTargetInfluences>(item.entity)
                .map(|influences| influences.0.clone())
                .unwrap_or_default();

            for (slot, (target, weight)) in select_morph_targets(&influences, targets.len(), slots)
                .into_iter()
                .enumerate()
            {
                let location = locations::MORPH + slot as u32;
                if !layout.bind(attributes, &targets[target], location, MORPH_TARGET_NAMES[slot], &["vec3<f32>"]) {
                    break;
                }
                if morph_normals {
                    if let Some(normal) = normal_targets.get(target) {
                        layout.bind(
                            attributes,
                            normal,
                            locations::MORPH + 2 + slot as u32,
                            MORPH_NORMAL_NAMES[slot],
                            &["vec3<f32>"],
                        );
                    }
                }
                morph_weights.push(weight);
            }
        }

        // Instancing
        let mut instance_count = 1;
        let mut instancing = false;
        if let DrawableKind::InstancedMesh { count } = item.kind {
            instance_count = count;
            if let Ok(mut matrices) = scene.world.get::<&mut InstanceMatrices>(item.entity) {
                let InstanceMatrices(attribute) = &mut *matrices;
                let gpu = attributes.update(device, attribute, BufferKind::Vertex)?;
                if attribute.item_size == 16 && gpu.element_type == ElementType::F32 {
                    instance_count = count.min(attribute.count() as u32);
                    for (column, name) in INSTANCE_MATRIX_NAMES.iter().enumerate() {
                        layout.inputs.push(VertexInput {
                            location: locations::INSTANCE_MATRIX + column as u32,
                            name,
                            wgsl_type: "vec4<f32>",
                        });
                    }
                    layout.bindings.push(VertexBinding {
                        location: locations::INSTANCE_MATRIX,
                        buffer: gpu.buffer,
                        layout: VertexAttributeLayout {
                            element_type: ElementType::F32,
                            components: 16,
                            normalized: false,
                            step: VertexStep::Instance,
                        },
                    });
                    instancing = true;
                }
            }
        }

        // Textures: material maps first, then shadow maps.
        let capabilities = device.capabilities();
        let unit_budget = settings
            .max_texture_units
            .min(capabilities.max_texture_units) as usize;
        let mut units: Vec<Option<TextureId>> = Vec::new();
        let mut maps = Vec::new();
        for (define, handle) in surface.maps.iter() {
            if in_shadow_pass && define != "MAP" && define != "ALPHA_MAP" {
                continue;
            }
            let Some(texture) = scene.assets.textures.get(handle) else {
                log::warn!("Material '{}' references a missing texture", surface.name);
                info.warn();
                continue;
            };
            if units.len() >= unit_budget {
                log::warn!(
                    "Texture unit budget of {} exceeded by '{}'; {} is dropped",
                    unit_budget,
                    surface.name,
                    define
                );
                info.warn();
                continue;
            }
            let upload = texture_cache.update(device, texture)?;
            maps.push(MapBinding {
                define,
                unit: units.len() as u32,
                encoding: texture.encoding,
            });
            units.push(upload.texture);
        }

        let receive_shadow = !in_shadow_pass
            && program_material.lights
            && settings.shadow_map.enabled
            && shadow_maps.total() > 0;
        let mut shadow_units = ShadowUnits {
            first_unit: units.len() as u32,
            ..ShadowUnits::default()
        };
        if receive_shadow {
            let groups = [
                (&shadow_maps.directional, &mut shadow_units.directional),
                (&shadow_maps.spot, &mut shadow_units.spot),
                (&shadow_maps.point, &mut shadow_units.point),
            ];
            'units: for (textures, bound) in groups {
                for texture in textures {
                    if units.len() >= unit_budget {
                        log::warn!(
                            "Texture unit budget of {} exceeded; remaining shadow maps are ignored",
                            unit_budget
                        );
                        info.warn();
                        break 'units;
                    }
                    units.push(*texture);
                    *bound += 1;
                }
            }
        }

        let mut features = ProgramFeatures::empty();
        features.set(ProgramFeatures::SKINNING, skinning);
        features.set(ProgramFeatures::MORPH_TARGETS, !morph_weights.is_empty());
        features.set(
            ProgramFeatures::MORPH_NORMALS,
            morph_normals && !morph_weights.is_empty(),
        );
        features.set(ProgramFeatures::INSTANCING, instancing);
        features.set(ProgramFeatures::VERTEX_COLORS, vertex_colors);
        features.set(ProgramFeatures::FLAT_SHADING, program_material.flat_shading);
        features.set(
            ProgramFeatures::DOUBLE_SIDED,
            program_material.side == Side::Double,
        );
        features.set(
            ProgramFeatures::FLIP_SIDED,
            program_material.side == Side::Back,
        );
        features.set(ProgramFeatures::ALPHA_TEST, surface.alpha_test > 0.0);
        features.set(
            ProgramFeatures::LIGHTS,
            program_material.lights && !in_shadow_pass,
        );
        features.set(ProgramFeatures::RECEIVE_SHADOW, receive_shadow);
        features.set(ProgramFeatures::POINTS, item.kind == DrawableKind::Points);
        features.set(
            ProgramFeatures::TRANSPARENT,
            program_material.transparent && !in_shadow_pass,
        );

        let material_properties = properties.get_mut(program_material.id);
        clipping.set_state(
            source,
            &mut material_properties.clipping,
            &pass.view,
            !in_shadow_pass,
            pass.shadow.is_some_and(|shadow| shadow.clip_global),
        );

        let fog = scene
            .fog
            .filter(|_| program_material.fog && !in_shadow_pass)
            .map(|fog| fog.key());
        let light_counts = if in_shadow_pass {
            LightCounts::default()
        } else {
            lights.counts
        };
        let parameters = ProgramParameters {
            label: program_label(program_material),
            shader_id: program_material.kind.shader_id(),
            custom_source: match &program_material.kind {
                MaterialKind::Shader(source) => Some(source.clone()),
                _ => None,
            },
            features,
            vertex_inputs: layout.inputs,
            maps,
            fog,
            max_bones,
            morph_targets: morph_weights.len() as u32,
            lights: light_counts,
            clipping: clipping.counts(),
            tone_mapping: if in_shadow_pass {
                ToneMapping::None
            } else {
                settings.tone_mapping
            },
            output_encoding: if in_shadow_pass {
                TextureEncoding::Linear
            } else {
                settings.output_encoding
            },
            shadow_map: receive_shadow.then_some(settings.shadow_map.kind),
            shadow_units: if receive_shadow {
                shadow_units
            } else {
                ShadowUnits::default()
            },
            on_before_compile: program_material.on_before_compile.clone(),
        };
        let trigger = ProgramTrigger {
            version: program_material.version,
            fog,
            lights_hash: if in_shadow_pass { 0 } else { lights.hash },
            clipping: clipping.counts(),
            inputs: inputs_hash(&parameters),
        };

        let program = match material_properties.current_for(&trigger) {
            Some(program) => program,
            None => {
                if material_properties.is_stale(&trigger) {
                    for program in material_properties.take_programs() {
                        programs.release(device, program);
                    }
                }
                let fingerprint = parameters.fingerprint();
                let program = match material_properties.program(&fingerprint) {
                    Some(program) => program,
                    None => match programs.acquire(device, &parameters) {
                        Ok(program) => program,
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            log::warn!(
                                "Material '{}' failed to compile ({}); skipping {:?}",
                                program_material.name,
                                err,
                                item.entity
                            );
                            info.warn();
                            return Ok(());
                        }
                    },
                };
                material_properties.set_current(trigger, fingerprint, program);
                program
            }
        };
        if pass.compile_only {
            return Ok(());
        }

        // Draw range
        let topology = match item.kind {
            DrawableKind::Mesh
            | DrawableKind::SkinnedMesh
            | DrawableKind::InstancedMesh { .. }
            | DrawableKind::Sprite => {
                if program_material.wireframe && !in_shadow_pass {
                    Topology::LineList
                } else {
                    Topology::TriangleList
                }
            }
            DrawableKind::Line | DrawableKind::LineLoop => Topology::LineStrip,
            DrawableKind::LineSegments => Topology::LineList,
            DrawableKind::Points => Topology::PointList,
        };
        let wireframe = topology == Topology::LineList
            && !matches!(item.kind, DrawableKind::LineSegments);

        let total = match &geometry.index {
            Some(index) => index.count(),
            None => position.count(),
        } as u32;
        let range_start = geometry.draw_range.start.min(total);
        let mut start = range_start;
        let mut end = range_start + geometry.element_count();
        if let Some(group) = item.group {
            start = start.max(group.start);
            end = end.min(group.start.saturating_add(group.count));
        }
        if end <= start {
            return Ok(());
        }
        let mut count = end - start;

        let index: Option<(BufferId, IndexFormat)> = if wireframe {
            let lines = geometry_cache.wireframe(device, geometry)?;
            start *= 2;
            count = (count * 2).min(lines.count.saturating_sub(start));
            Some((lines.buffer, IndexFormat::U32))
        } else {
            match &geometry.index {
                Some(index) => {
                    let format = match index.data.element_type() {
                        ElementType::U16 => IndexFormat::U16,
                        ElementType::U32 => IndexFormat::U32,
                        other => {
                            return Err(DeviceError::Unsupported(format!(
                                "{:?} index buffer",
                                other
                            )))
                        }
                    };
                    attributes.get(&index.id).map(|gpu| (gpu.buffer, format))
                }
                None => None,
            }
        };
        if count == 0 {
            return Ok(());
        }

        let side = if in_shadow_pass {
            source.effective_shadow_side()
        } else {
            program_material.side
        };
        let pipeline = if in_shadow_pass {
            PipelineState {
                cull_mode: cull_mode(side),
                ..PipelineState::default()
            }
        } else {
            PipelineState {
                cull_mode: cull_mode(side),
                blend: blend_mode(program_material),
                depth_test: program_material.depth_test,
                depth_write: program_material.depth_write,
            }
        };

        let object = ObjectUniform::new(item.world_matrix, pass.view)
            .with_morph_weights(&morph_weights)
            .with_receive_shadow(receive_shadow && item.receive_shadow);

        state.use_program(device, program)?;
        state.set_pipeline_state(device, &pipeline);
        device.set_uniforms(UniformSlot::Object, bytemuck::bytes_of(&object))?;
        device.set_uniforms(
            UniformSlot::Material,
            bytemuck::bytes_of(&MaterialUniform::from_material(surface)),
        )?;
        device.set_uniforms(UniformSlot::Clipping, &clipping.uniform_bytes())?;
        device.set_uniforms(UniformSlot::Skinning, &skinning_bytes(bones))?;
        for (unit, texture) in units.iter().enumerate() {
            state.bind_texture(device, unit as u32, *texture)?;
        }
        device.set_vertex_buffers(&layout.bindings, index)?;

        let call = DrawCall {
            topology,
            indexed: index.is_some(),
            first: start,
            count,
            instance_count,
        };
        device.draw(&call)?;
        info.record_draw(&call);
        if in_shadow_pass {
            info.shadow_calls += 1;
        }
        Ok(())
    }
}

fn program_label(material: &Material) -> String {
    let id = material.kind.shader_id().unwrap_or("shader");
    if material.name.is_empty() {
        id.to_string()
    } else {
        format!("{}:{}", id, material.name)
    }
}

fn cull_mode(side: Side) -> CullMode {
    match side {
        Side::Front => CullMode::Back,
        Side::Back => CullMode::Front,
        Side::Double => CullMode::None,
    }
}

/// Normal blending on an opaque material draws without blending.
fn blend_mode(material: &Material) -> BlendMode {
    match material.blending {
        Blending::None => BlendMode::Opaque,
        Blending::Normal if material.transparent => BlendMode::Normal,
        Blending::Normal => BlendMode::Opaque,
        Blending::Additive => BlendMode::Additive,
        Blending::Multiply => BlendMode::Multiply,
    }
}

fn scissor_rect(viewport: Viewport) -> ScissorRect {
    ScissorRect {
        x: viewport.x.max(0.0) as u32,
        y: viewport.y.max(0.0) as u32,
        width: viewport.width.max(0.0) as u32,
        height: viewport.height.max(0.0) as u32,
    }
}

/// WGSL type an attribute reads as; `None` for layouts no shader input takes.
fn wgsl_type(attribute: &Attribute) -> Option<&'static str> {
    const FLOAT: [&str; 4] = ["f32", "vec2<f32>", "vec3<f32>", "vec4<f32>"];
    const SIGNED: [&str; 4] = ["i32", "vec2<i32>", "vec3<i32>", "vec4<i32>"];
    const UNSIGNED: [&str; 4] = ["u32", "vec2<u32>", "vec3<u32>", "vec4<u32>"];

    let types = match (attribute.data.element_type(), attribute.normalized) {
        (ElementType::F32, _) | (_, true) => &FLOAT,
        (ElementType::I16, false) => &SIGNED,
        _ => &UNSIGNED,
    };
    types.get((attribute.item_size as usize).checked_sub(1)?).copied()
}

/// Picks the most influential targets for the available slots, as
/// (target index, weight) pairs.
fn select_morph_targets(weights: &[f32], available: usize, slots: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = (0..available)
        .map(|target| (target, weights.get(target).copied().unwrap_or(0.0)))
        .collect();
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then(a.0.cmp(&b.0)));
    ranked.truncate(slots);
    ranked
}

fn inputs_hash(parameters: &ProgramParameters) -> u64 {
    let mut hasher = FxHasher::default();
    parameters.shader_id.hash(&mut hasher);
    parameters.features.bits().hash(&mut hasher);
    parameters.vertex_inputs.hash(&mut hasher);
    parameters.maps.hash(&mut hasher);
    parameters.max_bones.hash(&mut hasher);
    parameters.morph_targets.hash(&mut hasher);
    parameters.tone_mapping.hash(&mut hasher);
    parameters.output_encoding.hash(&mut hasher);
    parameters.shadow_map.hash(&mut hasher);
    parameters.shadow_units.hash(&mut hasher);
    parameters
        .on_before_compile
        .as_ref()
        .map(|hook| hook.key.as_str())
        .hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AttributeData;

    #[test]
    fn morph_selection_prefers_large_influences() {
        let selected = select_morph_targets(&[0.1, -0.9, 0.0, 0.5, 0.3], 5, 2);
        assert_eq!(selected, vec![(1, -0.9), (3, 0.5)]);

        // Targets without a weight still occupy a slot so the program is stable.
        let selected = select_morph_targets(&[], 3, 4);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn attribute_types_follow_storage() {
        let positions = Attribute::positions(vec![[0.0; 3]]);
        assert_eq!(wgsl_type(&positions), Some("vec3<f32>"));

        let joints = Attribute::new(AttributeData::U16(vec![0; 4]), 4);
        assert_eq!(wgsl_type(&joints), Some("vec4<u32>"));

        let mut colors = Attribute::new(AttributeData::U8(vec![0; 4]), 4);
        colors.normalized = true;
        assert_eq!(wgsl_type(&colors), Some("vec4<f32>"));

        let matrices = Attribute::new(AttributeData::F32(vec![0.0; 16]), 16);
        assert_eq!(wgsl_type(&matrices), None);
    }

    #[test]
    fn opaque_normal_blending_is_disabled() {
        let mut material = Material::basic(glam::Vec3::ONE);
        assert_eq!(blend_mode(&material), BlendMode::Opaque);
        material.transparent = true;
        assert_eq!(blend_mode(&material), BlendMode::Normal);
        material.blending = Blending::Additive;
        material.transparent = false;
        assert_eq!(blend_mode(&material), BlendMode::Additive);
    }

    #[test]
    fn culling_follows_rendered_side() {
        assert_eq!(cull_mode(Side::Front), CullMode::Back);
        assert_eq!(cull_mode(Side::Back), CullMode::Front);
        assert_eq!(cull_mode(Side::Double), CullMode::None);
    }
}
