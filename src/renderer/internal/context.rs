use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use image::imageops::{self, FilterType};

use super::buffers::{MirroredBuffer, UniformRing};
use crate::asset::{ElementType, FilterMode, Wrapping};
use crate::error::{DeviceError, RenderError};
use crate::renderer::device::*;
use crate::renderer::pipeline_builder::{self, PipelineBuilder};

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Texture units exposed at bind group 1 (texture at `2u`, sampler at `2u+1`).
const TEXTURE_UNITS: usize = 16;

type UnitBindings = [Option<TextureId>; TEXTURE_UNITS];

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    width: u32,
    height: u32,
    mip_levels: u32,
}

struct RenderTargetEntry {
    color: TextureId,
    depth: wgpu::TextureView,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    state: PipelineState,
    topology: Topology,
    vertex: Vec<(u32, VertexAttributeLayout)>,
    format: wgpu::TextureFormat,
}

struct PendingDraw {
    pipeline: wgpu::RenderPipeline,
    textures: wgpu::BindGroup,
    offsets: [u32; UniformSlot::COUNT],
    vertex_buffers: Vec<wgpu::Buffer>,
    index: Option<(wgpu::Buffer, wgpu::IndexFormat)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    call: DrawCall,
}

/// Work recorded for one render pass: everything between two target
/// switches or clears.
#[derive(Default)]
struct PassBatch {
    clear_color: Option<[f32; 4]>,
    clear_depth: bool,
    draws: Vec<PendingDraw>,
}

/// [`GraphicsDevice`] backed by wgpu.
///
/// Draws are recorded per render pass and submitted when the target
/// changes, a clear follows draws, or the frame ends. The default
/// framebuffer is an offscreen RGBA8 texture with a depth attachment.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    max_vertex_buffers: usize,
    lost: Arc<AtomicBool>,
    next_id: u32,

    size: (u32, u32),
    color: TextureEntry,
    depth: wgpu::TextureView,

    buffers: FxHashMap<BufferId, MirroredBuffer>,
    textures: FxHashMap<TextureId, TextureEntry>,
    programs: FxHashMap<ProgramId, (String, wgpu::ShaderModule)>,
    targets: FxHashMap<RenderTargetId, RenderTargetEntry>,
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    texture_groups: FxHashMap<UnitBindings, wgpu::BindGroup>,

    uniforms: UniformRing,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    white: TextureEntry,

    target: Option<RenderTargetId>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    program: Option<ProgramId>,
    state: PipelineState,
    vertex_bindings: Vec<VertexBinding>,
    index: Option<(BufferId, IndexFormat)>,
    units: UnitBindings,
    batch: PassBatch,
}

impl WgpuDevice {
    /// Creates a device on the best available adapter, without a window.
    pub fn headless(width: u32, height: u32) -> Result<Self, RenderError> {
        pollster::block_on(Self::request(width, height))
    }

    async fn request(width: u32, height: u32) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| RenderError::ContextCreation(err.to_string()))?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let limits = wgpu::Limits {
            max_vertex_buffers: adapter.limits().max_vertex_buffers,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| RenderError::ContextCreation(err.to_string()))?;

        Ok(Self::from_device(device, queue, width, height))
    }

    /// Wraps an existing device; the caller keeps ownership of presentation.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            log::error!("wgpu device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::SeqCst);
        });

        let limits = device.limits();
        let capabilities = DeviceCapabilities {
            max_texture_units: (TEXTURE_UNITS as u32)
                .min(limits.max_sampled_textures_per_shader_stage)
                .min(limits.max_samplers_per_shader_stage),
            max_vertex_uniform_vectors: limits.max_uniform_buffer_binding_size / 16,
            npot_textures: true,
            max_texture_size: limits.max_texture_dimension_2d,
        };

        let uniforms = UniformRing::new(&device);
        let texture_layout = texture_layout(&device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ProgramLayout"),
            bind_group_layouts: &[&uniforms.layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let (width, height) = (width.max(1), height.max(1));
        let color = attachment_texture(&device, "DefaultColor", width, height, COLOR_FORMAT);
        let depth = depth_view(&device, width, height);
        let white = white_texture(&device, &queue);

        Self {
            device,
            queue,
            capabilities,
            max_vertex_buffers: limits.max_vertex_buffers as usize,
            lost,
            next_id: 1,
            size: (width, height),
            color,
            depth,
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            programs: FxHashMap::default(),
            targets: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            texture_groups: FxHashMap::default(),
            uniforms,
            texture_layout,
            pipeline_layout,
            white,
            target: None,
            viewport: None,
            scissor: None,
            program: None,
            state: PipelineState::default(),
            vertex_bindings: Vec::new(),
            index: None,
            units: [None; TEXTURE_UNITS],
            batch: PassBatch::default(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Color attachment of the default framebuffer.
    pub fn color_texture(&self) -> &wgpu::Texture {
        &self.color.texture
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn target_format(&self) -> wgpu::TextureFormat {
        self.target
            .and_then(|id| self.targets.get(&id))
            .map_or(COLOR_FORMAT, |target| target.format)
    }

    fn pipeline(&mut self, program: ProgramId, topology: Topology) -> Result<wgpu::RenderPipeline, DeviceError> {
        let key = PipelineKey {
            program,
            state: self.state,
            topology,
            vertex: self
                .vertex_bindings
                .iter()
                .map(|binding| (binding.location, binding.layout))
                .collect(),
            format: self.target_format(),
        };
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        let (label, module) = self
            .programs
            .get(&program)
            .ok_or(DeviceError::InvalidHandle {
                kind: "program",
                id: program.0,
            })?;

        let mut attributes = Vec::with_capacity(key.vertex.len());
        for (location, layout) in &key.vertex {
            attributes.push(vertex_attributes(*location, layout)?);
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut builder = PipelineBuilder::new(&self.device, &self.pipeline_layout, module)
            .with_label(label)
            .with_topology(pipeline_builder::topology(topology))
            .with_state(&key.state, key.format, DEPTH_FORMAT);
        for ((_, layout), attributes) in key.vertex.iter().zip(&attributes) {
            builder = builder.with_vertex_buffer(wgpu::VertexBufferLayout {
                array_stride: vertex_stride(layout),
                step_mode: match layout.step {
                    VertexStep::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStep::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes,
            });
        }
        let pipeline = builder.build();
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::ShaderCompilation {
                label: label.clone(),
                message: err.to_string(),
            });
        }

        log::debug!("Created pipeline for '{}' ({} cached)", label, self.pipelines.len() + 1);
        self.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    fn texture_group(&mut self) -> wgpu::BindGroup {
        if let Some(group) = self.texture_groups.get(&self.units) {
            return group.clone();
        }

        let mut entries = Vec::with_capacity(TEXTURE_UNITS * 2);
        for (unit, texture) in self.units.iter().enumerate() {
            let entry = texture
                .and_then(|id| self.textures.get(&id))
                .unwrap_or(&self.white);
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2,
                resource: wgpu::BindingResource::TextureView(&entry.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2 + 1,
                resource: wgpu::BindingResource::Sampler(&entry.sampler),
            });
        }
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TextureUnits"),
            layout: &self.texture_layout,
            entries: &entries,
        });
        self.texture_groups.insert(self.units, group.clone());
        group
    }

    /// Encodes and submits the recorded pass.
    fn flush(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        if batch.draws.is_empty() && batch.clear_color.is_none() && !batch.clear_depth {
            return;
        }

        let uniforms = if batch.draws.is_empty() {
            None
        } else {
            self.uniforms.flush(&self.device, &self.queue)
        };

        let (color_view, depth_view, (width, height)) = match self.target.and_then(|id| self.targets.get(&id)) {
            Some(target) => match self.textures.get(&target.color) {
                Some(color) => (&color.view, &target.depth, (target.width, target.height)),
                None => return,
            },
            None => (&self.color.view, &self.depth, self.size),
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("PassEncoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ScenePass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: match batch.clear_color {
                            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                                r: r as f64,
                                g: g as f64,
                                b: b as f64,
                                a: a as f64,
                            }),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: if batch.clear_depth {
                            wgpu::LoadOp::Clear(1.0)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            if let Some(uniforms) = &uniforms {
                for draw in &batch.draws {
                    let Some(viewport) = clamp_viewport(draw.viewport, width, height) else {
                        continue;
                    };
                    let scissor = clamp_scissor(draw.scissor, width, height);
                    if scissor.width == 0 || scissor.height == 0 {
                        continue;
                    }

                    pass.set_pipeline(&draw.pipeline);
                    pass.set_bind_group(0, uniforms, &draw.offsets);
                    pass.set_bind_group(1, &draw.textures, &[]);
                    for (slot, buffer) in draw.vertex_buffers.iter().enumerate() {
                        pass.set_vertex_buffer(slot as u32, buffer.slice(..));
                    }
                    pass.set_viewport(viewport.x, viewport.y, viewport.width, viewport.height, 0.0, 1.0);
                    pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);

                    let range = draw.call.first..draw.call.first + draw.call.count;
                    let instances = 0..draw.call.instance_count.max(1);
                    match &draw.index {
                        Some((buffer, format)) => {
                            pass.set_index_buffer(buffer.slice(..), *format);
                            pass.draw_indexed(range, 0, instances);
                        }
                        None => pass.draw(range, instances),
                    }
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        self.uniforms.restart();
    }
}

impl GraphicsDevice for WgpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.flush();
        self.size = (width, height);
        self.color = attachment_texture(&self.device, "DefaultColor", width, height, COLOR_FORMAT);
        self.depth = depth_view(&self.device, width, height);
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        self.check_lost()
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.flush();
        self.check_lost()
    }

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError> {
        self.check_lost()?;
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        };
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = MirroredBuffer::new(&self.device, usage, data);
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory);
        }
        buffer.upload_all(&self.queue);

        let id = BufferId(self.next_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.check_lost()?;
        let entry = self.buffers.get_mut(&buffer).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if !entry.write(&self.queue, offset, data) {
            return Err(DeviceError::Unsupported(format!(
                "write of {} bytes at {} overflows buffer {}",
                data.len(),
                offset,
                buffer.0
            )));
        }
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer) {
            entry.buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId, DeviceError> {
        self.check_lost()?;
        let (width, height) = (desc.width.max(1), desc.height.max(1));
        let mip_levels = if desc.mipmaps {
            32 - width.max(height).leading_zeros()
        } else {
            1
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory);
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = self.device.create_sampler(&sampler_descriptor(&desc.sampler));
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            TextureEntry {
                texture,
                view,
                sampler,
                width,
                height,
                mip_levels,
            },
        );
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_lost()?;
        let entry = self.textures.get(&texture).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if (entry.width, entry.height) != (width, height) {
            return Err(DeviceError::Unsupported(format!(
                "{}x{} upload into {}x{} texture",
                width, height, entry.width, entry.height
            )));
        }

        let mut level = image::RgbaImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
            DeviceError::Unsupported(format!("pixel buffer does not match {width}x{height}"))
        })?;
        write_level(&self.queue, &entry.texture, 0, &level);
        for mip in 1..entry.mip_levels {
            let (w, h) = ((width >> mip).max(1), (height >> mip).max(1));
            level = imageops::resize(&level, w, h, FilterType::Triangle);
            write_level(&self.queue, &entry.texture, mip, &level);
        }
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if let Some(entry) = self.textures.remove(&texture) {
            entry.texture.destroy();
            self.texture_groups.clear();
        }
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> Result<ProgramId, DeviceError> {
        self.check_lost()?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.label),
            source: wgpu::ShaderSource::Wgsl(desc.source.as_str().into()),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::ShaderCompilation {
                label: desc.label.clone(),
                message: err.to_string(),
            });
        }

        let id = ProgramId(self.next_id());
        self.programs.insert(id, (desc.label.clone(), module));
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        self.pipelines.retain(|key, _| key.program != program);
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDescriptor,
    ) -> Result<RenderTargetId, DeviceError> {
        self.check_lost()?;
        let (width, height) = (desc.width.max(1), desc.height.max(1));
        let format = texture_format(desc.format);

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let color = attachment_texture(&self.device, &desc.label, width, height, format);
        let depth = depth_view(&self.device, width, height);
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory);
        }

        let color_id = TextureId(self.next_id());
        self.textures.insert(color_id, color);
        let id = RenderTargetId(self.next_id());
        self.targets.insert(
            id,
            RenderTargetEntry {
                color: color_id,
                depth,
                width,
                height,
                format,
            },
        );
        Ok(id)
    }

    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId> {
        self.targets.get(&target).map(|target| target.color)
    }

    fn delete_render_target(&mut self, target: RenderTargetId) {
        if self.target == Some(target) {
            self.flush();
            self.target = None;
        }
        if let Some(entry) = self.targets.remove(&target) {
            self.delete_texture(entry.color);
        }
    }

    fn set_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), DeviceError> {
        self.check_lost()?;
        if let Some(id) = target {
            if !self.targets.contains_key(&id) {
                return Err(DeviceError::InvalidHandle {
                    kind: "render target",
                    id: id.0,
                });
            }
        }
        if self.target != target {
            self.flush();
            self.target = target;
            self.viewport = None;
            self.scissor = None;
            self.units = [None; TEXTURE_UNITS];
        }
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.scissor = scissor;
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool) {
        if !self.batch.draws.is_empty() {
            self.flush();
        }
        if color.is_some() {
            self.batch.clear_color = color;
        }
        self.batch.clear_depth |= depth;
    }

    fn use_program(&mut self, program: ProgramId) -> Result<(), DeviceError> {
        self.check_lost()?;
        if !self.programs.contains_key(&program) {
            return Err(DeviceError::InvalidHandle {
                kind: "program",
                id: program.0,
            });
        }
        self.program = Some(program);
        Ok(())
    }

    fn set_pipeline_state(&mut self, state: &PipelineState) {
        self.state = *state;
    }

    fn set_uniforms(&mut self, slot: UniformSlot, data: &[u8]) -> Result<(), DeviceError> {
        self.check_lost()?;
        let limit = self.capabilities.max_vertex_uniform_vectors as usize * 16;
        if data.len() > limit {
            return Err(DeviceError::Unsupported(format!(
                "{:?} uniforms of {} bytes exceed the {} byte binding limit",
                slot,
                data.len(),
                limit
            )));
        }
        self.uniforms.write(slot, data);
        Ok(())
    }

    fn set_vertex_buffers(
        &mut self,
        bindings: &[VertexBinding],
        index: Option<(BufferId, IndexFormat)>,
    ) -> Result<(), DeviceError> {
        self.check_lost()?;
        if bindings.len() > self.max_vertex_buffers {
            return Err(DeviceError::Unsupported(format!(
                "{} vertex buffers exceed the device limit of {}",
                bindings.len(),
                self.max_vertex_buffers
            )));
        }
        for binding in bindings {
            if !self.buffers.contains_key(&binding.buffer) {
                return Err(DeviceError::InvalidHandle {
                    kind: "buffer",
                    id: binding.buffer.0,
                });
            }
            vertex_format(&binding.layout)?;
        }
        self.vertex_bindings.clear();
        self.vertex_bindings.extend_from_slice(bindings);
        self.index = index;
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) -> Result<(), DeviceError> {
        self.check_lost()?;
        let slot = self
            .units
            .get_mut(unit as usize)
            .ok_or_else(|| DeviceError::Unsupported(format!("texture unit {unit}")))?;
        *slot = texture;
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), DeviceError> {
        self.check_lost()?;
        let program = self
            .program
            .ok_or_else(|| DeviceError::Unsupported("draw without a program".to_string()))?;
        let offsets = self
            .uniforms
            .offsets()
            .ok_or_else(|| DeviceError::Unsupported("draw before every uniform was set".to_string()))?;
        let pipeline = self.pipeline(program, call.topology)?;
        let textures = self.texture_group();

        let mut vertex_buffers = Vec::with_capacity(self.vertex_bindings.len());
        for binding in &self.vertex_bindings {
            let entry = self.buffers.get(&binding.buffer).ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                id: binding.buffer.0,
            })?;
            vertex_buffers.push(entry.buffer.clone());
        }
        let index = match (call.indexed, self.index) {
            (true, Some((buffer, format))) => {
                let entry = self.buffers.get(&buffer).ok_or(DeviceError::InvalidHandle {
                    kind: "buffer",
                    id: buffer.0,
                })?;
                Some((entry.buffer.clone(), index_format(format)))
            }
            (true, None) => {
                return Err(DeviceError::Unsupported(
                    "indexed draw without an index buffer".to_string(),
                ))
            }
            (false, _) => None,
        };

        self.batch.draws.push(PendingDraw {
            pipeline,
            textures,
            offsets,
            vertex_buffers,
            index,
            viewport: self.viewport,
            scissor: self.scissor,
            call: *call,
        });
        Ok(())
    }
}

fn texture_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(TEXTURE_UNITS * 2);
    for unit in 0..TEXTURE_UNITS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: unit * 2,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: unit * 2 + 1,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("TextureUnitsLayout"),
        entries: &entries,
    })
}

/// Color attachment that later passes can sample.
fn attachment_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> TextureEntry {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    // Packed depth must not be filtered.
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("AttachmentSampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });
    TextureEntry {
        texture,
        view,
        sampler,
        width,
        height,
        mip_levels: 1,
    }
}

fn depth_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("Depth"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

/// Bound to every unit that has no texture.
fn white_texture(device: &wgpu::Device, queue: &wgpu::Queue) -> TextureEntry {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("White"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: COLOR_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let image = image::RgbaImage::from_pixel(1, 1, image::Rgba([255; 4]));
    write_level(queue, &texture, 0, &image);
    TextureEntry {
        view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
        sampler: device.create_sampler(&wgpu::SamplerDescriptor::default()),
        texture,
        width: 1,
        height: 1,
        mip_levels: 1,
    }
}

fn write_level(queue: &wgpu::Queue, texture: &wgpu::Texture, mip_level: u32, image: &image::RgbaImage) {
    let (width, height) = image.dimensions();
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.as_raw(),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(4 * width),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
    }
}

fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}

fn sampler_descriptor(desc: &SamplerDescriptor) -> wgpu::SamplerDescriptor<'static> {
    let (min_filter, mipmap_filter) = match desc.min_filter {
        FilterMode::Nearest | FilterMode::NearestMipmapNearest => {
            (wgpu::FilterMode::Nearest, wgpu::FilterMode::Nearest)
        }
        FilterMode::Linear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Nearest),
        FilterMode::LinearMipmapLinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear),
    };
    wgpu::SamplerDescriptor {
        label: Some("TextureSampler"),
        address_mode_u: address_mode(desc.wrap_s),
        address_mode_v: address_mode(desc.wrap_t),
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: match desc.mag_filter {
            FilterMode::Nearest | FilterMode::NearestMipmapNearest => wgpu::FilterMode::Nearest,
            _ => wgpu::FilterMode::Linear,
        },
        min_filter,
        mipmap_filter,
        ..Default::default()
    }
}

fn address_mode(wrapping: Wrapping) -> wgpu::AddressMode {
    match wrapping {
        Wrapping::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        Wrapping::Repeat => wgpu::AddressMode::Repeat,
        Wrapping::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

/// Vertex formats wgpu can read; three-component 8 and 16 bit data has no
/// equivalent.
fn vertex_format(layout: &VertexAttributeLayout) -> Result<wgpu::VertexFormat, DeviceError> {
    use wgpu::VertexFormat as F;

    let format = match (layout.element_type, layout.normalized, layout.components) {
        (ElementType::F32, _, 1) => F::Float32,
        (ElementType::F32, _, 2) => F::Float32x2,
        (ElementType::F32, _, 3) => F::Float32x3,
        (ElementType::F32, _, 4) => F::Float32x4,
        (ElementType::U32, _, 1) => F::Uint32,
        (ElementType::U32, _, 2) => F::Uint32x2,
        (ElementType::U32, _, 3) => F::Uint32x3,
        (ElementType::U32, _, 4) => F::Uint32x4,
        (ElementType::U16, false, 2) => F::Uint16x2,
        (ElementType::U16, false, 4) => F::Uint16x4,
        (ElementType::U16, true, 2) => F::Unorm16x2,
        (ElementType::U16, true, 4) => F::Unorm16x4,
        (ElementType::I16, false, 2) => F::Sint16x2,
        (ElementType::I16, false, 4) => F::Sint16x4,
        (ElementType::I16, true, 2) => F::Snorm16x2,
        (ElementType::I16, true, 4) => F::Snorm16x4,
        (ElementType::U8, false, 2) => F::Uint8x2,
        (ElementType::U8, false, 4) => F::Uint8x4,
        (ElementType::U8, true, 2) => F::Unorm8x2,
        (ElementType::U8, true, 4) => F::Unorm8x4,
        // Instance matrices arrive as one 16 component binding.
        (ElementType::F32, false, 16) => F::Float32x4,
        (element_type, normalized, components) => {
            return Err(DeviceError::Unsupported(format!(
                "vertex format {:?}x{} (normalized: {})",
                element_type, components, normalized
            )))
        }
    };
    Ok(format)
}

fn vertex_stride(layout: &VertexAttributeLayout) -> u64 {
    (layout.element_type.size() * layout.components as usize) as u64
}

/// Attributes read from one buffer; a 16 component matrix spans four
/// consecutive locations.
fn vertex_attributes(
    location: u32,
    layout: &VertexAttributeLayout,
) -> Result<Vec<wgpu::VertexAttribute>, DeviceError> {
    let format = vertex_format(layout)?;
    let columns = if layout.components == 16 { 4 } else { 1 };
    Ok((0..columns)
        .map(|column| wgpu::VertexAttribute {
            format,
            offset: column as u64 * format.size(),
            shader_location: location + column,
        })
        .collect())
}

fn clamp_viewport(viewport: Option<Viewport>, width: u32, height: u32) -> Option<Viewport> {
    let viewport = viewport.unwrap_or(Viewport::new(0.0, 0.0, width as f32, height as f32));
    let x = viewport.x.clamp(0.0, width as f32);
    let y = viewport.y.clamp(0.0, height as f32);
    let right = (viewport.x + viewport.width).clamp(x, width as f32);
    let bottom = (viewport.y + viewport.height).clamp(y, height as f32);
    (right > x && bottom > y).then(|| Viewport::new(x, y, right - x, bottom - y))
}

fn clamp_scissor(scissor: Option<ScissorRect>, width: u32, height: u32) -> ScissorRect {
    let scissor = scissor.unwrap_or(ScissorRect {
        x: 0,
        y: 0,
        width,
        height,
    });
    let x = scissor.x.min(width);
    let y = scissor.y.min(height);
    ScissorRect {
        x,
        y,
        width: scissor.width.min(width - x),
        height: scissor.height.min(height - y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(element_type: ElementType, components: u32, normalized: bool) -> VertexAttributeLayout {
        VertexAttributeLayout {
            element_type,
            components,
            normalized,
            step: VertexStep::Vertex,
        }
    }

    #[test]
    fn instance_matrix_spans_four_locations() {
        let attributes = vertex_attributes(10, &layout(ElementType::F32, 16, false)).unwrap();
        let locations: Vec<_> = attributes.iter().map(|a| a.shader_location).collect();
        let offsets: Vec<_> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(locations, vec![10, 11, 12, 13]);
        assert_eq!(offsets, vec![0, 16, 32, 48]);
        assert_eq!(vertex_stride(&layout(ElementType::F32, 16, false)), 64);
    }

    #[test]
    fn three_component_small_types_are_rejected() {
        assert!(vertex_format(&layout(ElementType::U16, 3, false)).is_err());
        assert!(vertex_format(&layout(ElementType::U8, 3, true)).is_err());
        assert_eq!(
            vertex_format(&layout(ElementType::U8, 4, true)).unwrap(),
            wgpu::VertexFormat::Unorm8x4
        );
    }

    #[test]
    fn viewports_are_clipped_to_the_target() {
        let clipped = clamp_viewport(Some(Viewport::new(-10.0, 50.0, 100.0, 100.0)), 64, 64).unwrap();
        assert_eq!(clipped, Viewport::new(0.0, 50.0, 64.0, 14.0));
        assert!(clamp_viewport(Some(Viewport::new(70.0, 0.0, 10.0, 10.0)), 64, 64).is_none());

        let scissor = clamp_scissor(
            Some(ScissorRect {
                x: 60,
                y: 0,
                width: 10,
                height: 10,
            }),
            64,
            64,
        );
        assert_eq!((scissor.width, scissor.height), (4, 10));
    }
}
