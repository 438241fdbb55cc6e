//! The graphics context seen by the renderer.
//!
//! Everything above this trait is API agnostic: caches hold opaque ids and
//! the orchestrator issues state changes and draws through it. [`WgpuDevice`]
//! implements it on top of wgpu and [`RecordingDevice`] records the command
//! stream without touching a GPU.
//!
//! [`WgpuDevice`]: super::WgpuDevice
//! [`RecordingDevice`]: super::RecordingDevice

use crate::asset::{ElementType, FilterMode, Wrapping};
use crate::error::DeviceError;

macro_rules! resource_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

resource_id!(BufferId);
resource_id!(TextureId);
resource_id!(ProgramId);
resource_id!(RenderTargetId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexStep {
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeLayout {
    pub element_type: ElementType,
    pub components: u32,
    pub normalized: bool,
    pub step: VertexStep,
}

/// Binds `buffer` to shader input `location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub location: u32,
    pub buffer: BufferId,
    pub layout: VertexAttributeLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    LineList,
    LineStrip,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub topology: Topology,
    pub indexed: bool,
    /// First index (indexed) or vertex.
    pub first: u32,
    pub count: u32,
    pub instance_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDescriptor {
    pub wrap_s: Wrapping,
    pub wrap_t: Wrapping,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            wrap_s: Wrapping::ClampToEdge,
            wrap_t: Wrapping::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mipmaps: bool,
    pub sampler: SamplerDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTargetDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Pixel rectangle, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Normal,
    Additive,
    Multiply,
}

/// Fixed-function state that becomes part of the pipeline on explicit APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub cull_mode: CullMode,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            blend: BlendMode::Opaque,
            depth_test: true,
            depth_write: true,
        }
    }
}

/// A single WGSL module exposing `vs_main` and `fs_main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub label: String,
    pub source: String,
}

/// Uniform blocks, bound at group 0 in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UniformSlot {
    Camera = 0,
    Object = 1,
    Material = 2,
    Lights = 3,
    Clipping = 4,
    Skinning = 5,
}

impl UniformSlot {
    pub const COUNT: usize = 6;

    pub const ALL: [UniformSlot; Self::COUNT] = [
        UniformSlot::Camera,
        UniformSlot::Object,
        UniformSlot::Material,
        UniformSlot::Lights,
        UniformSlot::Clipping,
        UniformSlot::Skinning,
    ];

    pub fn binding(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub max_texture_units: u32,
    /// vec4 slots available to vertex-stage uniforms.
    pub max_vertex_uniform_vectors: u32,
    pub npot_textures: bool,
    pub max_texture_size: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_texture_units: 16,
            max_vertex_uniform_vectors: 4096,
            npot_textures: true,
            max_texture_size: 8192,
        }
    }
}

/// Low level graphics context. Fallible calls return [`DeviceError::Lost`]
/// once the context is gone; the renderer treats that as fatal for the frame.
pub trait GraphicsDevice {
    fn capabilities(&self) -> DeviceCapabilities;
    fn is_lost(&self) -> bool;

    /// Size of the default framebuffer in physical pixels.
    fn resize(&mut self, width: u32, height: u32);
    fn size(&self) -> (u32, u32);

    fn begin_frame(&mut self) -> Result<(), DeviceError>;
    fn end_frame(&mut self) -> Result<(), DeviceError>;

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8])
        -> Result<(), DeviceError>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId, DeviceError>;
    /// Uploads a full RGBA8 image into mip level 0.
    fn write_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), DeviceError>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_program(&mut self, desc: &ProgramDescriptor) -> Result<ProgramId, DeviceError>;
    fn delete_program(&mut self, program: ProgramId);

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDescriptor,
    ) -> Result<RenderTargetId, DeviceError>;
    /// Color attachment of a render target, for sampling in later passes.
    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId>;
    fn delete_render_target(&mut self, target: RenderTargetId);

    /// `None` binds the default framebuffer.
    fn set_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), DeviceError>;
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, scissor: Option<ScissorRect>);
    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool);

    fn use_program(&mut self, program: ProgramId) -> Result<(), DeviceError>;
    fn set_pipeline_state(&mut self, state: &PipelineState);
    fn set_uniforms(&mut self, slot: UniformSlot, data: &[u8]) -> Result<(), DeviceError>;
    fn set_vertex_buffers(
        &mut self,
        bindings: &[VertexBinding],
        index: Option<(BufferId, IndexFormat)>,
    ) -> Result<(), DeviceError>;
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) -> Result<(), DeviceError>;
    fn draw(&mut self, call: &DrawCall) -> Result<(), DeviceError>;
}
