pub mod cache;
pub mod clipping;
pub mod device;
pub mod info;
pub mod lights;
pub mod programs;
pub mod properties;
pub mod recording;
pub mod render_list;
pub mod shader;
pub mod shadows;
pub mod state;
pub mod uniforms;

mod internal;
mod pipeline_builder;
mod renderer;

pub use device::{
    BlendMode, BufferId, BufferKind, CullMode, DeviceCapabilities, DrawCall, GraphicsDevice,
    IndexFormat, PipelineState, ProgramDescriptor, ProgramId, RenderTargetDescriptor,
    RenderTargetId, SamplerDescriptor, ScissorRect, TextureDescriptor, TextureFormat, TextureId,
    Topology, UniformSlot, VertexAttributeLayout, VertexBinding, VertexStep, Viewport,
};
pub use info::RenderInfo;
pub use internal::{WgpuDevice, COLOR_FORMAT, DEPTH_FORMAT};
pub use recording::{DeviceCommand, RecordingDevice};
pub use render_list::{painter_sort_stable, reverse_painter_sort_stable, DrawItem, SortFn};
pub use renderer::Renderer;
