//! wgpu backend for [`GraphicsDevice`](super::GraphicsDevice).

mod buffers;
mod context;

pub use context::{WgpuDevice, COLOR_FORMAT, DEPTH_FORMAT};
