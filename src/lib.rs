//! Retained-mode scene renderer on wgpu.
//!
//! A [`Scene`] holds entities and the assets they reference; a [`Renderer`]
//! mirrors those assets into GPU caches, compiles programs per material
//! configuration, renders shadow maps and draws the visible objects for a
//! [`Camera`].

pub mod asset;
pub mod error;
pub mod renderer;
pub mod scene;
pub mod settings;

pub use asset::{Assets, Geometry, Handle, Material, Texture};
pub use error::{DeviceError, RenderError};
pub use renderer::{GraphicsDevice, RecordingDevice, RenderInfo, Renderer, WgpuDevice};
pub use scene::{Camera, Scene};
pub use settings::{RenderSettings, ShadowMapKind, ShadowMapSettings, ToneMapping};

/// Installs `env_logger` at info level. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
