//! GPU mirrors of scene data, keyed by source identity and invalidated by
//! source version counters.

pub mod attributes;
pub mod geometries;
pub mod textures;

pub use attributes::{AttributeCache, GpuBuffer};
pub use geometries::{GeometryCache, WireframeBuffer};
pub use textures::{GpuTexture, TextureCache, TextureUpdate};
