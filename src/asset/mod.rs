pub mod attribute;
pub mod cache;
pub mod geometry;
pub mod handle;
pub mod material;
pub mod texture;

pub use attribute::{Attribute, AttributeData, ElementType};
pub use cache::AssetCache;
pub use geometry::{DrawRange, Geometry, GeometryGroup};
pub use handle::Handle;
pub use material::{
    Blending, Material, MaterialKind, MaterialMaps, OnBeforeCompile, ShaderSource, Side,
};
pub use texture::{
    FilterMode, ImageData, Texture, TextureEncoding, TextureImage, Wrapping,
};

use rayon::prelude::*;

/// Source data read by the renderer. The renderer never owns these; it only
/// mirrors them into GPU caches keyed by their ids.
pub struct Assets {
    pub geometries: AssetCache<Geometry>,
    pub materials: AssetCache<Material>,
    pub textures: AssetCache<Texture>,
}

impl Assets {
    pub fn new() -> Self {
        Self {
            geometries: AssetCache::new(),
            materials: AssetCache::new(),
            textures: AssetCache::new(),
        }
    }

    /// Computes bounding spheres for every geometry that has none yet.
    /// Returns the number of geometries whose bounds came out NaN.
    pub fn compute_missing_bounds(&mut self) -> usize {
        self.geometries
            .slots_mut()
            .par_iter_mut()
            .filter_map(Option::as_mut)
            .filter(|geometry| geometry.bounding_sphere.is_none())
            .map(|geometry| usize::from(!geometry.compute_bounding_sphere()))
            .sum()
    }
}

impl Default for Assets {
    fn default() -> Self {
        Self::new()
    }
}
