use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureEncoding {
    #[default]
    Linear,
    Srgb,
}

impl TextureEncoding {
    pub(crate) fn key(self) -> &'static str {
        match self {
            TextureEncoding::Linear => "linear",
            TextureEncoding::Srgb => "srgb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wrapping {
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapLinear,
}

impl FilterMode {
    pub fn uses_mipmaps(self) -> bool {
        matches!(
            self,
            FilterMode::NearestMipmapNearest | FilterMode::LinearMipmapLinear
        )
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ImageData {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.pixels.len() == (self.width as usize * self.height as usize * 4)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextureImage {
    /// Nothing to upload yet (e.g. still loading).
    Empty,
    Rgba8(ImageData),
    /// Streaming source; re-uploaded once for every distinct `frame`.
    Video { frame: u64, image: ImageData },
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub id: Uuid,
    pub image: TextureImage,
    pub wrap_s: Wrapping,
    pub wrap_t: Wrapping,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub generate_mipmaps: bool,
    pub encoding: TextureEncoding,
    pub flip_y: bool,
    pub version: u64,
}

impl Texture {
    pub fn new(image: TextureImage) -> Self {
        Self {
            id: Uuid::new_v4(),
            image,
            wrap_s: Wrapping::ClampToEdge,
            wrap_t: Wrapping::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::LinearMipmapLinear,
            generate_mipmaps: true,
            encoding: TextureEncoding::Linear,
            flip_y: false,
            version: 0,
        }
    }

    pub fn from_image(image: ImageData) -> Self {
        Self::new(TextureImage::Rgba8(image))
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub fn image_data(&self) -> Option<&ImageData> {
        match &self.image {
            TextureImage::Empty => None,
            TextureImage::Rgba8(image) | TextureImage::Video { image, .. } => Some(image),
        }
    }

    /// Pixels are present and complete.
    pub fn is_ready(&self) -> bool {
        self.image_data().is_some_and(ImageData::is_complete)
    }

    pub fn video_frame(&self) -> Option<u64> {
        match &self.image {
            TextureImage::Video { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    /// Wrap or filter settings that only work on power-of-two images
    /// for devices without full NPOT support.
    pub fn requires_power_of_two(&self) -> bool {
        self.wrap_s != Wrapping::ClampToEdge
            || self.wrap_t != Wrapping::ClampToEdge
            || self.min_filter.uses_mipmaps()
    }
}

pub fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Largest power of two not above `value` (at least 1).
pub fn floor_power_of_two(value: u32) -> u32 {
    if value == 0 {
        1
    } else {
        1 << (31 - value.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_power_of_two_rounds_down() {
        assert_eq!(floor_power_of_two(1), 1);
        assert_eq!(floor_power_of_two(300), 256);
        assert_eq!(floor_power_of_two(512), 512);
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(96));
    }

    #[test]
    fn empty_or_truncated_images_are_not_ready() {
        assert!(!Texture::new(TextureImage::Empty).is_ready());
        let truncated = ImageData::new(2, 2, vec![0; 4]);
        assert!(!Texture::from_image(truncated).is_ready());
        assert!(Texture::from_image(ImageData::solid(2, 2, [255; 4])).is_ready());
    }
}
