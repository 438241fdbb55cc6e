use std::borrow::Cow;

use fxhash::FxHashMap;
use image::imageops::{self, FilterType};
use uuid::Uuid;

use crate::asset::texture::{floor_power_of_two, is_power_of_two};
use crate::asset::{Texture, TextureEncoding};
use crate::error::DeviceError;
use crate::renderer::device::{
    DeviceCapabilities, GraphicsDevice, SamplerDescriptor, TextureDescriptor, TextureFormat,
    TextureId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTexture {
    pub texture: TextureId,
    pub version: u64,
    pub frame: Option<u64>,
    pub width: u32,
    pub height: u32,
}

/// Result of [`TextureCache::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUpdate {
    pub texture: Option<TextureId>,
    /// The image had to be resampled or shrunk to be usable.
    pub resized: bool,
}

#[derive(Default)]
pub struct TextureCache {
    textures: FxHashMap<Uuid, GpuTexture>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&GpuTexture> {
        self.textures.get(id)
    }

    /// Uploads the texture when it is new, its version moved on, or (for
    /// video sources) a new frame arrived. Images without pixels are skipped
    /// and keep whatever was uploaded before.
    pub fn update(
        &mut self,
        device: &mut dyn GraphicsDevice,
        texture: &Texture,
    ) -> Result<TextureUpdate, DeviceError> {
        let cached = self.textures.get(&texture.id).copied();

        if !texture.is_ready() {
            return Ok(TextureUpdate {
                texture: cached.map(|gpu| gpu.texture),
                resized: false,
            });
        }

        if let Some(gpu) = cached {
            if gpu.version >= texture.version && gpu.frame == texture.video_frame() {
                return Ok(TextureUpdate {
                    texture: Some(gpu.texture),
                    resized: false,
                });
            }
        }

        let Some(image) = texture.image_data() else {
            return Ok(TextureUpdate {
                texture: None,
                resized: false,
            });
        };

        let capabilities = device.capabilities();
        let (width, height) = target_size(texture, image.width, image.height, &capabilities);
        let resized = (width, height) != (image.width, image.height);
        let pixels = if resized {
            log::warn!(
                "Texture {} resized from {}x{} to {}x{}",
                texture.id,
                image.width,
                image.height,
                width,
                height
            );
            Cow::Owned(resample(&image.pixels, image.width, image.height, width, height)?)
        } else {
            Cow::Borrowed(image.pixels.as_slice())
        };

        let id = match cached {
            Some(gpu) if gpu.width == width && gpu.height == height => gpu.texture,
            other => {
                if let Some(gpu) = other {
                    device.delete_texture(gpu.texture);
                }
                device.create_texture(&descriptor(texture, width, height))?
            }
        };
        device.write_texture(id, width, height, &pixels)?;

        self.textures.insert(
            texture.id,
            GpuTexture {
                texture: id,
                version: texture.version,
                frame: texture.video_frame(),
                width,
                height,
            },
        );

        Ok(TextureUpdate {
            texture: Some(id),
            resized,
        })
    }

    pub fn remove(&mut self, device: &mut dyn GraphicsDevice, id: &Uuid) {
        if let Some(gpu) = self.textures.remove(id) {
            device.delete_texture(gpu.texture);
        }
    }

    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, gpu) in self.textures.drain() {
            device.delete_texture(gpu.texture);
        }
    }

    pub fn reset(&mut self) {
        self.textures.clear();
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

fn descriptor(texture: &Texture, width: u32, height: u32) -> TextureDescriptor {
    TextureDescriptor {
        label: format!("Texture {}", texture.id),
        width,
        height,
        format: match texture.encoding {
            TextureEncoding::Linear => TextureFormat::Rgba8Unorm,
            TextureEncoding::Srgb => TextureFormat::Rgba8UnormSrgb,
        },
        mipmaps: texture.generate_mipmaps && texture.min_filter.uses_mipmaps(),
        sampler: SamplerDescriptor {
            wrap_s: texture.wrap_s,
            wrap_t: texture.wrap_t,
            mag_filter: texture.mag_filter,
            min_filter: texture.min_filter,
        },
    }
}

/// Size the image must be uploaded at: shrunk to the device limit, then
/// rounded down to powers of two when the sampler needs them and the device
/// lacks NPOT support.
pub(crate) fn target_size(
    texture: &Texture,
    width: u32,
    height: u32,
    capabilities: &DeviceCapabilities,
) -> (u32, u32) {
    let mut size = (width, height);

    let max = capabilities.max_texture_size.max(1);
    if size.0 > max || size.1 > max {
        let scale = max as f32 / size.0.max(size.1) as f32;
        size = (
            ((size.0 as f32 * scale) as u32).max(1),
            ((size.1 as f32 * scale) as u32).max(1),
        );
    }

    let is_pot = is_power_of_two(size.0) && is_power_of_two(size.1);
    if !capabilities.npot_textures && texture.requires_power_of_two() && !is_pot {
        size = (floor_power_of_two(size.0), floor_power_of_two(size.1));
    }

    size
}

fn resample(
    pixels: &[u8],
    width: u32,
    height: u32,
    new_width: u32,
    new_height: u32,
) -> Result<Vec<u8>, DeviceError> {
    let source = image::RgbaImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        DeviceError::Unsupported(format!("pixel buffer does not match {width}x{height}"))
    })?;
    Ok(imageops::resize(&source, new_width, new_height, FilterType::Triangle).into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{ImageData, TextureImage, Wrapping};
    use crate::renderer::RecordingDevice;

    fn no_npot() -> DeviceCapabilities {
        DeviceCapabilities {
            npot_textures: false,
            ..DeviceCapabilities::default()
        }
    }

    #[test]
    fn repeat_wrap_on_npot_device_rounds_down_per_axis() {
        let mut texture = Texture::from_image(ImageData::solid(300, 100, [255; 4]));
        texture.wrap_s = Wrapping::Repeat;
        assert_eq!(target_size(&texture, 300, 100, &no_npot()), (256, 64));
    }

    #[test]
    fn clamped_linear_texture_keeps_its_size() {
        let mut texture = Texture::from_image(ImageData::solid(300, 100, [255; 4]));
        texture.min_filter = crate::asset::FilterMode::Linear;
        assert_eq!(target_size(&texture, 300, 100, &no_npot()), (300, 100));
    }

    #[test]
    fn oversized_texture_is_shrunk_to_device_limit() {
        let texture = Texture::from_image(ImageData::solid(1, 1, [0; 4]));
        let caps = DeviceCapabilities {
            max_texture_size: 1024,
            ..DeviceCapabilities::default()
        };
        assert_eq!(target_size(&texture, 4096, 2048, &caps), (1024, 512));
    }

    #[test]
    fn resampled_upload_matches_new_size() {
        let mut device = RecordingDevice::with_capabilities(no_npot());
        let mut cache = TextureCache::new();
        let texture = Texture::from_image(ImageData::solid(6, 3, [10, 20, 30, 255]));

        let update = cache.update(&mut device, &texture).unwrap();
        assert!(update.resized);
        let id = update.texture.unwrap();
        assert_eq!(device.texture_size(id), Some((4, 2)));
    }

    #[test]
    fn video_uploads_once_per_frame() {
        let mut device = RecordingDevice::new();
        let mut cache = TextureCache::new();
        let image = ImageData::solid(2, 2, [0; 4]);
        let mut texture = Texture::new(TextureImage::Video {
            frame: 0,
            image: image.clone(),
        });

        cache.update(&mut device, &texture).unwrap();
        cache.update(&mut device, &texture).unwrap();
        assert_eq!(device.texture_uploads(), 1);

        texture.image = TextureImage::Video { frame: 1, image };
        cache.update(&mut device, &texture).unwrap();
        cache.update(&mut device, &texture).unwrap();
        assert_eq!(device.texture_uploads(), 2);
    }

    #[test]
    fn empty_image_is_skipped() {
        let mut device = RecordingDevice::new();
        let mut cache = TextureCache::new();
        let texture = Texture::new(TextureImage::Empty);

        let update = cache.update(&mut device, &texture).unwrap();
        assert_eq!(update.texture, None);
        assert!(cache.is_empty());
        assert_eq!(device.live_textures(), 0);
    }
}
