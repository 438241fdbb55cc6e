use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::asset::TextureEncoding;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "RenderSettings::default_pixel_ratio")]
    pub pixel_ratio: f32,
    #[serde(default)]
    pub shadow_map: ShadowMapSettings,
    #[serde(default)]
    pub tone_mapping: ToneMapping,
    #[serde(default = "RenderSettings::default_exposure")]
    pub tone_mapping_exposure: f32,
    #[serde(default)]
    pub output_encoding: TextureEncoding,
    #[serde(default = "RenderSettings::default_true")]
    pub sort_objects: bool,
    #[serde(default)]
    pub local_clipping_enabled: bool,
    #[serde(default = "RenderSettings::default_true")]
    pub auto_clear: bool,
    #[serde(default = "RenderSettings::default_clear_color")]
    pub clear_color: [f32; 4],
    #[serde(default = "RenderSettings::default_max_texture_units")]
    pub max_texture_units: u32,
    #[serde(default = "RenderSettings::default_max_bones")]
    pub max_bones: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            pixel_ratio: Self::default_pixel_ratio(),
            shadow_map: ShadowMapSettings::default(),
            tone_mapping: ToneMapping::default(),
            tone_mapping_exposure: Self::default_exposure(),
            output_encoding: TextureEncoding::default(),
            sort_objects: true,
            local_clipping_enabled: false,
            auto_clear: true,
            clear_color: Self::default_clear_color(),
            max_texture_units: Self::default_max_texture_units(),
            max_bones: Self::default_max_bones(),
        }
    }
}

impl RenderSettings {
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub(crate) fn validate(mut self) -> Self {
        if !(self.pixel_ratio.is_finite() && self.pixel_ratio > 0.0) {
            warn!("Pixel ratio must be a positive number. Using 1.0 instead.");
            self.pixel_ratio = Self::default_pixel_ratio();
        }

        if self.shadow_map.default_map_size == 0 {
            warn!("Shadow map size must be greater than zero. Using default value.");
            self.shadow_map.default_map_size = ShadowMapSettings::default_map_size();
        }

        if !(self.tone_mapping_exposure.is_finite() && self.tone_mapping_exposure >= 0.0) {
            warn!("Tone mapping exposure must be non-negative. Using 1.0 instead.");
            self.tone_mapping_exposure = Self::default_exposure();
        }

        if self.max_texture_units == 0 {
            warn!("Texture unit budget must be greater than zero. Using default value.");
            self.max_texture_units = Self::default_max_texture_units();
        }

        if self.max_bones == 0 {
            warn!("Bone budget must be greater than zero. Using default value.");
            self.max_bones = Self::default_max_bones();
        }

        self
    }

    const fn default_pixel_ratio() -> f32 {
        1.0
    }

    const fn default_exposure() -> f32 {
        1.0
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_clear_color() -> [f32; 4] {
        [0.0, 0.0, 0.0, 1.0]
    }

    const fn default_max_texture_units() -> u32 {
        16
    }

    const fn default_max_bones() -> u32 {
        1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowMapSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ShadowMapSettings::default_auto_update")]
    pub auto_update: bool,
    #[serde(default)]
    pub kind: ShadowMapKind,
    #[serde(default = "ShadowMapSettings::default_map_size")]
    pub default_map_size: u32,
}

impl Default for ShadowMapSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_update: true,
            kind: ShadowMapKind::default(),
            default_map_size: Self::default_map_size(),
        }
    }
}

impl ShadowMapSettings {
    const fn default_auto_update() -> bool {
        true
    }

    const fn default_map_size() -> u32 {
        512
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowMapKind {
    Basic,
    Pcf,
    PcfSoft,
}

impl ShadowMapKind {
    pub(crate) fn key(self) -> &'static str {
        match self {
            ShadowMapKind::Basic => "basic",
            ShadowMapKind::Pcf => "pcf",
            ShadowMapKind::PcfSoft => "pcf_soft",
        }
    }
}

impl Default for ShadowMapKind {
    fn default() -> Self {
        ShadowMapKind::Pcf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneMapping {
    None,
    Linear,
    Reinhard,
    Cineon,
    AcesFilmic,
}

impl ToneMapping {
    pub(crate) fn key(self) -> &'static str {
        match self {
            ToneMapping::None => "none",
            ToneMapping::Linear => "linear",
            ToneMapping::Reinhard => "reinhard",
            ToneMapping::Cineon => "cineon",
            ToneMapping::AcesFilmic => "aces",
        }
    }

    /// Index used by the generated shader prelude.
    pub(crate) fn shader_index(self) -> u32 {
        match self {
            ToneMapping::None => 0,
            ToneMapping::Linear => 1,
            ToneMapping::Reinhard => 2,
            ToneMapping::Cineon => 3,
            ToneMapping::AcesFilmic => 4,
        }
    }
}

impl Default for ToneMapping {
    fn default() -> Self {
        ToneMapping::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            pixel_ratio: 0.0,
            shadow_map: ShadowMapSettings {
                default_map_size: 0,
                ..ShadowMapSettings::default()
            },
            tone_mapping_exposure: f32::NAN,
            max_texture_units: 0,
            max_bones: 0,
            ..RenderSettings::default()
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();
        let defaults = RenderSettings::default();

        assert_eq!(validated.pixel_ratio, defaults.pixel_ratio);
        assert_eq!(
            validated.shadow_map.default_map_size,
            defaults.shadow_map.default_map_size
        );
        assert_eq!(
            validated.tone_mapping_exposure,
            defaults.tone_mapping_exposure
        );
        assert_eq!(validated.max_texture_units, defaults.max_texture_units);
        assert_eq!(validated.max_bones, defaults.max_bones);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RenderSettings {
            pixel_ratio: 2.0,
            tone_mapping: ToneMapping::AcesFilmic,
            tone_mapping_exposure: 0.8,
            shadow_map: ShadowMapSettings {
                enabled: true,
                auto_update: false,
                kind: ShadowMapKind::PcfSoft,
                default_map_size: 2048,
            },
            ..RenderSettings::default()
        };

        let validated = valid.clone().validate();

        assert_eq!(validated.pixel_ratio, 2.0);
        assert_eq!(validated.tone_mapping, ToneMapping::AcesFilmic);
        assert_eq!(validated.shadow_map.default_map_size, 2048);
        assert!(!validated.shadow_map.auto_update);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: RenderSettings =
            serde_json::from_str(r#"{ "shadow_map": { "enabled": true }, "tone_mapping": "reinhard" }"#)
                .unwrap();

        assert!(settings.shadow_map.enabled);
        assert!(settings.shadow_map.auto_update);
        assert_eq!(settings.shadow_map.default_map_size, 512);
        assert_eq!(settings.tone_mapping, ToneMapping::Reinhard);
        assert!(settings.sort_objects);
        assert!(settings.auto_clear);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = RenderSettings::load_from_path("definitely/not/here/settings.json");
        assert_eq!(settings.pixel_ratio, 1.0);
        assert!(!settings.shadow_map.enabled);
    }
}
