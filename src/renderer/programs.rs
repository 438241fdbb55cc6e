use std::fmt::Write as _;

use bitflags::bitflags;
use fxhash::FxHashMap;

use super::clipping::ClippingCounts;
use super::device::{GraphicsDevice, ProgramDescriptor, ProgramId};
use super::lights::LightCounts;
use super::shader;
use crate::asset::{OnBeforeCompile, ShaderSource, TextureEncoding};
use crate::error::DeviceError;
use crate::settings::{ShadowMapKind, ToneMapping};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProgramFeatures: u32 {
        const SKINNING = 1 << 0;
        const MORPH_TARGETS = 1 << 1;
        const MORPH_NORMALS = 1 << 2;
        const INSTANCING = 1 << 3;
        const VERTEX_COLORS = 1 << 4;
        const FLAT_SHADING = 1 << 5;
        const DOUBLE_SIDED = 1 << 6;
        const FLIP_SIDED = 1 << 7;
        const ALPHA_TEST = 1 << 8;
        const LIGHTS = 1 << 9;
        const RECEIVE_SHADOW = 1 << 10;
        const POINTS = 1 << 11;
        const TRANSPARENT = 1 << 12;
    }
}

impl ProgramFeatures {
    /// Flags and the names they take in the fingerprint and the shader prelude.
    pub(crate) const NAMED: [(ProgramFeatures, &'static str); 13] = [
        (ProgramFeatures::SKINNING, "USE_SKINNING"),
        (ProgramFeatures::MORPH_TARGETS, "USE_MORPHTARGETS"),
        (ProgramFeatures::MORPH_NORMALS, "USE_MORPHNORMALS"),
        (ProgramFeatures::INSTANCING, "USE_INSTANCING"),
        (ProgramFeatures::VERTEX_COLORS, "USE_COLOR"),
        (ProgramFeatures::FLAT_SHADING, "FLAT_SHADED"),
        (ProgramFeatures::DOUBLE_SIDED, "DOUBLE_SIDED"),
        (ProgramFeatures::FLIP_SIDED, "FLIP_SIDED"),
        (ProgramFeatures::ALPHA_TEST, "USE_ALPHATEST"),
        (ProgramFeatures::LIGHTS, "USE_LIGHTS"),
        (ProgramFeatures::RECEIVE_SHADOW, "USE_SHADOWMAP"),
        (ProgramFeatures::POINTS, "USE_POINTS"),
        (ProgramFeatures::TRANSPARENT, "TRANSPARENT"),
    ];
}

/// One shader input; `components == 16` is a per-instance matrix that takes
/// four consecutive locations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexInput {
    pub location: u32,
    pub name: &'static str,
    pub wgsl_type: &'static str,
}

/// A material texture and the unit it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapBinding {
    pub define: &'static str,
    pub unit: u32,
    pub encoding: TextureEncoding,
}

/// Shadow maps actually bound for this program, after the unit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShadowUnits {
    pub first_unit: u32,
    pub directional: u32,
    pub spot: u32,
    pub point: u32,
}

impl ShadowUnits {
    pub fn total(&self) -> u32 {
        self.directional + self.spot + self.point
    }
}

/// Everything that decides which program a material compiles to.
#[derive(Debug, Clone)]
pub struct ProgramParameters {
    pub label: String,
    pub shader_id: Option<&'static str>,
    pub custom_source: Option<ShaderSource>,
    pub features: ProgramFeatures,
    pub vertex_inputs: Vec<VertexInput>,
    pub maps: Vec<MapBinding>,
    pub fog: Option<&'static str>,
    pub max_bones: u32,
    pub morph_targets: u32,
    pub lights: LightCounts,
    pub clipping: ClippingCounts,
    pub tone_mapping: ToneMapping,
    pub output_encoding: TextureEncoding,
    pub shadow_map: Option<ShadowMapKind>,
    pub shadow_units: ShadowUnits,
    pub on_before_compile: Option<OnBeforeCompile>,
}

impl ProgramParameters {
    /// Deterministic key; equal keys share one program.
    pub fn fingerprint(&self) -> String {
        let mut key = String::with_capacity(256);

        match (&self.shader_id, &self.custom_source) {
            (Some(id), _) => key.push_str(id),
            (None, Some(source)) => {
                key.push_str(&source.vertex);
                key.push(',');
                key.push_str(&source.fragment);
            }
            (None, None) => key.push_str("unknown"),
        }

        for (flag, name) in ProgramFeatures::NAMED {
            let _ = write!(key, ",{}={}", name, u8::from(self.features.contains(flag)));
        }
        for input in &self.vertex_inputs {
            let _ = write!(key, ",in{}:{}", input.location, input.wgsl_type);
        }
        for map in &self.maps {
            let _ = write!(key, ",{}@{}:{}", map.define, map.unit, map.encoding.key());
        }
        let _ = write!(
            key,
            ",fog={},bones={},morphs={}",
            self.fog.unwrap_or("none"),
            self.max_bones,
            self.morph_targets
        );
        let lights = &self.lights;
        let _ = write!(
            key,
            ",lights={}/{}/{}/{}/{},shadows={}/{}/{}",
            lights.directional,
            lights.point,
            lights.spot,
            lights.hemisphere,
            lights.rect_area,
            lights.directional_shadows,
            lights.point_shadows,
            lights.spot_shadows
        );
        let _ = write!(
            key,
            ",clip={}/{}",
            self.clipping.num_planes, self.clipping.num_intersection
        );
        let _ = write!(
            key,
            ",tone={},out={}",
            self.tone_mapping.key(),
            self.output_encoding.key()
        );
        match self.shadow_map {
            Some(kind) => {
                let units = self.shadow_units;
                let _ = write!(
                    key,
                    ",shadowmap={}@{}:{}/{}/{}",
                    kind.key(),
                    units.first_unit,
                    units.directional,
                    units.spot,
                    units.point
                );
            }
            None => key.push_str(",shadowmap=off"),
        }
        if let Some(hook) = &self.on_before_compile {
            key.push_str(",hook=");
            key.push_str(&hook.key);
        }

        key
    }
}

#[derive(Debug, Clone)]
pub struct ProgramEntry {
    pub fingerprint: String,
    pub label: String,
    pub program: ProgramId,
    pub use_count: u32,
}

/// Compiled programs shared between materials with equal fingerprints and
/// reference counted; a program is freed when its last user releases it.
#[derive(Default)]
pub struct ProgramCache {
    entries: FxHashMap<String, ProgramEntry>,
    by_program: FxHashMap<ProgramId, String>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared program for `parameters`, compiling it on first use.
    pub fn acquire(
        &mut self,
        device: &mut dyn GraphicsDevice,
        parameters: &ProgramParameters,
    ) -> Result<ProgramId, DeviceError> {
        let fingerprint = parameters.fingerprint();

        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.use_count += 1;
            return Ok(entry.program);
        }

        let mut source = shader::build_program_source(parameters);
        if let Some(hook) = &parameters.on_before_compile {
            (hook.hook)(&mut source);
        }

        let program = device.create_program(&ProgramDescriptor {
            label: parameters.label.clone(),
            source,
        })?;
        log::info!(
            "Compiled program {:?} ({}), {} live",
            program,
            parameters.label,
            self.entries.len() + 1
        );

        self.by_program.insert(program, fingerprint.clone());
        self.entries.insert(
            fingerprint.clone(),
            ProgramEntry {
                fingerprint,
                label: parameters.label.clone(),
                program,
                use_count: 1,
            },
        );
        Ok(program)
    }

    pub fn release(&mut self, device: &mut dyn GraphicsDevice, program: ProgramId) {
        let Some(fingerprint) = self.by_program.get(&program) else {
            log::warn!("Released unknown program {:?}", program);
            return;
        };
        let Some(entry) = self.entries.get_mut(fingerprint) else {
            return;
        };

        entry.use_count = entry.use_count.saturating_sub(1);
        if entry.use_count == 0 {
            let fingerprint = fingerprint.clone();
            self.entries.remove(&fingerprint);
            self.by_program.remove(&program);
            device.delete_program(program);
            log::trace!("Freed program {:?}", program);
        }
    }

    pub fn use_count(&self, program: ProgramId) -> u32 {
        self.by_program
            .get(&program)
            .and_then(|fingerprint| self.entries.get(fingerprint))
            .map_or(0, |entry| entry.use_count)
    }

    pub fn programs(&self) -> impl Iterator<Item = &ProgramEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.entries.drain() {
            device.delete_program(entry.program);
        }
        self.by_program.clear();
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.by_program.clear();
    }
}
