//! WGSL program assembly.
//!
//! Every program is one module: a generated prelude (feature constants, the
//! vertex input struct and accessors, texture bindings) followed by the
//! shared chunks and the material's stage code.

use std::fmt::Write as _;

use super::programs::{ProgramFeatures, ProgramParameters, VertexInput};
use crate::asset::{MaterialMaps, TextureEncoding};
use crate::settings::ShadowMapKind;

const COMMON: &str = include_str!("../shader/common.wgsl");
const VERTEX: &str = include_str!("../shader/vertex.wgsl");
const MESH: &str = include_str!("../shader/mesh.wgsl");
const DEPTH: &str = include_str!("../shader/depth.wgsl");
const DISTANCE: &str = include_str!("../shader/distance.wgsl");

/// Fixed shader input locations.
pub mod locations {
    pub const POSITION: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const UV: u32 = 2;
    pub const COLOR: u32 = 3;
    pub const SKIN_INDEX: u32 = 4;
    pub const SKIN_WEIGHT: u32 = 5;
    /// Four slots: morphed positions, or two positions then two normals.
    pub const MORPH: u32 = 6;
    pub const MORPH_SLOTS: u32 = 4;
    /// Four consecutive slots, one per matrix column.
    pub const INSTANCE_MATRIX: u32 = 10;
}

pub fn build_program_source(parameters: &ProgramParameters) -> String {
    let mut source = prelude(parameters);
    source.push_str(COMMON);
    source.push('\n');

    match (&parameters.custom_source, parameters.shader_id) {
        (Some(custom), _) => {
            source.push_str(&custom.vertex);
            source.push('\n');
            source.push_str(&custom.fragment);
        }
        (None, Some("depth")) => {
            source.push_str(VERTEX);
            source.push('\n');
            source.push_str(DEPTH);
        }
        (None, Some("distance")) => {
            source.push_str(VERTEX);
            source.push('\n');
            source.push_str(DISTANCE);
        }
        (None, _) => {
            source.push_str(VERTEX);
            source.push('\n');
            source.push_str(MESH);
        }
    }

    source
}

fn shading_model(parameters: &ProgramParameters) -> u32 {
    if !parameters.features.contains(ProgramFeatures::LIGHTS) {
        return 0;
    }
    match parameters.shader_id {
        Some("lambert") => 1,
        Some("phong") => 2,
        Some("standard") => 3,
        _ => 0,
    }
}

fn prelude(parameters: &ProgramParameters) -> String {
    let mut out = String::with_capacity(4096);
    let _ = writeln!(out, "// {}", parameters.label);

    for (flag, name) in ProgramFeatures::NAMED {
        let _ = writeln!(
            out,
            "const {}: bool = {};",
            name,
            parameters.features.contains(flag)
        );
    }
    let _ = writeln!(
        out,
        "const SPRITE: bool = {};",
        parameters.shader_id == Some("sprite")
    );
    let _ = writeln!(out, "const SHADING: u32 = {}u;", shading_model(parameters));

    let lights = &parameters.lights;
    let units = &parameters.shadow_units;
    let counts = [
        ("NUM_DIR_LIGHTS", lights.directional),
        ("NUM_POINT_LIGHTS", lights.point),
        ("NUM_SPOT_LIGHTS", lights.spot),
        ("NUM_HEMI_LIGHTS", lights.hemisphere),
        ("NUM_RECT_AREA_LIGHTS", lights.rect_area),
        ("NUM_DIR_LIGHT_SHADOWS", units.directional),
        ("NUM_SPOT_LIGHT_SHADOWS", units.spot),
        ("NUM_POINT_LIGHT_SHADOWS", units.point),
        ("NUM_CLIPPING_PLANES", parameters.clipping.num_planes),
        ("NUM_CLIP_INTERSECTION", parameters.clipping.num_intersection),
        ("NUM_MORPH_TARGETS", parameters.morph_targets),
    ];
    for (name, value) in counts {
        let _ = writeln!(out, "const {name}: u32 = {value}u;");
    }

    let slots = [
        ("DIR_LIGHT_SLOTS", lights.directional),
        ("POINT_LIGHT_SLOTS", lights.point),
        ("SPOT_LIGHT_SLOTS", lights.spot),
        ("HEMI_LIGHT_SLOTS", lights.hemisphere),
        ("RECT_AREA_LIGHT_SLOTS", lights.rect_area),
        ("DIR_SHADOW_SLOTS", lights.directional_shadows),
        ("POINT_SHADOW_SLOTS", lights.point_shadows),
        ("SPOT_SHADOW_SLOTS", lights.spot_shadows),
        ("CLIPPING_PLANE_SLOTS", parameters.clipping.num_planes),
        ("BONE_SLOTS", parameters.max_bones),
    ];
    for (name, value) in slots {
        let _ = writeln!(out, "const {name}: u32 = {}u;", value.max(1));
    }

    let fog = match parameters.fog {
        Some("fog_linear") => 1,
        Some("fog_exp2") => 2,
        _ => 0,
    };
    let shadow_map = match parameters.shadow_map {
        None | Some(ShadowMapKind::Basic) => 0,
        Some(ShadowMapKind::Pcf) => 1,
        Some(ShadowMapKind::PcfSoft) => 2,
    };
    let _ = writeln!(out, "const FOG_KIND: u32 = {fog}u;");
    let _ = writeln!(out, "const SHADOWMAP_TYPE: u32 = {shadow_map}u;");
    let _ = writeln!(
        out,
        "const TONE_MAPPING: u32 = {}u;",
        parameters.tone_mapping.shader_index()
    );
    let _ = writeln!(
        out,
        "const OUTPUT_SRGB: bool = {};",
        parameters.output_encoding == TextureEncoding::Srgb
    );
    out.push('\n');

    vertex_input(&mut out, &parameters.vertex_inputs);
    vertex_accessors(&mut out, parameters);
    texture_bindings(&mut out, parameters);
    out
}

fn vertex_input(out: &mut String, inputs: &[VertexInput]) {
    out.push_str("struct VertexInput {\n");
    for input in inputs {
        let _ = writeln!(
            out,
            "    @location({}) {}: {},",
            input.location, input.name, input.wgsl_type
        );
    }
    out.push_str("}\n\n");
}

fn has_input<'a>(parameters: &'a ProgramParameters, name: &str) -> Option<&'a VertexInput> {
    parameters.vertex_inputs.iter().find(|input| input.name == name)
}

fn vertex_accessors(out: &mut String, parameters: &ProgramParameters) {
    let features = parameters.features;

    let normal = if has_input(parameters, "normal").is_some() {
        "v.normal"
    } else {
        "vec3<f32>(0.0, 0.0, 1.0)"
    };
    let _ = writeln!(
        out,
        "fn vertex_normal(v: VertexInput) -> vec3<f32> {{ return {normal}; }}"
    );

    let uv = if has_input(parameters, "uv").is_some() {
        "v.uv"
    } else {
        "vec2<f32>(0.0)"
    };
    let _ = writeln!(out, "fn vertex_uv(v: VertexInput) -> vec2<f32> {{ return {uv}; }}");

    let color = match has_input(parameters, "color") {
        Some(input) if features.contains(ProgramFeatures::VERTEX_COLORS) => {
            if input.wgsl_type == "vec3<f32>" {
                "vec4<f32>(v.color, 1.0)"
            } else {
                "v.color"
            }
        }
        _ => "vec4<f32>(1.0)",
    };
    let _ = writeln!(
        out,
        "fn vertex_color(v: VertexInput) -> vec4<f32> {{ return {color}; }}"
    );

    out.push_str("fn morphed_position(v: VertexInput) -> vec3<f32> {\n");
    out.push_str("    var p = v.position * object.flags.x;\n");
    if features.contains(ProgramFeatures::MORPH_TARGETS) {
        for slot in 0..locations::MORPH_SLOTS {
            let name = format!("morph_target{slot}");
            if has_input(parameters, &name).is_some() {
                let _ = writeln!(
                    out,
                    "    p += object.morph_weights[{}][{}] * v.{name};",
                    slot / 4,
                    slot % 4
                );
            }
        }
    }
    out.push_str("    return p;\n}\n");

    out.push_str("fn morphed_normal(v: VertexInput) -> vec3<f32> {\n");
    out.push_str("    var n = vertex_normal(v);\n");
    if features.contains(ProgramFeatures::MORPH_NORMALS) {
        for slot in 0..locations::MORPH_SLOTS {
            let name = format!("morph_normal{slot}");
            if has_input(parameters, &name).is_some() {
                let _ = writeln!(
                    out,
                    "    n += object.morph_weights[{}][{}] * v.{name};",
                    slot / 4,
                    slot % 4
                );
            }
        }
    }
    out.push_str("    return n;\n}\n");

    let skinned = features.contains(ProgramFeatures::SKINNING)
        && has_input(parameters, "skin_index").is_some()
        && has_input(parameters, "skin_weight").is_some();
    out.push_str("fn skin_matrix(v: VertexInput) -> mat4x4<f32> {\n");
    if skinned {
        out.push_str(concat!(
            "    let i = vec4<u32>(v.skin_index);\n",
            "    let w = vec4<f32>(v.skin_weight);\n",
            "    return w.x * skinning.bones[i.x] + w.y * skinning.bones[i.y]\n",
            "        + w.z * skinning.bones[i.z] + w.w * skinning.bones[i.w];\n",
        ));
    } else {
        out.push_str("    return IDENTITY;\n");
    }
    out.push_str("}\n");

    out.push_str("fn instance_matrix(v: VertexInput) -> mat4x4<f32> {\n");
    if features.contains(ProgramFeatures::INSTANCING)
        && has_input(parameters, "instance_matrix0").is_some()
    {
        out.push_str(
            "    return mat4x4<f32>(v.instance_matrix0, v.instance_matrix1, v.instance_matrix2, v.instance_matrix3);\n",
        );
    } else {
        out.push_str("    return IDENTITY;\n");
    }
    out.push_str("}\n");
    out.push_str(concat!(
        "const IDENTITY = mat4x4<f32>(\n",
        "    vec4<f32>(1.0, 0.0, 0.0, 0.0), vec4<f32>(0.0, 1.0, 0.0, 0.0),\n",
        "    vec4<f32>(0.0, 0.0, 1.0, 0.0), vec4<f32>(0.0, 0.0, 0.0, 1.0));\n\n",
    ));
}

fn texture_unit(out: &mut String, unit: u32) {
    let _ = writeln!(
        out,
        "@group(1) @binding({}) var t_unit{unit}: texture_2d<f32>;",
        unit * 2
    );
    let _ = writeln!(
        out,
        "@group(1) @binding({}) var s_unit{unit}: sampler;",
        unit * 2 + 1
    );
}

fn texture_bindings(out: &mut String, parameters: &ProgramParameters) {
    for define in MaterialMaps::DEFINES {
        let function = define.to_ascii_lowercase();
        match parameters.maps.iter().find(|map| map.define == define) {
            Some(map) => {
                texture_unit(out, map.unit);
                let _ = writeln!(out, "const USE_{define}: bool = true;");
                let _ = writeln!(
                    out,
                    "fn sample_{function}(uv: vec2<f32>) -> vec4<f32> {{ return textureSample(t_unit{0}, s_unit{0}, uv); }}",
                    map.unit
                );
            }
            None => {
                let _ = writeln!(out, "const USE_{define}: bool = false;");
                let _ = writeln!(
                    out,
                    "fn sample_{function}(uv: vec2<f32>) -> vec4<f32> {{ return vec4<f32>(1.0); }}"
                );
            }
        }
    }

    let units = parameters.shadow_units;
    let first = units.first_unit;
    let total = if parameters.shadow_map.is_some() {
        units.total()
    } else {
        0
    };
    for index in 0..total {
        texture_unit(out, first + index);
    }
    out.push_str("fn shadow_depth(index: u32, uv: vec2<f32>) -> f32 {\n    switch index {\n");
    for index in 0..total {
        let unit = first + index;
        let _ = writeln!(
            out,
            "        case {index}u: {{ return unpack_rgba_to_depth(textureSampleLevel(t_unit{unit}, s_unit{unit}, uv, 0.0)); }}"
        );
    }
    out.push_str("        default: { return 1.0; }\n    }\n}\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::ShaderSource;
    use crate::renderer::programs::tests::parameters;
    use crate::renderer::programs::{MapBinding, ShadowUnits};

    #[test]
    fn light_arrays_never_have_zero_length() {
        let source = build_program_source(&parameters("standard"));
        assert!(source.contains("const NUM_POINT_LIGHTS: u32 = 0u;"));
        assert!(source.contains("const POINT_LIGHT_SLOTS: u32 = 1u;"));
        assert!(source.contains("fn fs_main"));
    }

    #[test]
    fn shading_model_follows_shader_and_lights() {
        assert!(build_program_source(&parameters("phong")).contains("const SHADING: u32 = 2u;"));

        let mut unlit = parameters("standard");
        unlit.features.remove(ProgramFeatures::LIGHTS);
        assert!(build_program_source(&unlit).contains("const SHADING: u32 = 0u;"));
    }

    #[test]
    fn bound_map_declares_its_unit() {
        let mut params = parameters("basic");
        params.maps.push(MapBinding {
            define: "MAP",
            unit: 0,
            encoding: TextureEncoding::Srgb,
        });
        let source = build_program_source(&params);

        assert!(source.contains("@group(1) @binding(0) var t_unit0: texture_2d<f32>;"));
        assert!(source.contains("const USE_MAP: bool = true;"));
        assert!(source.contains("const USE_NORMAL_MAP: bool = false;"));
    }

    #[test]
    fn shadow_units_get_a_case_each() {
        let mut params = parameters("standard");
        params.shadow_map = Some(ShadowMapKind::Pcf);
        params.shadow_units = ShadowUnits {
            first_unit: 2,
            directional: 1,
            spot: 0,
            point: 1,
        };
        let source = build_program_source(&params);
        let start = source.find("fn shadow_depth").unwrap();
        let end = start + source[start..].find("\n}\n").unwrap();
        let lookup = &source[start..end];

        assert!(lookup.contains("case 0u: { return unpack_rgba_to_depth(textureSampleLevel(t_unit2"));
        assert!(lookup.contains("case 1u: { return unpack_rgba_to_depth(textureSampleLevel(t_unit3"));
        assert!(!lookup.contains("case 2u"));
        assert!(source.contains("const SHADOWMAP_TYPE: u32 = 1u;"));
    }

    #[test]
    fn depth_and_distance_use_their_fragment_stage() {
        assert!(build_program_source(&parameters("depth")).contains("pack_depth_to_rgba(in.clip_position.z)"));
        assert!(build_program_source(&parameters("distance")).contains("camera.position.xyz"));
    }

    #[test]
    fn custom_source_replaces_builtin_stages() {
        let mut params = parameters("basic");
        params.shader_id = None;
        params.custom_source = Some(ShaderSource {
            vertex: "// custom vertex".into(),
            fragment: "// custom fragment".into(),
        });
        let source = build_program_source(&params);

        assert!(source.contains("// custom vertex\n// custom fragment"));
        assert!(!source.contains("fn perturb_normal"));
        assert!(source.contains("struct Camera"));
    }

    #[test]
    fn vertex_inputs_become_struct_members() {
        let mut params = parameters("basic");
        params.vertex_inputs.push(VertexInput {
            location: locations::UV,
            name: "uv",
            wgsl_type: "vec2<f32>",
        });
        let source = build_program_source(&params);

        assert!(source.contains("@location(2) uv: vec2<f32>,"));
        assert!(source.contains("fn vertex_uv(v: VertexInput) -> vec2<f32> { return v.uv; }"));
        assert!(source.contains("fn vertex_normal(v: VertexInput) -> vec3<f32> { return vec3<f32>(0.0, 0.0, 1.0); }"));
    }
}
