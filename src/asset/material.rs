use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use uuid::Uuid;

use super::{Handle, Texture};
use crate::scene::Plane;

/// User supplied WGSL. Both halves are concatenated into one module that must
/// expose `vs_main` and `fs_main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Basic,
    Lambert,
    Phong,
    Standard,
    /// Packs fragment depth into RGBA8; used by directional and spot shadows.
    Depth,
    /// Packs distance to the light; used by point light shadows.
    Distance,
    LineBasic,
    Points,
    Sprite,
    Shader(ShaderSource),
}

impl MaterialKind {
    /// Stable shader identity; `None` for custom shaders.
    pub fn shader_id(&self) -> Option<&'static str> {
        Some(match self {
            MaterialKind::Basic => "basic",
            MaterialKind::Lambert => "lambert",
            MaterialKind::Phong => "phong",
            MaterialKind::Standard => "standard",
            MaterialKind::Depth => "depth",
            MaterialKind::Distance => "distance",
            MaterialKind::LineBasic => "line_basic",
            MaterialKind::Points => "points",
            MaterialKind::Sprite => "sprite",
            MaterialKind::Shader(_) => return None,
        })
    }

    pub fn is_lit(&self) -> bool {
        matches!(
            self,
            MaterialKind::Lambert | MaterialKind::Phong | MaterialKind::Standard
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Front,
    Back,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blending {
    None,
    Normal,
    Additive,
    Multiply,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialMaps {
    pub map: Option<Handle<Texture>>,
    pub normal_map: Option<Handle<Texture>>,
    pub emissive_map: Option<Handle<Texture>>,
    pub alpha_map: Option<Handle<Texture>>,
    pub ao_map: Option<Handle<Texture>>,
    pub roughness_map: Option<Handle<Texture>>,
    pub metalness_map: Option<Handle<Texture>>,
    pub specular_map: Option<Handle<Texture>>,
}

impl MaterialMaps {
    pub const DEFINES: [&'static str; 8] = [
        "MAP",
        "NORMAL_MAP",
        "EMISSIVE_MAP",
        "ALPHA_MAP",
        "AO_MAP",
        "ROUGHNESS_MAP",
        "METALNESS_MAP",
        "SPECULAR_MAP",
    ];

    /// Bound maps in texture-unit order, with their shader define names.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Handle<Texture>)> {
        let handles = [
            self.map,
            self.normal_map,
            self.emissive_map,
            self.alpha_map,
            self.ao_map,
            self.roughness_map,
            self.metalness_map,
            self.specular_map,
        ];
        Self::DEFINES
            .into_iter()
            .zip(handles)
        .filter_map(|(name, handle)| handle.map(|handle| (name, handle)))
    }
}

/// Hook run on the generated shader source before compilation. `key`
/// identifies what the hook does and takes part in program sharing: two
/// materials whose hooks share a key may share a program.
#[derive(Clone)]
pub struct OnBeforeCompile {
    pub key: String,
    pub hook: Arc<dyn Fn(&mut String) + Send + Sync>,
}

impl OnBeforeCompile {
    pub fn new(key: impl Into<String>, hook: impl Fn(&mut String) + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            hook: Arc::new(hook),
        }
    }
}

impl fmt::Debug for OnBeforeCompile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnBeforeCompile")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Material {
    pub id: Uuid,
    pub name: String,
    pub kind: MaterialKind,

    pub visible: bool,
    pub transparent: bool,
    pub opacity: f32,
    pub alpha_test: f32,
    pub side: Side,
    pub shadow_side: Option<Side>,
    pub blending: Blending,
    pub depth_test: bool,
    pub depth_write: bool,
    pub wireframe: bool,

    pub color: Vec3,
    pub emissive: Vec3,
    pub roughness: f32,
    pub metalness: f32,
    pub shininess: f32,
    /// Point size for `Points` materials.
    pub size: f32,
    pub maps: MaterialMaps,

    pub skinning: bool,
    pub morph_targets: bool,
    pub morph_normals: bool,
    pub vertex_colors: bool,
    pub flat_shading: bool,
    pub fog: bool,
    pub lights: bool,

    pub clipping_planes: Vec<Plane>,
    pub clip_intersection: bool,
    pub clip_shadows: bool,

    pub custom_depth_material: Option<Handle<Material>>,
    pub custom_distance_material: Option<Handle<Material>>,
    pub on_before_compile: Option<OnBeforeCompile>,

    pub version: u64,
}

impl Material {
    pub fn new(kind: MaterialKind) -> Self {
        let lights = kind.is_lit();
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            kind,
            visible: true,
            transparent: false,
            opacity: 1.0,
            alpha_test: 0.0,
            side: Side::Front,
            shadow_side: None,
            blending: Blending::Normal,
            depth_test: true,
            depth_write: true,
            wireframe: false,
            color: Vec3::ONE,
            emissive: Vec3::ZERO,
            roughness: 1.0,
            metalness: 0.0,
            shininess: 30.0,
            size: 1.0,
            maps: MaterialMaps::default(),
            skinning: false,
            morph_targets: false,
            morph_normals: false,
            vertex_colors: false,
            flat_shading: false,
            fog: true,
            lights,
            clipping_planes: Vec::new(),
            clip_intersection: false,
            clip_shadows: false,
            custom_depth_material: None,
            custom_distance_material: None,
            on_before_compile: None,
            version: 0,
        }
    }

    pub fn basic(color: Vec3) -> Self {
        Self::new(MaterialKind::Basic).with_color(color)
    }

    pub fn standard(color: Vec3) -> Self {
        Self::new(MaterialKind::Standard).with_color(color)
    }

    pub fn shader(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::new(MaterialKind::Shader(ShaderSource {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }))
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    pub fn with_transparency(mut self, opacity: f32) -> Self {
        self.transparent = true;
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn with_map(mut self, texture: Handle<Texture>) -> Self {
        self.maps.map = Some(texture);
        self
    }

    pub fn with_clipping_planes(mut self, planes: Vec<Plane>) -> Self {
        self.clipping_planes = planes;
        self
    }

    pub fn with_on_before_compile(mut self, hook: OnBeforeCompile) -> Self {
        self.on_before_compile = Some(hook);
        self
    }

    /// Signals that a compile-relevant property changed.
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Side rendered during the shadow pass when no explicit override is set.
    pub fn effective_shadow_side(&self) -> Side {
        self.shadow_side.unwrap_or(match self.side {
            Side::Front => Side::Back,
            Side::Back => Side::Front,
            Side::Double => Side::Double,
        })
    }
}
