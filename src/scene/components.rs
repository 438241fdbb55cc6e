// scene/components.rs
// Pure hecs components read by the renderer

use glam::{Mat4, UVec2, Vec3};

use crate::asset::{Attribute, Geometry, Handle, Material};
use crate::scene::Transform;

// ============================================================================
// Core Components
// ============================================================================

/// Local transform (position, rotation, scale)
#[derive(Debug, Clone, Copy)]
pub struct TransformComponent(pub Transform);

/// World matrix computed from the hierarchy
#[derive(Debug, Clone, Copy)]
pub struct WorldTransform(pub Mat4);

/// Visibility flag; an invisible node hides its whole subtree
#[derive(Debug, Clone, Copy)]
pub struct Visible(pub bool);

impl Default for Visible {
    fn default() -> Self {
        Self(true)
    }
}

/// Layer membership bit mask. An object is rendered by a camera when the
/// masks share at least one bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layers(pub u32);

impl Default for Layers {
    fn default() -> Self {
        Self(1)
    }
}

impl Layers {
    pub const ALL: Self = Self(u32::MAX);

    pub fn single(layer: u32) -> Self {
        Self(1 << (layer & 31))
    }

    pub fn enable(&mut self, layer: u32) {
        self.0 |= 1 << (layer & 31);
    }

    pub fn test(&self, other: Layers) -> bool {
        self.0 & other.0 != 0
    }
}

// ============================================================================
// Drawables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawableKind {
    Mesh,
    SkinnedMesh,
    InstancedMesh { count: u32 },
    Line,
    LineSegments,
    LineLoop,
    Points,
    Sprite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialSlot {
    Single(Handle<Material>),
    /// Indexed by `GeometryGroup::material_index`.
    Multi(Vec<Handle<Material>>),
}

#[derive(Debug, Clone)]
pub struct Renderable {
    pub kind: DrawableKind,
    pub geometry: Handle<Geometry>,
    pub material: MaterialSlot,
    pub frustum_culled: bool,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub render_order: i32,
}

impl Renderable {
    pub fn new(kind: DrawableKind, geometry: Handle<Geometry>, material: Handle<Material>) -> Self {
        Self {
            kind,
            geometry,
            material: MaterialSlot::Single(material),
            frustum_culled: true,
            cast_shadow: false,
            receive_shadow: false,
            render_order: 0,
        }
    }

    pub fn mesh(geometry: Handle<Geometry>, material: Handle<Material>) -> Self {
        Self::new(DrawableKind::Mesh, geometry, material)
    }
}

/// Bone palette for skinned meshes, already multiplied by the inverse bind
/// matrices.
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    pub bone_matrices: Vec<Mat4>,
}

/// Morph target weights, one per target.
#[derive(Debug, Clone, Default)]
pub struct MorphTargetInfluences(pub Vec<f32>);

/// Per-instance model matrices for instanced meshes (item size 16).
#[derive(Debug, Clone)]
pub struct InstanceMatrices(pub Attribute);

impl InstanceMatrices {
    pub fn from_matrices(matrices: &[Mat4]) -> Self {
        let data = matrices.iter().flat_map(|m| m.to_cols_array()).collect();
        Self(Attribute::new(crate::asset::AttributeData::F32(data), 16))
    }
}

// ============================================================================
// Lighting Components
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Ambient,
    /// Shines from the light position towards `target` (world space).
    Directional { target: Vec3 },
    Point { distance: f32, decay: f32 },
    Spot {
        target: Vec3,
        distance: f32,
        decay: f32,
        /// Cone half angle in radians.
        angle: f32,
        penumbra: f32,
    },
    Hemisphere { ground_color: Vec3 },
    RectArea { width: f32, height: f32 },
}

impl LightKind {
    pub fn name(&self) -> &'static str {
        match self {
            LightKind::Ambient => "ambient",
            LightKind::Directional { .. } => "directional",
            LightKind::Point { .. } => "point",
            LightKind::Spot { .. } => "spot",
            LightKind::Hemisphere { .. } => "hemisphere",
            LightKind::RectArea { .. } => "rect_area",
        }
    }

    pub fn supports_shadows(&self) -> bool {
        matches!(
            self,
            LightKind::Directional { .. } | LightKind::Point { .. } | LightKind::Spot { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShadowProjection {
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
    },
    /// Vertical field of view in radians.
    Perspective { fov_y: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightShadow {
    /// Size of one shadow face in texels.
    pub map_size: UVec2,
    pub bias: f32,
    pub normal_bias: f32,
    pub radius: f32,
    pub projection: ShadowProjection,
    pub near: f32,
    pub far: f32,
    pub auto_update: bool,
    pub needs_update: bool,
    /// Keep global clip planes active while rendering this shadow.
    pub clip_shadows: bool,
}

impl LightShadow {
    pub fn directional() -> Self {
        Self {
            map_size: UVec2::splat(512),
            bias: 0.0,
            normal_bias: 0.0,
            radius: 1.0,
            projection: ShadowProjection::Orthographic {
                left: -5.0,
                right: 5.0,
                bottom: -5.0,
                top: 5.0,
            },
            near: 0.5,
            far: 500.0,
            auto_update: true,
            needs_update: false,
            clip_shadows: false,
        }
    }

    pub fn perspective(fov_y: f32) -> Self {
        Self {
            projection: ShadowProjection::Perspective { fov_y },
            ..Self::directional()
        }
    }

    pub fn for_light(kind: &LightKind) -> Self {
        match kind {
            LightKind::Point { .. } => Self::perspective(std::f32::consts::FRAC_PI_2),
            LightKind::Spot { angle, .. } => Self::perspective(angle * 2.0),
            _ => Self::directional(),
        }
    }

    pub fn with_map_size(mut self, size: u32) -> Self {
        self.map_size = UVec2::splat(size.max(1));
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub cast_shadow: bool,
    /// Required when `cast_shadow` is set.
    pub shadow: Option<LightShadow>,
}

impl Light {
    pub fn new(kind: LightKind, color: Vec3, intensity: f32) -> Self {
        Self {
            kind,
            color,
            intensity,
            cast_shadow: false,
            shadow: None,
        }
    }

    pub fn ambient(color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Ambient, color, intensity)
    }

    pub fn directional(color: Vec3, intensity: f32) -> Self {
        Self::new(
            LightKind::Directional { target: Vec3::ZERO },
            color,
            intensity,
        )
    }

    pub fn point(color: Vec3, intensity: f32, distance: f32) -> Self {
        Self::new(
            LightKind::Point {
                distance,
                decay: 2.0,
            },
            color,
            intensity,
        )
    }

    pub fn spot(color: Vec3, intensity: f32, angle: f32, penumbra: f32) -> Self {
        Self::new(
            LightKind::Spot {
                target: Vec3::ZERO,
                distance: 0.0,
                decay: 2.0,
                angle,
                penumbra,
            },
            color,
            intensity,
        )
    }

    /// Enables shadow casting with a default shadow record for the kind.
    pub fn with_shadow(mut self) -> Self {
        self.cast_shadow = true;
        self.shadow = Some(LightShadow::for_light(&self.kind));
        self
    }
}

// ============================================================================
// Utility Components
// ============================================================================

/// Name component for debugging
#[derive(Debug, Clone)]
pub struct Name(pub String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

// ============================================================================
// Hierarchy Components
// ============================================================================

/// Parent entity reference
#[derive(Debug, Clone, Copy)]
pub struct Parent(pub hecs::Entity);

/// List of children entities
#[derive(Debug, Clone, Default)]
pub struct Children(pub Vec<hecs::Entity>);
