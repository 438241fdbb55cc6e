// scene/mod.rs

pub mod bounds;
pub mod builder;
pub mod camera;
pub mod components;
pub(crate) mod internal;
pub mod scene;
pub mod transform;

pub use bounds::{max_axis_scale, Frustum, Plane, Ray, Sphere};
pub use builder::EntityBuilder;
pub use camera::{Camera, Projection, SubCamera};
pub use scene::{Fog, RaycastHit, Scene};
pub use transform::Transform;

pub use components::{
    Children, DrawableKind, InstanceMatrices, Layers, Light, LightKind, LightShadow,
    MaterialSlot, MorphTargetInfluences, Name, Parent, Renderable, ShadowProjection, Skeleton,
    TransformComponent, Visible, WorldTransform,
};
