// scene/builder.rs

use hecs::World;

use super::components::*;
use crate::scene::Transform;

/// Fluent entity construction. Spawning component tuples on `Scene::world`
/// directly works just as well.
pub struct EntityBuilder<'w> {
    world: &'w mut World,
    builder: hecs::EntityBuilder,
}

impl<'w> EntityBuilder<'w> {
    pub fn new(world: &'w mut World) -> Self {
        Self {
            world,
            builder: hecs::EntityBuilder::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.builder.add(Name::new(name));
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.builder.add(TransformComponent(transform));
        self
    }

    pub fn with_renderable(mut self, renderable: Renderable) -> Self {
        self.builder.add(renderable);
        self
    }

    pub fn with_light(mut self, light: Light) -> Self {
        self.builder.add(light);
        self
    }

    pub fn with_layers(mut self, layers: Layers) -> Self {
        self.builder.add(layers);
        self
    }

    pub fn with_skeleton(mut self, skeleton: Skeleton) -> Self {
        self.builder.add(skeleton);
        self
    }

    pub fn with_morph_influences(mut self, weights: Vec<f32>) -> Self {
        self.builder.add(MorphTargetInfluences(weights));
        self
    }

    pub fn with_instances(mut self, instances: InstanceMatrices) -> Self {
        self.builder.add(instances);
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.builder.add(Visible(visible));
        self
    }

    /// Spawn the entity into the world
    pub fn spawn(mut self) -> hecs::Entity {
        self.world.spawn(self.builder.build())
    }
}
