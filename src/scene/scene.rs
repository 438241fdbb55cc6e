use glam::{Mat4, Vec3};
use hecs::World;
use uuid::Uuid;

use super::components::{Children, Parent, Renderable, WorldTransform};
use super::internal::transforms::propagate_transforms;
use super::{EntityBuilder, Ray};
use crate::asset::{Assets, Handle, Material};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fog {
    Linear { color: Vec3, near: f32, far: f32 },
    Exp2 { color: Vec3, density: f32 },
}

impl Fog {
    pub(crate) fn key(&self) -> &'static str {
        match self {
            Fog::Linear { .. } => "fog_linear",
            Fog::Exp2 { .. } => "fog_exp2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub entity: hecs::Entity,
    pub distance: f32,
}

pub struct Scene {
    /// Keys the render list cache together with the camera id.
    pub id: Uuid,
    pub world: World,
    pub assets: Assets,
    pub fog: Option<Fog>,
    /// Replaces every drawable's material when set.
    pub override_material: Option<Handle<Material>>,
    /// Recompute world transforms at the start of each render.
    pub auto_update: bool,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            world: World::new(),
            assets: Assets::default(),
            fog: None,
            override_material: None,
            auto_update: true,
        }
    }

    pub fn entity(&mut self) -> EntityBuilder<'_> {
        EntityBuilder::new(&mut self.world)
    }

    /// Links `child` under `parent`, detaching it from any previous parent.
    pub fn add_child(&mut self, parent: hecs::Entity, child: hecs::Entity) {
        if parent == child {
            log::warn!("Refusing to parent entity {:?} to itself", child);
            return;
        }

        let previous = self.world.get::<&Parent>(child).ok().map(|p| p.0);
        if let Some(previous) = previous {
            if let Ok(mut children) = self.world.get::<&mut Children>(previous) {
                children.0.retain(|&c| c != child);
            }
        }

        if let Err(e) = self.world.insert_one(child, Parent(parent)) {
            log::warn!("Failed to attach {:?} to {:?}: {:?}", child, parent, e);
            return;
        }

        let has_children = self.world.get::<&Children>(parent).is_ok();
        if has_children {
            if let Ok(mut children) = self.world.get::<&mut Children>(parent) {
                children.0.push(child);
            }
        } else if let Err(e) = self.world.insert_one(parent, Children(vec![child])) {
            log::warn!("Failed to attach {:?} to {:?}: {:?}", child, parent, e);
        }
    }

    pub fn update_world_transforms(&mut self) {
        propagate_transforms(&mut self.world);
    }

    pub fn world_matrix(&self, entity: hecs::Entity) -> Mat4 {
        self.world
            .get::<&WorldTransform>(entity)
            .map(|wt| wt.0)
            .unwrap_or(Mat4::IDENTITY)
    }

    /// Hits against the world-space bounding spheres of drawables, nearest
    /// first. Requires world transforms and bounds to be up to date.
    pub fn raycast(&self, ray: &Ray) -> Vec<RaycastHit> {
        let mut hits: Vec<RaycastHit> = self
            .world
            .query::<(&Renderable, Option<&WorldTransform>)>()
            .iter()
            .filter_map(|(entity, (renderable, world))| {
                let geometry = self.assets.geometries.get(renderable.geometry)?;
                let sphere = geometry.bounding_sphere?;
                let matrix = world.map(|w| w.0).unwrap_or(Mat4::IDENTITY);
                let distance = ray.intersect_sphere(&sphere.transformed(&matrix))?;
                Some(RaycastHit { entity, distance })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Geometry;
    use crate::scene::{Transform, TransformComponent};

    #[test]
    fn add_child_moves_between_parents() {
        let mut scene = Scene::new();
        let a = scene.world.spawn(());
        let b = scene.world.spawn(());
        let child = scene.world.spawn(());

        scene.add_child(a, child);
        scene.add_child(b, child);

        assert!(scene.world.get::<&Children>(a).unwrap().0.is_empty());
        assert_eq!(scene.world.get::<&Children>(b).unwrap().0, vec![child]);
        assert_eq!(scene.world.get::<&Parent>(child).unwrap().0, b);
    }

    #[test]
    fn raycast_returns_nearest_hit_first() {
        let mut scene = Scene::new();
        let geometry = scene.assets.geometries.insert(Geometry::cuboid(1.0, 1.0, 1.0));
        let material = scene.assets.materials.insert(Material::basic(Vec3::ONE));
        scene.assets.compute_missing_bounds();

        let far = scene.world.spawn((
            TransformComponent(Transform::from_translation(Vec3::new(0.0, 0.0, -10.0))),
            Renderable::mesh(geometry, material),
        ));
        let near = scene.world.spawn((
            TransformComponent(Transform::from_translation(Vec3::new(0.0, 0.0, -3.0))),
            Renderable::mesh(geometry, material),
        ));
        scene.update_world_transforms();

        let hits = scene.raycast(&Ray::new(Vec3::ZERO, Vec3::NEG_Z));
        let order: Vec<_> = hits.iter().map(|hit| hit.entity).collect();
        assert_eq!(order, vec![near, far]);
    }
}
