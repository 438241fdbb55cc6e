use crate::scene::components::{Children, Parent, TransformComponent, WorldTransform};
use glam::Mat4;
use hecs::World;

/// Entities without a `Parent`, in spawn order.
pub(crate) fn root_entities(world: &World) -> Vec<hecs::Entity> {
    let mut roots: Vec<hecs::Entity> = world
        .query::<()>()
        .without::<&Parent>()
        .iter()
        .map(|(entity, _)| entity)
        .collect();
    roots.sort_by_key(|entity| entity.id());
    roots
}

pub(crate) fn propagate_transforms(world: &mut World) {
    let roots = root_entities(world);

    log::trace!("Propagating transforms from {} root entities", roots.len());

    let mut stack: Vec<(hecs::Entity, Mat4)> = Vec::new();

    for root in roots {
        stack.push((root, Mat4::IDENTITY));

        while let Some((entity, parent_world)) = stack.pop() {
            let local = world
                .get::<&TransformComponent>(entity)
                .map(|t| t.0.matrix())
                .unwrap_or(Mat4::IDENTITY);

            let world_matrix = parent_world * local;

            let mut has_world_transform = false;
            if let Ok(mut wt) = world.get::<&mut WorldTransform>(entity) {
                wt.0 = world_matrix;
                has_world_transform = true;
            }

            if !has_world_transform {
                if let Err(e) = world.insert_one(entity, WorldTransform(world_matrix)) {
                    log::error!(
                        "Failed to insert WorldTransform for entity {:?}: {:?}",
                        entity,
                        e
                    );
                    continue;
                }
                log::trace!("Inserted WorldTransform for entity {:?}", entity);
            }

            if let Ok(children) = world.get::<&Children>(entity) {
                for &child in children.0.iter().rev() {
                    stack.push((child, world_matrix));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::components::{Name, Parent};
    use crate::scene::transform::Transform;
    use glam::Vec3;

    fn world_translation(world: &World, entity: hecs::Entity) -> Vec3 {
        world
            .get::<&WorldTransform>(entity)
            .unwrap()
            .0
            .w_axis
            .truncate()
    }

    #[test]
    fn test_transform_propagation_simple() {
        let mut world = World::new();

        let parent = world.spawn((
            Name::new("Parent"),
            TransformComponent(Transform::from_translation(Vec3::new(5.0, 0.0, 0.0))),
        ));

        let child = world.spawn((
            Name::new("Child"),
            TransformComponent(Transform::from_translation(Vec3::new(2.0, 0.0, 0.0))),
            Parent(parent),
        ));

        world.insert_one(parent, Children(vec![child])).ok();

        propagate_transforms(&mut world);

        assert_eq!(world_translation(&world, parent), Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(world_translation(&world, child), Vec3::new(7.0, 0.0, 0.0));
    }

    #[test]
    fn test_transform_propagation_rotation() {
        let mut world = World::new();

        let parent = world.spawn((
            Name::new("Parent"),
            TransformComponent(Transform::from_trs(
                Vec3::ZERO,
                glam::Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
                Vec3::ONE,
            )),
        ));

        let child = world.spawn((
            Name::new("Child"),
            TransformComponent(Transform::from_translation(Vec3::new(1.0, 0.0, 0.0))),
            Parent(parent),
        ));

        world.insert_one(parent, Children(vec![child])).ok();

        propagate_transforms(&mut world);

        assert!(world_translation(&world, child).abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-5));
    }

    #[test]
    fn test_group_without_transform_is_identity() {
        let mut world = World::new();

        let group = world.spawn((Name::new("Group"),));
        let child = world.spawn((
            TransformComponent(Transform::from_translation(Vec3::new(0.0, 3.0, 0.0))),
            Parent(group),
        ));
        world.insert_one(group, Children(vec![child])).ok();

        propagate_transforms(&mut world);

        assert_eq!(world_translation(&world, group), Vec3::ZERO);
        assert_eq!(world_translation(&world, child), Vec3::new(0.0, 3.0, 0.0));
    }

    #[test]
    fn test_transform_propagation_updates_existing_world_transform() {
        let mut world = World::new();

        let parent = world.spawn((TransformComponent(Transform::IDENTITY),));
        let child = world.spawn((
            TransformComponent(Transform::from_translation(Vec3::new(2.0, 0.0, 0.0))),
            Parent(parent),
        ));
        world.insert_one(parent, Children(vec![child])).ok();

        propagate_transforms(&mut world);
        assert_eq!(world_translation(&world, child), Vec3::new(2.0, 0.0, 0.0));

        {
            let mut parent_transform = world.get::<&mut TransformComponent>(parent).unwrap();
            parent_transform.0.translation = Vec3::new(1.0, 0.0, 0.0);
        }

        propagate_transforms(&mut world);
        assert_eq!(world_translation(&world, child), Vec3::new(3.0, 0.0, 0.0));
    }
}
