//! Per (scene, camera) draw lists.
//!
//! Projection walks the scene from its roots, skips hidden subtrees, culls
//! drawables against the camera frustum and pushes one [`DrawItem`] per
//! material-resolved unit of work. Items live in an arena that is reused
//! frame to frame; the opaque and transparent lists are index sequences into
//! it.

use std::cmp::Ordering;

use fxhash::FxHashMap;
use glam::Mat4;
use uuid::Uuid;

use super::device::ProgramId;
use super::lights::FrameLight;
use crate::asset::{Geometry, GeometryGroup, Handle, Material};
use crate::scene::internal::transforms::root_entities;
use crate::scene::{
    max_axis_scale, Camera, Children, DrawableKind, Frustum, Layers, Light, MaterialSlot,
    Renderable, Scene, Sphere, Visible, WorldTransform,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    /// Position in the frame's push order; the final sort tie-breaker.
    pub id: u32,
    pub entity: hecs::Entity,
    pub kind: DrawableKind,
    pub geometry: Handle<Geometry>,
    pub material: Handle<Material>,
    /// Program the material compiled to last time, if any.
    pub program: Option<ProgramId>,
    pub render_order: i32,
    /// Normalized device depth of the object's center.
    pub z: f32,
    pub group: Option<GeometryGroup>,
    pub world_matrix: Mat4,
    pub receive_shadow: bool,
}

pub type SortFn = fn(&DrawItem, &DrawItem) -> Ordering;

/// render order, program, material, depth front to back, push order
pub fn painter_sort_stable(a: &DrawItem, b: &DrawItem) -> Ordering {
    a.render_order
        .cmp(&b.render_order)
        .then_with(|| a.program.cmp(&b.program))
        .then_with(|| a.material.index().cmp(&b.material.index()))
        .then_with(|| a.z.total_cmp(&b.z))
        .then_with(|| a.id.cmp(&b.id))
}

/// render order, depth back to front, push order
pub fn reverse_painter_sort_stable(a: &DrawItem, b: &DrawItem) -> Ordering {
    a.render_order
        .cmp(&b.render_order)
        .then_with(|| b.z.total_cmp(&a.z))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Default)]
pub struct RenderList {
    items: Vec<DrawItem>,
    live: usize,
    opaque: Vec<usize>,
    transparent: Vec<usize>,
}

impl RenderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a frame; previous items stay allocated for reuse.
    pub fn init(&mut self) {
        self.live = 0;
        self.opaque.clear();
        self.transparent.clear();
    }

    /// Writes the next arena slot. `item.id` is overwritten with the push index.
    pub fn push(&mut self, mut item: DrawItem, transparent: bool) {
        item.id = self.live as u32;
        if self.live < self.items.len() {
            self.items[self.live] = item;
        } else {
            self.items.push(item);
        }
        if transparent {
            self.transparent.push(self.live);
        } else {
            self.opaque.push(self.live);
        }
        self.live += 1;
    }

    pub fn sort(&mut self, opaque: Option<SortFn>, transparent: Option<SortFn>) {
        let items = &self.items;
        if let Some(compare) = opaque {
            if self.opaque.len() > 1 {
                self.opaque.sort_by(|&a, &b| compare(&items[a], &items[b]));
            }
        }
        if let Some(compare) = transparent {
            if self.transparent.len() > 1 {
                self.transparent.sort_by(|&a, &b| compare(&items[a], &items[b]));
            }
        }
    }

    pub fn opaque(&self) -> impl Iterator<Item = &DrawItem> + '_ {
        self.opaque.iter().map(|&i| &self.items[i])
    }

    pub fn transparent(&self) -> impl Iterator<Item = &DrawItem> + '_ {
        self.transparent.iter().map(|&i| &self.items[i])
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots allocated so far; never shrinks.
    pub fn capacity(&self) -> usize {
        self.items.len()
    }
}

/// Lists keyed by scene and camera identity.
#[derive(Default)]
pub struct RenderLists {
    lists: FxHashMap<(Uuid, Uuid), RenderList>,
}

impl RenderLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, scene: Uuid, camera: Uuid) -> &mut RenderList {
        self.lists.entry((scene, camera)).or_default()
    }

    pub fn dispose(&mut self) {
        self.lists.clear();
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Walks visible entities depth first from the roots, children in order.
/// Invisible entities are skipped along with their whole subtree.
pub(crate) fn visit_visible(scene: &Scene, mut visit: impl FnMut(hecs::Entity, &Mat4)) {
    let world = &scene.world;
    let mut stack: Vec<hecs::Entity> = root_entities(world);
    stack.reverse();

    while let Some(entity) = stack.pop() {
        let visible = world.get::<&Visible>(entity).map_or(true, |v| v.0);
        if !visible {
            continue;
        }

        let matrix = world
            .get::<&WorldTransform>(entity)
            .map(|wt| wt.0)
            .unwrap_or(Mat4::IDENTITY);
        visit(entity, &matrix);

        if let Ok(children) = world.get::<&Children>(entity) {
            stack.extend(children.0.iter().rev());
        }
    }
}

/// World-space bound used for culling, `None` when the drawable is not
/// culled at all.
pub(crate) fn culling_sphere(
    renderable: &Renderable,
    geometry: &Geometry,
    world_matrix: &Mat4,
) -> Option<Sphere> {
    match renderable.kind {
        DrawableKind::Sprite => Some(Sphere::new(
            world_matrix.w_axis.truncate(),
            std::f32::consts::FRAC_1_SQRT_2 * max_axis_scale(world_matrix),
        )),
        DrawableKind::InstancedMesh { .. } => None,
        _ => Some(
            geometry
                .bounding_sphere
                .unwrap_or(Sphere::EMPTY)
                .transformed(world_matrix),
        ),
    }
}

pub(crate) struct Projection<'a> {
    pub sort_objects: bool,
    pub program_of: &'a dyn Fn(Handle<Material>) -> Option<ProgramId>,
}

/// Fills `list` and `lights` for one camera.
pub(crate) fn project_scene(
    scene: &Scene,
    camera: &Camera,
    projection: &Projection<'_>,
    list: &mut RenderList,
    lights: &mut Vec<FrameLight>,
) {
    let view_proj = camera.view_proj();
    let frustum = Frustum::from_matrix(&view_proj);
    let world = &scene.world;
    let assets = &scene.assets;

    visit_visible(scene, |entity, world_matrix| {
        let layers = world.get::<&Layers>(entity).map_or(Layers::default(), |l| *l);
        if !layers.test(camera.layers) {
            return;
        }

        if let Ok(light) = world.get::<&Light>(entity) {
            lights.push(FrameLight {
                entity,
                light: *light,
                world_matrix: *world_matrix,
            });
        }

        let Ok(renderable) = world.get::<&Renderable>(entity) else {
            return;
        };
        let Some(geometry) = assets.geometries.get(renderable.geometry) else {
            return;
        };

        let sphere = culling_sphere(&renderable, geometry, world_matrix);
        if renderable.frustum_culled {
            if let Some(sphere) = sphere {
                if !frustum.intersects_sphere(&sphere) {
                    return;
                }
            }
        }

        let z = if projection.sort_objects {
            view_proj.project_point3(world_matrix.w_axis.truncate()).z
        } else {
            0.0
        };

        let mut emit = |material_handle: Handle<Material>, group: Option<GeometryGroup>| {
            let Some(material) = assets.materials.get(material_handle) else {
                return;
            };
            if !material.visible {
                return;
            }
            list.push(
                DrawItem {
                    id: 0,
                    entity,
                    kind: renderable.kind,
                    geometry: renderable.geometry,
                    material: material_handle,
                    program: (projection.program_of)(material_handle),
                    render_order: renderable.render_order,
                    z,
                    group,
                    world_matrix: *world_matrix,
                    receive_shadow: renderable.receive_shadow,
                },
                material.transparent,
            );
        };

        match &renderable.material {
            MaterialSlot::Single(material) => emit(*material, None),
            MaterialSlot::Multi(materials) => {
                for group in &geometry.groups {
                    if let Some(material) = materials.get(group.material_index) {
                        emit(*material, Some(*group));
                    }
                }
            }
        }
    });
}
