use glam::{Mat4, Vec3};
use uuid::Uuid;

use crate::renderer::Viewport;
use crate::scene::components::Layers;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective { fov_y_radians: f32, aspect: f32 },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
    },
}

/// A camera rendered into its own rectangle of the target.
#[derive(Clone, Debug)]
pub struct SubCamera {
    pub camera: Camera,
    pub viewport: Viewport,
}

#[derive(Clone, Debug)]
pub struct Camera {
    /// Keys the render list cache together with the scene id.
    pub id: Uuid,
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
    pub layers: Layers,
    pub sub_cameras: Vec<SubCamera>,
}

impl Camera {
    pub fn perspective(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Perspective {
                fov_y_radians,
                aspect,
            },
            near,
            far,
            ..Self::default()
        }
    }

    pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Orthographic {
                left,
                right,
                bottom,
                top,
            },
            near,
            far,
            ..Self::default()
        }
    }

    pub fn looking_at(mut self, eye: Vec3, target: Vec3) -> Self {
        self.eye = eye;
        self.target = target;
        self
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn proj(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective {
                fov_y_radians,
                aspect,
            } => Mat4::perspective_rh(fov_y_radians, aspect, self.near, self.far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
            } => Mat4::orthographic_rh(left, right, bottom, top, self.near, self.far),
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj() * self.view()
    }

    /// Inverse of the view matrix.
    pub fn world_matrix(&self) -> Mat4 {
        self.view().inverse()
    }

    pub fn position(&self) -> Vec3 {
        self.eye
    }

    pub fn is_orthographic(&self) -> bool {
        matches!(self.projection, Projection::Orthographic { .. })
    }

    /// Updates the aspect of a perspective camera; no-op for orthographic ones.
    pub fn set_aspect(&mut self, new_aspect: f32) {
        if let Projection::Perspective { aspect, .. } = &mut self.projection {
            *aspect = new_aspect;
        }
    }

    pub fn with_sub_camera(mut self, camera: Camera, viewport: Viewport) -> Self {
        self.sub_cameras.push(SubCamera { camera, viewport });
        self
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            eye: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::Perspective {
                fov_y_radians: 60f32.to_radians(),
                aspect: 1.0,
            },
            near: 0.1,
            far: 100.0,
            layers: Layers::default(),
            sub_cameras: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_proj_is_reasonable() {
        let mut cam = Camera::default();
        cam.set_aspect(16.0 / 9.0);
        let vp = cam.view_proj();
        let inv = vp.inverse();
        let id = vp * inv;
        assert!(id.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn world_matrix_places_camera_at_eye() {
        let cam = Camera::default().looking_at(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let origin = cam.world_matrix().transform_point3(Vec3::ZERO);
        assert!(origin.abs_diff_eq(Vec3::new(1.0, 2.0, 3.0), 1e-5));
    }

    #[test]
    fn orthographic_depth_maps_near_to_zero() {
        let cam = Camera::orthographic(-1.0, 1.0, -1.0, 1.0, 1.0, 10.0)
            .looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let ndc = cam.view_proj().project_point3(Vec3::new(0.0, 0.0, 4.0));
        assert!(ndc.z.abs() < 1e-5);
    }
}
