use glam::{Mat3, Mat4, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    /// Bound of nothing; never intersects anything.
    pub const EMPTY: Self = Self {
        center: Vec3::ZERO,
        radius: -1.0,
    };

    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn is_empty(&self) -> bool {
        self.radius < 0.0
    }

    /// Moves the sphere into the space of `matrix`, scaling the radius by the
    /// largest axis scale.
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self {
            center: matrix.transform_point3(self.center),
            radius: self.radius * max_axis_scale(matrix),
        }
    }
}

pub fn max_axis_scale(matrix: &Mat4) -> f32 {
    let sx = matrix.x_axis.truncate().length_squared();
    let sy = matrix.y_axis.truncate().length_squared();
    let sz = matrix.z_axis.truncate().length_squared();
    sx.max(sy).max(sz).sqrt()
}

/// `normal · p + constant = 0`. Points with a positive signed distance are on
/// the kept side when used as a clip plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub constant: f32,
}

impl Plane {
    pub fn new(normal: Vec3, constant: f32) -> Self {
        Self { normal, constant }
    }

    fn from_vec4(v: Vec4) -> Self {
        let normal = v.truncate();
        let inv_len = normal.length_recip();
        if !inv_len.is_finite() {
            return Self::new(Vec3::ZERO, v.w);
        }
        Self::new(normal * inv_len, v.w * inv_len)
    }

    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.constant
    }

    pub fn coplanar_point(&self) -> Vec3 {
        self.normal * -self.constant
    }

    pub fn apply_matrix(&self, matrix: &Mat4) -> Self {
        let normal_matrix = Mat3::from_mat4(*matrix).inverse().transpose();
        let point = matrix.transform_point3(self.coplanar_point());
        let normal = (normal_matrix * self.normal).normalize_or_zero();
        Self::new(normal, -point.dot(normal))
    }

    pub fn to_vec4(&self) -> Vec4 {
        self.normal.extend(self.constant)
    }
}

/// Six planes extracted from a view-projection matrix with a 0..1 depth range.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn from_matrix(m: &Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        Self {
            planes: [
                Plane::from_vec4(r3 + r0),
                Plane::from_vec4(r3 - r0),
                Plane::from_vec4(r3 + r1),
                Plane::from_vec4(r3 - r1),
                Plane::from_vec4(r2),
                Plane::from_vec4(r3 - r2),
            ],
        }
    }

    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        if sphere.is_empty() {
            return false;
        }
        self.planes
            .iter()
            .all(|plane| plane.distance_to_point(sphere.center) >= -sphere.radius)
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.distance_to_point(point) >= 0.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Distance along the ray to the first hit on `sphere`.
    pub fn intersect_sphere(&self, sphere: &Sphere) -> Option<f32> {
        if sphere.is_empty() {
            return None;
        }
        let to_center = sphere.center - self.origin;
        let along = to_center.dot(self.direction);
        let d2 = to_center.length_squared() - along * along;
        let r2 = sphere.radius * sphere.radius;
        if d2 > r2 {
            return None;
        }
        let half_chord = (r2 - d2).sqrt();
        let t0 = along - half_chord;
        let t1 = along + half_chord;
        if t1 < 0.0 {
            None
        } else if t0 < 0.0 {
            Some(t1)
        } else {
            Some(t0)
        }
    }
}
