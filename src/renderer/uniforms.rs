// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3};

/// Morph weights the object block has room for.
pub const MAX_MORPH_WEIGHTS: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct CameraUniform {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    /// xyz world position, w is 1 for orthographic cameras.
    pub position: [f32; 4],
    /// exposure, tone mapping operator, sRGB output flag, unused
    pub tone: [f32; 4],
    /// rgb, w is the fog kind (0 none, 1 linear, 2 exp2)
    pub fog_color: [f32; 4],
    /// near, far, density, unused
    pub fog_params: [f32; 4],
    /// near, far, logical height in pixels, pixel ratio
    pub clip: [f32; 4],
}

impl CameraUniform {
    pub fn new() -> Self {
        Self {
            view: Mat4::IDENTITY.to_cols_array_2d(),
            projection: Mat4::IDENTITY.to_cols_array_2d(),
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            position: [0.0; 4],
            tone: [1.0, 0.0, 0.0, 0.0],
            fog_color: [0.0; 4],
            fog_params: [0.0; 4],
            clip: [0.1, 100.0, 1.0, 1.0],
        }
    }

    pub fn from_matrices(view: Mat4, projection: Mat4, position: Vec3, orthographic: bool) -> Self {
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            view_proj: (projection * view).to_cols_array_2d(),
            position: position.extend(if orthographic { 1.0 } else { 0.0 }).to_array(),
            ..Self::new()
        }
    }
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct ObjectUniform {
    pub model: [[f32; 4]; 4],
    pub model_view: [[f32; 4]; 4],
    /// Inverse transpose of the model-view rotation, padded to 4x4.
    pub normal_matrix: [[f32; 4]; 4],
    pub morph_weights: [[f32; 4]; 2],
    /// morph base influence, receives shadows, unused, unused
    pub flags: [f32; 4],
}

impl ObjectUniform {
    pub fn new(model: Mat4, view: Mat4) -> Self {
        let model_view = view * model;
        let normal = Mat3::from_mat4(model_view).inverse().transpose();
        Self {
            model: model.to_cols_array_2d(),
            model_view: model_view.to_cols_array_2d(),
            normal_matrix: Mat4::from_mat3(normal).to_cols_array_2d(),
            morph_weights: [[0.0; 4]; 2],
            flags: [1.0, 0.0, 0.0, 0.0],
        }
    }

    pub fn with_morph_weights(mut self, weights: &[f32]) -> Self {
        let mut packed = [0.0; MAX_MORPH_WEIGHTS];
        for (slot, weight) in packed.iter_mut().zip(weights) {
            *slot = *weight;
        }
        self.morph_weights = [
            [packed[0], packed[1], packed[2], packed[3]],
            [packed[4], packed[5], packed[6], packed[7]],
        ];
        self
    }

    pub fn with_receive_shadow(mut self, receive: bool) -> Self {
        self.flags[1] = if receive { 1.0 } else { 0.0 };
        self
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct MaterialUniform {
    /// rgb, opacity
    pub color: [f32; 4],
    pub emissive: [f32; 4],
    /// roughness, metalness, shininess, alpha test
    pub surface: [f32; 4],
    /// point size, unused x3
    pub extra: [f32; 4],
}

impl MaterialUniform {
    pub fn from_material(material: &crate::asset::Material) -> Self {
        Self {
            color: material.color.extend(material.opacity).to_array(),
            emissive: material.emissive.extend(0.0).to_array(),
            surface: [
                material.roughness,
                material.metalness,
                material.shininess,
                material.alpha_test,
            ],
            extra: [material.size, 0.0, 0.0, 0.0],
        }
    }
}

/// Packs bone matrices, padded to at least one.
pub fn skinning_bytes(bones: &[Mat4]) -> Vec<u8> {
    if bones.is_empty() {
        return bytemuck::bytes_of(&Mat4::IDENTITY.to_cols_array_2d()).to_vec();
    }
    let matrices: Vec<[[f32; 4]; 4]> = bones.iter().map(|m| m.to_cols_array_2d()).collect();
    bytemuck::cast_slice(&matrices).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Material;

    #[test]
    fn uniform_sizes_match_wgsl_layout() {
        // 3 * mat4x4<f32> + 5 * vec4<f32>
        assert_eq!(std::mem::size_of::<CameraUniform>(), 272);
        // 3 * mat4x4<f32> + 3 * vec4<f32>
        assert_eq!(std::mem::size_of::<ObjectUniform>(), 240);
        assert_eq!(std::mem::size_of::<MaterialUniform>(), 64);
    }

    #[test]
    fn orthographic_flag_in_position_w() {
        let camera = CameraUniform::from_matrices(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ONE, true);
        assert_eq!(camera.position, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn morph_weights_are_truncated() {
        let object = ObjectUniform::new(Mat4::IDENTITY, Mat4::IDENTITY)
            .with_morph_weights(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(object.morph_weights[1], [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn material_opacity_rides_in_color_alpha() {
        let material = Material::basic(Vec3::new(1.0, 0.5, 0.0)).with_transparency(0.25);
        let uniform = MaterialUniform::from_material(&material);
        assert_eq!(uniform.color, [1.0, 0.5, 0.0, 0.25]);
    }

    #[test]
    fn empty_skeleton_is_padded() {
        assert_eq!(skinning_bytes(&[]).len(), 64);
        assert_eq!(skinning_bytes(&[Mat4::IDENTITY; 3]).len(), 192);
    }
}
