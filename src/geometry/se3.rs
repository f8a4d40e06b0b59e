//! SE3: 6-DOF rigid body transformation (rotation + translation).
//!
//! Poses stored in the scene use the camera-to-world convention (T_wc):
//! `transform_point` maps a point from the camera frame into the world frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a homogeneous 4x4 matrix of form [R | t; 0 | 1].
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Inverse: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Transform a single point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a direction vector (no translation).
    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rotated_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 1.0, 0.0)),
                0.3,
            ),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_undoes_transform() {
        let pose = rotated_pose();
        let p = Vector3::new(0.2, 0.4, 3.0);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));

        assert_relative_eq!(back, p, epsilon = 1e-12);
        assert_relative_eq!(pose.inverse().inverse().translation, pose.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_from_matrix_matches_pose() {
        let pose = rotated_pose();
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&pose.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&pose.translation);
        let back = SE3::from_matrix(m);

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        let p = Vector3::new(0.2, 0.4, 3.0);
        assert_relative_eq!(back.transform_point(&p), pose.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_transform_vector_ignores_translation() {
        let pose = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(5.0, 5.0, 5.0));
        let v = Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(pose.transform_vector(&v), v, epsilon = 1e-12);
    }
}
