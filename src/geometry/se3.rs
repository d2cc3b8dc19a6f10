//! SE(3): rigid transforms.
//!
//! Keyframe and frame poses throughout the crate are stored as `T_cw`
//! (world→camera): `p_cam = R * p_world + t`. The camera center in world
//! coordinates is therefore `-R^T t`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

/// A rigid 3D transform: `p' = R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from a homogeneous 4×4 matrix, verifying the rotation block
    /// is orthonormal with determinant +1.
    ///
    /// Returns `None` when the block is not a valid rotation; callers that
    /// deserialize external data use this to detect corrupted poses.
    pub fn from_matrix(mat: &Matrix4<f64>) -> Option<Self> {
        const TOL: f64 = 1e-6;
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let should_be_identity = r.transpose() * r - Matrix3::identity();
        if should_be_identity.norm() > TOL || (r.determinant() - 1.0).abs() > TOL {
            return None;
        }
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Some(Self::from_rt(r, translation))
    }

    /// Homogeneous 4×4 matrix `[R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.to_rotation_matrix().into_inner());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose: `(self ∘ other)(p) = self(other(p))`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a direction (no translation).
    pub fn transform_direction(&self, d: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * d
    }

    /// Camera center in world coordinates for a `T_cw` pose.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Minimal 6-vector `[ω, v]` (rotation first).
    pub fn log(&self) -> Vector6<f64> {
        let w = self.rotation.scaled_axis();
        Vector6::new(w.x, w.y, w.z, self.translation.x, self.translation.y, self.translation.z)
    }

    /// Construct from a 6-vector `[ω, v]`. This is the first-order retraction
    /// used by the optimizers, not the exact SE(3) exponential (translation is
    /// taken verbatim).
    pub fn from_tangent(t: &Vector6<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(t[0], t[1], t[2])),
            translation: Vector3::new(t[3], t[4], t[5]),
        }
    }

    /// Left-multiply a small update: `exp([ω, v]) ∘ self`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        SE3::from_tangent(delta).compose(self)
    }

    /// Rotation angle (radians) of `self.inverse() ∘ other`.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        (self.rotation.inverse() * other.rotation).angle()
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
    use nalgebra::Unit;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.3, -1.0, 0.5)),
                0.7,
            ),
            Vector3::new(0.2, -1.5, 3.0),
        )
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = sample_pose();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let q = pose.transform_point(&p);
        let back = pose.inverse().transform_point(&q);
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = sample_pose();
        let b = SE3::new(
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::x()), 0.2),
            Vector3::new(-0.5, 0.1, 0.0),
        );
        let composed = a.compose(&b);
        assert_relative_eq!(composed.to_matrix(), a.to_matrix() * b.to_matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_camera_center() {
        let pose = sample_pose();
        // Transforming the center into the camera frame must give the origin.
        let c = pose.camera_center();
        assert_relative_eq!(pose.transform_point(&c).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_matrix_rejects_non_rotation() {
        let mut m = Matrix4::identity();
        m[(0, 0)] = 2.0;
        assert!(SE3::from_matrix(&m).is_none());

        let valid = sample_pose().to_matrix();
        assert!(SE3::from_matrix(&valid).is_some());
    }

    #[test]
    fn test_log_tangent_roundtrip() {
        let pose = sample_pose();
        let back = SE3::from_tangent(&pose.log());
        assert_relative_eq!(back.to_matrix(), pose.to_matrix(), epsilon = 1e-12);
    }
}
