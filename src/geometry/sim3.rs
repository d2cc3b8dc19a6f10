//! Sim(3): 7-DoF similarity transforms (rotation + translation + scale).
//!
//! Monocular loop closing corrects drift in scale as well as pose, so the
//! pose graph is optimized over Sim(3). For stereo/RGB-D setups scale is
//! observable and kept fixed at 1.0.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transform: `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Drop to SE(3) by rescaling the translation: `[R | t/s]`.
    ///
    /// This is the standard way a Sim(3)-corrected keyframe pose is written
    /// back into an SE(3) map.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Homogeneous matrix `[s*R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation.to_rotation_matrix().into_inner() * self.scale));
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Inverse: `[(1/s) R^T | -(1/s) R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Compose: `S1 ∘ S2 = [s1*s2*R1*R2 | s1*R1*t2 + t1]`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Minimal 7-vector `[ω (3), t (3), ln s]`.
    pub fn log(&self) -> [f64; 7] {
        let w = self.rotation.scaled_axis();
        [
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Construct from a 7-vector `[ω, t, ln s]`.
    pub fn exp(tangent: &[f64; 7]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
