//! Geometric value types and low-level multiview routines.

pub mod epipolar;
mod se3;
mod sim3;
pub mod triangulation;

pub use se3::SE3;
pub use sim3::Sim3;

use nalgebra::{Matrix3, Vector3};

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
