//! Two-view epipolar estimation on bearing vectors.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};

use super::skew;

/// Solve the essential matrix from ≥ 8 bearing correspondences by the
/// normalized 8-point algorithm, with the rank-2 constraint enforced.
pub fn solve_essential_8pt(
    bearings_1: &[Vector3<f64>],
    bearings_2: &[Vector3<f64>],
    indices: &[(usize, usize)],
) -> Option<Matrix3<f64>> {
    if indices.len() < 8 {
        return None;
    }
    let mut a = DMatrix::zeros(indices.len(), 9);
    for (row, &(i1, i2)) in indices.iter().enumerate() {
        let b1 = &bearings_1[i1];
        let b2 = &bearings_2[i2];
        // Row of the linear system b2^T E b1 = 0.
        a[(row, 0)] = b2.x * b1.x;
        a[(row, 1)] = b2.x * b1.y;
        a[(row, 2)] = b2.x * b1.z;
        a[(row, 3)] = b2.y * b1.x;
        a[(row, 4)] = b2.y * b1.y;
        a[(row, 5)] = b2.y * b1.z;
        a[(row, 6)] = b2.z * b1.x;
        a[(row, 7)] = b2.z * b1.y;
        a[(row, 8)] = b2.z * b1.z;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let e_vec = v_t.row(v_t.nrows() - 1);
    let e_raw = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2], e_vec[3], e_vec[4], e_vec[5], e_vec[6], e_vec[7], e_vec[8],
    );

    // Enforce rank 2 with equal singular values.
    let svd_e = e_raw.svd(true, true);
    let u = svd_e.u?;
    let v_t = svd_e.v_t?;
    let s = (svd_e.singular_values[0] + svd_e.singular_values[1]) / 2.0;
    let sigma = Matrix3::from_diagonal(&Vector3::new(s, s, 0.0));
    Some(u * sigma * v_t)
}

/// Squared Sampson distance of a correspondence in the normalized image
/// plane. Bearings are projected to z=1 first; bearings looking backwards
/// return infinity.
pub fn sampson_error_sq(e: &Matrix3<f64>, bearing_1: &Vector3<f64>, bearing_2: &Vector3<f64>) -> f64 {
    if bearing_1.z <= 1e-6 || bearing_2.z <= 1e-6 {
        return f64::INFINITY;
    }
    let x1 = Vector3::new(bearing_1.x / bearing_1.z, bearing_1.y / bearing_1.z, 1.0);
    let x2 = Vector3::new(bearing_2.x / bearing_2.z, bearing_2.y / bearing_2.z, 1.0);

    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let numerator = x2.dot(&ex1);
    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom < 1e-12 {
        return f64::INFINITY;
    }
    numerator * numerator / denom
}

/// Decompose an essential matrix into the four (R, t) motion hypotheses,
/// with `t` normalized to unit length.
pub fn decompose_essential(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();
    let t = if t.norm() > 1e-12 { t.normalize() } else { Vector3::z() };

    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Essential matrix from a relative rotation and (unit) translation:
/// `E = [t]× R`.
pub fn essential_from_rt(rotation: &UnitQuaternion<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation.to_rotation_matrix().into_inner()
}
