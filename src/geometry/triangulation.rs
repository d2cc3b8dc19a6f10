//! Two-view triangulation of bearing observations.

use nalgebra::{Matrix4, RowVector4, Vector3, Vector4};

use super::SE3;

/// Triangulate a world point from two bearing observations by DLT.
///
/// Each view contributes two rows of the homogeneous system built from the
/// cross product `bearing × (P * X) = 0`, where `P = [R | t]` is the view's
/// world→camera transform.
///
/// Returns `None` when the system is degenerate (parallel bearings, point at
/// infinity).
pub fn triangulate(
    bearing_1: &Vector3<f64>,
    pose_1_cw: &SE3,
    bearing_2: &Vector3<f64>,
    pose_2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_rows(pose_1_cw);
    let p2 = projection_rows(pose_2_cw);

    let mut a = Matrix4::zeros();
    a.set_row(0, &(bearing_1.x * p1[2] - bearing_1.z * p1[0]));
    a.set_row(1, &(bearing_1.y * p1[2] - bearing_1.z * p1[1]));
    a.set_row(2, &(bearing_2.x * p2[2] - bearing_2.z * p2[0]));
    a.set_row(3, &(bearing_2.y * p2[2] - bearing_2.z * p2[1]));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h: Vector4<f64> = v_t.row(3).transpose();
    if h.w.abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w))
}

fn projection_rows(pose: &SE3) -> [RowVector4<f64>; 3] {
    let r = pose.rotation_matrix();
    let t = pose.translation;
    [
        RowVector4::new(r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x),
        RowVector4::new(r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y),
        RowVector4::new(r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z),
    ]
}

/// Cosine of the parallax angle between the rays from two camera centers to a
/// world point.
pub fn parallax_cosine(
    point_world: &Vector3<f64>,
    center_1: &Vector3<f64>,
    center_2: &Vector3<f64>,
) -> f64 {
    let ray_1 = point_world - center_1;
    let ray_2 = point_world - center_2;
    let denom = ray_1.norm() * ray_2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    (ray_1.dot(&ray_2) / denom).clamp(-1.0, 1.0)
}

/// Depth of a world point in a camera given its `T_cw` pose.
pub fn depth_in_camera(point_world: &Vector3<f64>, pose_cw: &SE3) -> f64 {
    pose_cw.transform_point(point_world).z
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_triangulate_known_point() {
        let point = Vector3::new(0.5, -0.2, 4.0);
        let pose_1 = SE3::identity();
        // Second camera translated 0.5 m along +X: t_cw = -R * C = (-0.5, 0, 0).
        let pose_2 = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));

        let b1 = pose_1.transform_point(&point).normalize();
        let b2 = pose_2.transform_point(&point).normalize();

        let result = triangulate(&b1, &pose_1, &b2, &pose_2).unwrap();
        assert_relative_eq!(result, point, epsilon = 1e-9);
    }

    #[test]
    fn test_triangulate_degenerate_baseline() {
        // Identical views give a rank-deficient system; the recovered point
        // is unusable (at infinity or behind), signalled by None or a huge
        // magnitude.
        let point = Vector3::new(0.0, 0.0, 2.0);
        let pose = SE3::identity();
        let b = point.normalize();
        match triangulate(&b, &pose, &b, &pose) {
            None => {}
            Some(p) => assert!(p.norm() > 1e6 || !p.z.is_finite() || p.z <= 0.0 || p.norm() > 100.0),
        }
    }

    #[test]
    fn test_parallax_cosine_orthogonal_rays() {
        let point = Vector3::new(0.0, 0.0, 1.0);
        let c1 = Vector3::new(-1.0, 0.0, 1.0);
        let c2 = Vector3::new(0.0, 0.0, 0.0);
        let cos = parallax_cosine(&point, &c1, &c2);
        assert_relative_eq!(cos, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_depth_sign() {
        let pose = SE3::identity();
        assert!(depth_in_camera(&Vector3::new(0.0, 0.0, 3.0), &pose) > 0.0);
        assert!(depth_in_camera(&Vector3::new(0.0, 0.0, -3.0), &pose) < 0.0);
    }
}
