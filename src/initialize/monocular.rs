//! Two-view monocular initialization.
//!
//! Estimates a homography and an essential matrix in parallel with MSAC
//! (200 iterations each), selects the model by the score ratio
//! `SH / (SH + SF) > 0.40`, decomposes the winner into motion hypotheses,
//! and keeps the hypothesis that triangulates the most points with positive
//! depth, sufficient parallax and low reprojection error. The seed map is
//! rescaled so the median depth is 1.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::geometry::epipolar::{decompose_essential, sampson_error_sq, solve_essential_8pt};
use crate::geometry::{triangulation, SE3};
use crate::map::Frame;

#[derive(Debug, Clone)]
pub struct MonocularInitConfig {
    pub max_iterations: usize,
    /// Model selection threshold on SH / (SH + SF).
    pub homography_ratio_thr: f64,
    /// Minimum triangulated points to accept the bootstrap.
    pub min_num_triangulated: usize,
    /// Minimum parallax (degrees) across the accepted points.
    pub min_parallax_deg: f64,
    /// Reprojection gate in pixels.
    pub reprojection_err_thr: f64,
}

impl Default for MonocularInitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            homography_ratio_thr: 0.40,
            min_num_triangulated: 50,
            min_parallax_deg: 1.0,
            reprojection_err_thr: 4.0,
        }
    }
}

/// Accepted two-view bootstrap.
#[derive(Debug, Clone)]
pub struct TwoViewInit {
    /// Pose of the current frame; the reference frame is the identity.
    pub pose_2_cw: SE3,
    /// `(ref keypoint, current keypoint, world point)` triples.
    pub triangulated: Vec<(usize, usize, Vector3<f64>)>,
}

/// Attempt the bootstrap from putative matches between the reference and the
/// current frame.
pub fn initialize_two_view(
    ref_frame: &Frame,
    cur_frame: &Frame,
    matches: &[(usize, usize)],
    config: &MonocularInitConfig,
    seed: u64,
) -> Option<TwoViewInit> {
    if matches.len() < config.min_num_triangulated {
        return None;
    }

    // Normalized-plane coordinates from the undistorted bearings.
    let norm = |bearing: &Vector3<f64>| -> Option<Vector2<f64>> {
        (bearing.z > 1e-6).then(|| Vector2::new(bearing.x / bearing.z, bearing.y / bearing.z))
    };
    let mut pairs = Vec::new();
    let mut pair_indices = Vec::new();
    for &(i1, i2) in matches {
        if let (Some(p1), Some(p2)) = (norm(&ref_frame.bearings[i1]), norm(&cur_frame.bearings[i2]))
        {
            pairs.push((p1, p2));
            pair_indices.push((i1, i2));
        }
    }
    if pairs.len() < config.min_num_triangulated {
        return None;
    }

    let focal = ref_frame.camera.focal_length_x().max(1.0);
    let sigma = 1.0 / focal;
    let sigma_sq = sigma * sigma;

    let mut rng = StdRng::seed_from_u64(seed);
    let (score_h, h, inliers_h) = estimate_homography(&pairs, sigma_sq, config, &mut rng);
    let (score_e, e, inliers_e) =
        estimate_essential(ref_frame, cur_frame, &pair_indices, sigma_sq, config, &mut rng);

    let ratio = if score_h + score_e > 0.0 {
        score_h / (score_h + score_e)
    } else {
        0.0
    };
    debug!(score_h, score_e, ratio, "two-view model selection");

    let hypotheses = if ratio > config.homography_ratio_thr {
        decompose_homography(&h?)?
    } else {
        decompose_essential(&e?)?
            .into_iter()
            .map(|(r, t)| (r, t))
            .collect()
    };
    let inliers = if ratio > config.homography_ratio_thr {
        inliers_h
    } else {
        inliers_e
    };

    // Evaluate every motion hypothesis by triangulation quality.
    let mut best: Option<(usize, TwoViewInit, f64)> = None;
    for (rotation, translation) in hypotheses {
        let pose_2 = SE3::from_rt(rotation, translation);
        if let Some((count, init, parallax_deg)) = triangulate_hypothesis(
            ref_frame,
            cur_frame,
            &pair_indices,
            &inliers,
            &pose_2,
            focal,
            config,
        ) {
            if best.as_ref().map_or(true, |(c, _, _)| count > *c) {
                best = Some((count, init, parallax_deg));
            }
        }
    }

    let (count, mut init, parallax_deg) = best?;
    if count < config.min_num_triangulated || parallax_deg < config.min_parallax_deg {
        return None;
    }

    // Fix the gauge: median seed depth = 1.
    let mut depths: Vec<f64> = init.triangulated.iter().map(|(_, _, p)| p.z).collect();
    depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median_depth = depths[depths.len() / 2];
    if median_depth <= 1e-9 {
        return None;
    }
    let inv_scale = 1.0 / median_depth;
    for (_, _, p) in init.triangulated.iter_mut() {
        *p *= inv_scale;
    }
    init.pose_2_cw.translation *= inv_scale;

    debug!(
        triangulated = init.triangulated.len(),
        parallax_deg, "two-view bootstrap accepted"
    );
    Some(init)
}

// ─────────────────────────────────────────────────────────────────────────
// MSAC model estimation
// ─────────────────────────────────────────────────────────────────────────

/// χ² 95% for 1 and 2 DoF; MSAC truncation at the 2-DoF quantile.
const CHI_SQ_1D: f64 = 3.84;
const CHI_SQ_2D: f64 = 5.99;

fn estimate_essential(
    ref_frame: &Frame,
    cur_frame: &Frame,
    pair_indices: &[(usize, usize)],
    sigma_sq: f64,
    config: &MonocularInitConfig,
    rng: &mut StdRng,
) -> (f64, Option<Matrix3<f64>>, Vec<bool>) {
    let n = pair_indices.len();
    let mut best_score = 0.0;
    let mut best_model = None;
    let mut best_inliers = vec![false; n];
    let mut order: Vec<usize> = (0..n).collect();

    for _ in 0..config.max_iterations {
        order.shuffle(rng);
        let sample: Vec<(usize, usize)> = order[..8].iter().map(|&k| pair_indices[k]).collect();
        let Some(e) = solve_essential_8pt(&ref_frame.bearings, &cur_frame.bearings, &sample) else {
            continue;
        };

        let mut score = 0.0;
        let mut inliers = vec![false; n];
        for (k, &(i1, i2)) in pair_indices.iter().enumerate() {
            let err = sampson_error_sq(&e, &ref_frame.bearings[i1], &cur_frame.bearings[i2]);
            let chi_sq = err / sigma_sq;
            if chi_sq < CHI_SQ_1D {
                score += CHI_SQ_2D - chi_sq;
                inliers[k] = true;
            }
        }
        if score > best_score {
            best_score = score;
            best_model = Some(e);
            best_inliers = inliers;
        }
    }
    (best_score, best_model, best_inliers)
}

fn estimate_homography(
    pairs: &[(Vector2<f64>, Vector2<f64>)],
    sigma_sq: f64,
    config: &MonocularInitConfig,
    rng: &mut StdRng,
) -> (f64, Option<Matrix3<f64>>, Vec<bool>) {
    let n = pairs.len();
    let mut best_score = 0.0;
    let mut best_model = None;
    let mut best_inliers = vec![false; n];
    let mut order: Vec<usize> = (0..n).collect();

    for _ in 0..config.max_iterations {
        order.shuffle(rng);
        let sample: Vec<(Vector2<f64>, Vector2<f64>)> =
            order[..4].iter().map(|&k| pairs[k]).collect();
        let Some(h) = solve_homography_dlt(&sample) else {
            continue;
        };
        let Some(h_inv) = h.try_inverse() else {
            continue;
        };

        let mut score = 0.0;
        let mut inliers = vec![false; n];
        for (k, (p1, p2)) in pairs.iter().enumerate() {
            let e_fwd = transfer_error_sq(&h, p1, p2);
            let e_bwd = transfer_error_sq(&h_inv, p2, p1);
            let chi_fwd = e_fwd / sigma_sq;
            let chi_bwd = e_bwd / sigma_sq;
            if chi_fwd < CHI_SQ_2D && chi_bwd < CHI_SQ_2D {
                score += (CHI_SQ_2D - chi_fwd) + (CHI_SQ_2D - chi_bwd);
                inliers[k] = true;
            }
        }
        if score > best_score {
            best_score = score;
            best_model = Some(h);
            best_inliers = inliers;
        }
    }
    (best_score, best_model, best_inliers)
}

fn solve_homography_dlt(pairs: &[(Vector2<f64>, Vector2<f64>)]) -> Option<Matrix3<f64>> {
    if pairs.len() < 4 {
        return None;
    }
    let mut a = DMatrix::zeros(pairs.len() * 2, 9);
    for (i, (p1, p2)) in pairs.iter().enumerate() {
        let (x1, y1) = (p1.x, p1.y);
        let (x2, y2) = (p2.x, p2.y);
        let r = i * 2;
        a[(r, 0)] = -x1;
        a[(r, 1)] = -y1;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = x2 * x1;
        a[(r, 7)] = x2 * y1;
        a[(r, 8)] = x2;
        a[(r + 1, 3)] = -x1;
        a[(r + 1, 4)] = -y1;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = y2 * x1;
        a[(r + 1, 7)] = y2 * y1;
        a[(r + 1, 8)] = y2;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows() - 1);
    Some(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
    ))
}

fn transfer_error_sq(h: &Matrix3<f64>, from: &Vector2<f64>, to: &Vector2<f64>) -> f64 {
    let p = h * Vector3::new(from.x, from.y, 1.0);
    if p.z.abs() < 1e-12 {
        return f64::INFINITY;
    }
    let dx = p.x / p.z - to.x;
    let dy = p.y / p.z - to.y;
    dx * dx + dy * dy
}

/// Faugeras decomposition of a (normalized-coordinate) homography into the
/// eight (R, t) hypotheses.
fn decompose_homography(h: &Matrix3<f64>) -> Option<Vec<(Matrix3<f64>, Vector3<f64>)>> {
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let v = v_t.transpose();
    let d1 = svd.singular_values[0];
    let d2 = svd.singular_values[1];
    let d3 = svd.singular_values[2];
    if d1 / d2 < 1.0001 || d2 / d3 < 1.0001 {
        // Near-degenerate (pure rotation): no translation direction is
        // recoverable.
        return None;
    }
    let s = u.determinant() * v.determinant();

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1_signs = [aux1, aux1, -aux1, -aux1];
    let x3_signs = [aux3, -aux3, aux3, -aux3];

    let mut hypotheses = Vec::with_capacity(8);

    // Case d' = +d2.
    let sin_theta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let cos_theta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    for k in 0..4 {
        let epsilon = if x1_signs[k] >= 0.0 { 1.0 } else { -1.0 };
        let epsilon3 = if x3_signs[k] >= 0.0 { 1.0 } else { -1.0 };
        let st = epsilon * epsilon3 * sin_theta;
        let rp = Matrix3::new(cos_theta, 0.0, -st, 0.0, 1.0, 0.0, st, 0.0, cos_theta);
        let tp = Vector3::new(x1_signs[k], 0.0, -x3_signs[k]) * (d1 - d3);
        let r = s * u * rp * v_t;
        let t = u * tp;
        hypotheses.push((r, normalize_translation(t)));
    }

    // Case d' = -d2.
    let sin_phi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cos_phi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    for k in 0..4 {
        let epsilon = if x1_signs[k] >= 0.0 { 1.0 } else { -1.0 };
        let epsilon3 = if x3_signs[k] >= 0.0 { 1.0 } else { -1.0 };
        let sp = epsilon * epsilon3 * sin_phi;
        let rp = Matrix3::new(cos_phi, 0.0, sp, 0.0, -1.0, 0.0, sp, 0.0, -cos_phi);
        let tp = Vector3::new(x1_signs[k], 0.0, x3_signs[k]) * (d1 + d3);
        let r = s * u * rp * v_t;
        let t = u * tp;
        hypotheses.push((r, normalize_translation(t)));
    }

    Some(hypotheses)
}

fn normalize_translation(t: Vector3<f64>) -> Vector3<f64> {
    let n = t.norm();
    if n > 1e-12 {
        t / n
    } else {
        t
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Hypothesis evaluation
// ─────────────────────────────────────────────────────────────────────────

fn triangulate_hypothesis(
    ref_frame: &Frame,
    cur_frame: &Frame,
    pair_indices: &[(usize, usize)],
    inliers: &[bool],
    pose_2: &SE3,
    focal: f64,
    config: &MonocularInitConfig,
) -> Option<(usize, TwoViewInit, f64)> {
    let pose_1 = SE3::identity();
    let center_1 = Vector3::zeros();
    let center_2 = pose_2.camera_center();
    let reproj_thr_sq = (config.reprojection_err_thr / focal).powi(2);

    let mut triangulated = Vec::new();
    let mut parallax_cosines = Vec::new();

    for (k, &(i1, i2)) in pair_indices.iter().enumerate() {
        if !inliers[k] {
            continue;
        }
        let b1 = &ref_frame.bearings[i1];
        let b2 = &cur_frame.bearings[i2];
        let Some(point) = triangulation::triangulate(b1, &pose_1, b2, pose_2) else {
            continue;
        };
        if !point.iter().all(|v| v.is_finite()) {
            continue;
        }
        // Cheirality in both views.
        let z1 = triangulation::depth_in_camera(&point, &pose_1);
        let z2 = triangulation::depth_in_camera(&point, pose_2);
        if z1 <= 0.0 || z2 <= 0.0 {
            continue;
        }
        // Reprojection in both normalized planes.
        let e1 = {
            let dx = point.x / z1 - b1.x / b1.z;
            let dy = point.y / z1 - b1.y / b1.z;
            dx * dx + dy * dy
        };
        let p2 = pose_2.transform_point(&point);
        let e2 = {
            let dx = p2.x / z2 - b2.x / b2.z;
            let dy = p2.y / z2 - b2.y / b2.z;
            dx * dx + dy * dy
        };
        if e1 > reproj_thr_sq || e2 > reproj_thr_sq {
            continue;
        }
        parallax_cosines.push(triangulation::parallax_cosine(&point, &center_1, &center_2));
        triangulated.push((i1, i2, point));
    }

    if triangulated.is_empty() {
        return None;
    }

    // Parallax of the 50th-best point (or the worst if fewer).
    parallax_cosines.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = parallax_cosines.len().min(50) - 1;
    let parallax_deg = parallax_cosines[idx].clamp(-1.0, 1.0).acos().to_degrees();

    let count = triangulated.len();
    Some((
        count,
        TwoViewInit {
            pose_2_cw: pose_2.clone(),
            triangulated,
        },
        parallax_deg,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::KeyPoint;
    use crate::map::frame::test_support::frame_with_keypoints;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// Build two frames viewing a 3D point cloud from different poses.
    fn two_frames(points: &[Vector3<f64>], pose_2: &SE3) -> (Frame, Frame, Vec<(usize, usize)>) {
        let project = |pose: &SE3, p: &Vector3<f64>| -> Option<KeyPoint> {
            let pc = pose.transform_point(p);
            if pc.z <= 0.1 {
                return None;
            }
            let u = 500.0 * pc.x / pc.z + 320.0;
            let v = 500.0 * pc.y / pc.z + 240.0;
            (u >= 0.0 && u < 640.0 && v >= 0.0 && v < 480.0).then(|| KeyPoint::new(u, v, 0))
        };

        let mut kps_1 = Vec::new();
        let mut kps_2 = Vec::new();
        let mut matches = Vec::new();
        for p in points {
            if let (Some(k1), Some(k2)) = (project(&SE3::identity(), p), project(pose_2, p)) {
                matches.push((kps_1.len(), kps_2.len()));
                kps_1.push(k1);
                kps_2.push(k2);
            }
        }
        (
            frame_with_keypoints(0, kps_1),
            frame_with_keypoints(1, kps_2),
            matches,
        )
    }

    fn general_cloud() -> Vec<Vector3<f64>> {
        (0..120)
            .map(|i| {
                Vector3::new(
                    -1.2 + 0.02 * i as f64,
                    ((i * 7) % 13) as f64 * 0.1 - 0.6,
                    3.0 + ((i * 5) % 11) as f64 * 0.35,
                )
            })
            .collect()
    }

    #[test]
    fn test_general_scene_initializes_with_unit_median_depth() {
        let pose_2 = SE3::new(
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(Vector3::y()), 0.02),
            Vector3::new(-0.4, 0.0, 0.0),
        );
        let (f1, f2, matches) = two_frames(&general_cloud(), &pose_2);
        let config = MonocularInitConfig::default();
        let init = initialize_two_view(&f1, &f2, &matches, &config, 9).unwrap();

        assert!(init.triangulated.len() >= 100);
        // Median depth exactly 1 after gauge fixing.
        let mut depths: Vec<f64> = init.triangulated.iter().map(|(_, _, p)| p.z).collect();
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(depths[depths.len() / 2], 1.0, epsilon = 1e-9);

        // Recovered motion direction matches (scale is free).
        let dir = init.pose_2_cw.translation.normalize();
        let true_dir = pose_2.translation.normalize();
        assert!((dir - true_dir).norm() < 0.05, "direction off: {dir:?}");
    }

    #[test]
    fn test_planar_scene_homography_path() {
        // All points on the z = 4 plane: the homography must win and still
        // yield a valid reconstruction.
        let points: Vec<Vector3<f64>> = (0..120)
            .map(|i| {
                Vector3::new(
                    -1.5 + 0.025 * i as f64,
                    ((i * 7) % 13) as f64 * 0.12 - 0.7,
                    4.0,
                )
            })
            .collect();
        let pose_2 = SE3::new(
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(Vector3::y()), 0.03),
            Vector3::new(-0.5, 0.05, 0.0),
        );
        let (f1, f2, matches) = two_frames(&points, &pose_2);
        let config = MonocularInitConfig::default();
        let init = initialize_two_view(&f1, &f2, &matches, &config, 13).unwrap();
        assert!(init.triangulated.len() >= 80);

        let dir = init.pose_2_cw.translation.normalize();
        let true_dir = pose_2.translation.normalize();
        assert!((dir - true_dir).norm() < 0.08, "direction off: {dir:?}");
    }

    #[test]
    fn test_no_parallax_rejected() {
        // Pure rotation: triangulation must fail to produce a map.
        let pose_2 = SE3::new(
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(Vector3::y()), 0.05),
            Vector3::zeros(),
        );
        let (f1, f2, matches) = two_frames(&general_cloud(), &pose_2);
        let config = MonocularInitConfig::default();
        assert!(initialize_two_view(&f1, &f2, &matches, &config, 17).is_none());
    }

    #[test]
    fn test_too_few_matches_rejected() {
        let pose_2 = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.4, 0.0, 0.0));
        let (f1, f2, matches) = two_frames(&general_cloud(), &pose_2);
        let config = MonocularInitConfig::default();
        assert!(initialize_two_view(&f1, &f2, &matches[..20], &config, 3).is_none());
    }
}
