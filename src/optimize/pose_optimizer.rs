//! Pose-only optimization.
//!
//! Refines a single frame pose from fixed 3D-2D correspondences on the
//! two-stage schedule: 5 iterations, χ² inlier classification, 5 iterations
//! on the inliers, reclassification, 10 final iterations, final
//! classification. Landmarks are never moved.

use nalgebra::{Matrix3x6, Matrix6, RowVector6, Vector3, Vector6};

use crate::geometry::{skew, SE3};

use super::{huber_weight, CameraConstants, CHI_SQ_2D, CHI_SQ_3D};

/// One 3D-2D correspondence.
#[derive(Debug, Clone)]
pub struct PoseObservation {
    /// Landmark position, world frame (fixed).
    pub position: Vector3<f64>,
    /// Measured normalized-plane coordinates (from the undistorted bearing).
    pub meas_x: f64,
    pub meas_y: f64,
    /// Measured stereo disparity, if available.
    pub disparity: Option<f64>,
    /// Information scale from the keypoint's pyramid level.
    pub inv_sigma_sq: f64,
}

/// Pose-only problem: pure data, no shared state.
#[derive(Debug, Clone)]
pub struct PoseProblem {
    pub initial_pose_cw: SE3,
    pub camera: CameraConstants,
    pub observations: Vec<PoseObservation>,
}

/// Result of pose-only optimization.
#[derive(Debug, Clone)]
pub struct PoseResult {
    pub pose_cw: SE3,
    /// Per-observation inlier bitmap, aligned to the problem's observations.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Non-finite cost was encountered; the caller must discard the pose.
    pub diverged: bool,
}

/// The iteration schedule: rounds of (iterations, reclassify-after).
const SCHEDULE: [usize; 3] = [5, 5, 10];

pub fn optimize_pose(problem: &PoseProblem) -> PoseResult {
    let n = problem.observations.len();
    let mut pose = problem.initial_pose_cw.clone();
    let mut inliers = vec![true; n];

    if n < 3 {
        return PoseResult {
            pose_cw: pose,
            num_inliers: 0,
            inliers,
            diverged: false,
        };
    }

    for (round, &iterations) in SCHEDULE.iter().enumerate() {
        // During refinement rounds the Huber kernel stays active; the last
        // round runs on a trimmed set so the kernel rarely saturates.
        let result = run_rounds(problem, &pose, &inliers, iterations);
        let Some(new_pose) = result else {
            return PoseResult {
                pose_cw: problem.initial_pose_cw.clone(),
                inliers: vec![false; n],
                num_inliers: 0,
                diverged: true,
            };
        };
        pose = new_pose;
        classify(problem, &pose, &mut inliers);

        // Nothing left to refine on.
        if inliers.iter().filter(|&&i| i).count() < 3 && round + 1 < SCHEDULE.len() {
            break;
        }
    }

    let num_inliers = inliers.iter().filter(|&&i| i).count();
    PoseResult {
        pose_cw: pose,
        inliers,
        num_inliers,
        diverged: false,
    }
}

/// Damped Gauss-Newton over the SE(3) tangent; `None` on non-finite cost.
fn run_rounds(
    problem: &PoseProblem,
    initial: &SE3,
    inliers: &[bool],
    iterations: usize,
) -> Option<SE3> {
    let mut pose = initial.clone();
    let mut lambda = 1e-4;
    let mut current_cost = total_cost(problem, &pose, inliers)?;

    for _ in 0..iterations {
        let mut h = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();

        for (obs, &is_inlier) in problem.observations.iter().zip(inliers.iter()) {
            if !is_inlier {
                continue;
            }
            let Some((residual, jacobian, weight)) = linearize(problem, &pose, obs) else {
                continue;
            };
            for r in 0..residual.len() {
                let jr: RowVector6<f64> = jacobian.row(r).into_owned();
                h += weight * jr.transpose() * jr;
                b += weight * residual[r] * jr.transpose();
            }
        }

        // Damped solve; retry with more damping on failure or regression.
        let mut accepted = false;
        for _ in 0..5 {
            let mut damped = h;
            for i in 0..6 {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-9);
            }
            if let Some(delta) = damped.lu().solve(&(-b)) {
                let candidate = pose.retract(&delta);
                match total_cost(problem, &candidate, inliers) {
                    Some(cost) if cost <= current_cost => {
                        pose = candidate;
                        current_cost = cost;
                        lambda = (lambda * 0.5).max(1e-10);
                        accepted = true;
                        break;
                    }
                    Some(_) => lambda *= 10.0,
                    None => return None,
                }
            } else {
                lambda *= 10.0;
            }
        }
        if !accepted {
            break;
        }
    }
    Some(pose)
}

/// Residuals, Jacobian and Huber weight of one observation at `pose`.
/// Residuals are returned as a 3-vector; the third row is zero for monocular
/// observations.
fn linearize(
    problem: &PoseProblem,
    pose: &SE3,
    obs: &PoseObservation,
) -> Option<(Vec<f64>, Matrix3x6<f64>, f64)> {
    let p_cam = pose.transform_point(&obs.position);
    if p_cam.z <= 1e-6 {
        return None;
    }
    let f = problem.camera.focal;
    let z_inv = 1.0 / p_cam.z;
    let z_inv_sq = z_inv * z_inv;

    let mut residual = vec![
        f * (p_cam.x * z_inv - obs.meas_x),
        f * (p_cam.y * z_inv - obs.meas_y),
    ];

    // de/dp_cam rows.
    let mut j_point = Matrix3x6::zeros();
    let dp = {
        // Left-multiplicative update: dp_cam/dξ = [-[p_cam]× | I].
        let mut m = Matrix3x6::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p_cam)));
        m.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&nalgebra::Matrix3::identity());
        m
    };

    let row0 = Vector3::new(f * z_inv, 0.0, -f * p_cam.x * z_inv_sq);
    let row1 = Vector3::new(0.0, f * z_inv, -f * p_cam.y * z_inv_sq);
    j_point.row_mut(0).copy_from(&(row0.transpose() * &dp));
    j_point.row_mut(1).copy_from(&(row1.transpose() * &dp));

    let delta_sq;
    if let Some(disparity) = obs.disparity {
        let fxb = problem.camera.focal_x_baseline;
        residual.push(fxb * z_inv - disparity);
        let row2 = Vector3::new(0.0, 0.0, -fxb * z_inv_sq);
        j_point.row_mut(2).copy_from(&(row2.transpose() * &dp));
        delta_sq = CHI_SQ_3D;
    } else {
        delta_sq = CHI_SQ_2D;
    }

    let chi_sq: f64 = residual.iter().map(|e| e * e).sum::<f64>() * obs.inv_sigma_sq;
    if !chi_sq.is_finite() {
        return None;
    }
    let weight = obs.inv_sigma_sq * huber_weight(chi_sq, delta_sq);
    Some((residual, j_point, weight))
}

fn total_cost(problem: &PoseProblem, pose: &SE3, inliers: &[bool]) -> Option<f64> {
    let mut cost = 0.0;
    for (obs, &is_inlier) in problem.observations.iter().zip(inliers.iter()) {
        if !is_inlier {
            continue;
        }
        cost += observation_chi_sq(problem, pose, obs).unwrap_or(1e9);
    }
    cost.is_finite().then_some(cost)
}

fn observation_chi_sq(problem: &PoseProblem, pose: &SE3, obs: &PoseObservation) -> Option<f64> {
    let p_cam = pose.transform_point(&obs.position);
    if p_cam.z <= 1e-6 {
        return None;
    }
    let f = problem.camera.focal;
    let e1 = f * (p_cam.x / p_cam.z - obs.meas_x);
    let e2 = f * (p_cam.y / p_cam.z - obs.meas_y);
    let mut chi_sq = e1 * e1 + e2 * e2;
    if let Some(disparity) = obs.disparity {
        let e3 = problem.camera.focal_x_baseline / p_cam.z - disparity;
        chi_sq += e3 * e3;
    }
    Some(chi_sq * obs.inv_sigma_sq)
}

fn classify(problem: &PoseProblem, pose: &SE3, inliers: &mut [bool]) {
    for (obs, inlier) in problem.observations.iter().zip(inliers.iter_mut()) {
        let threshold = if obs.disparity.is_some() {
            CHI_SQ_3D
        } else {
            CHI_SQ_2D
        };
        *inlier = match observation_chi_sq(problem, pose, obs) {
            Some(chi_sq) => chi_sq <= threshold,
            None => false,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// Observations of a grid of points from a known camera pose.
    fn synthetic_problem(true_pose: &SE3, outliers: usize) -> PoseProblem {
        let mut observations = Vec::new();
        for i in 0..30 {
            let position = Vector3::new(
                -1.0 + 0.07 * i as f64,
                ((i * 5) % 7) as f64 * 0.15 - 0.4,
                3.0 + (i % 4) as f64 * 0.6,
            );
            let p_cam = true_pose.transform_point(&position);
            observations.push(PoseObservation {
                position,
                meas_x: p_cam.x / p_cam.z,
                meas_y: p_cam.y / p_cam.z,
                disparity: Some(50.0 / p_cam.z),
                inv_sigma_sq: 1.0,
            });
        }
        for i in 0..outliers {
            // Wildly wrong measurements.
            let mut obs = observations[i].clone();
            obs.meas_x += 0.5;
            obs.meas_y -= 0.3;
            observations.push(obs);
        }
        PoseProblem {
            initial_pose_cw: SE3::identity(),
            camera: CameraConstants {
                focal: 500.0,
                focal_x_baseline: 50.0,
            },
            observations,
        }
    }

    fn true_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(Vector3::y()), 0.05),
            Vector3::new(0.1, -0.05, 0.2),
        )
    }

    #[test]
    fn test_converges_to_true_pose() {
        let pose = true_pose();
        let problem = synthetic_problem(&pose, 0);
        let result = optimize_pose(&problem);
        assert!(!result.diverged);
        assert_eq!(result.num_inliers, 30);
        assert_relative_eq!(
            result.pose_cw.to_matrix(),
            pose.to_matrix(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_outliers_classified() {
        let pose = true_pose();
        let problem = synthetic_problem(&pose, 6);
        let result = optimize_pose(&problem);
        assert_eq!(result.num_inliers, 30);
        for flag in &result.inliers[30..] {
            assert!(!flag);
        }
        assert_relative_eq!(
            result.pose_cw.to_matrix(),
            pose.to_matrix(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_reapplication_is_stable() {
        // A second optimization seeded with the first solution must not move
        // (idempotence within 1e-9 Frobenius norm).
        let pose = true_pose();
        let problem = synthetic_problem(&pose, 0);
        let first = optimize_pose(&problem);

        let mut problem_2 = problem.clone();
        problem_2.initial_pose_cw = first.pose_cw.clone();
        let second = optimize_pose(&problem_2);

        let diff = (first.pose_cw.to_matrix() - second.pose_cw.to_matrix()).norm();
        assert!(diff < 1e-9, "pose moved by {diff}");
    }

    #[test]
    fn test_too_few_observations() {
        let problem = PoseProblem {
            initial_pose_cw: SE3::identity(),
            camera: CameraConstants {
                focal: 500.0,
                focal_x_baseline: 0.0,
            },
            observations: Vec::new(),
        };
        let result = optimize_pose(&problem);
        assert_eq!(result.num_inliers, 0);
        assert!(!result.diverged);
    }
}
