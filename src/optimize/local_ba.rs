//! Bundle adjustment.
//!
//! One engine serves local BA (current keyframe's covisibility cluster,
//! outside observers fixed) and global BA (everything, origin fixed). The
//! problem is collected under the read lock, solved lock-free with the abort
//! flag polled at each outer iteration, and applied under the write lock.
//! An abort between iterations keeps the last completed iterate; an abort
//! before the first completes yields no writeback at all.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x6, Vector3, Vector6};
use tracing::debug;

use crate::geometry::{skew, SE3};
use crate::map::{KeyframeId, LandmarkId, MapDatabase};

use super::{huber_weight, CameraConstants, CHI_SQ_2D, CHI_SQ_3D};

#[derive(Debug, Clone)]
pub struct BaKeyframe {
    pub id: KeyframeId,
    pub pose_cw: SE3,
    pub fixed: bool,
}

#[derive(Debug, Clone)]
pub struct BaLandmark {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct BaObservation {
    pub kf_slot: usize,
    pub lm_slot: usize,
    pub keypoint_idx: usize,
    pub meas_x: f64,
    pub meas_y: f64,
    pub disparity: Option<f64>,
    pub inv_sigma_sq: f64,
}

#[derive(Debug, Clone)]
pub struct BaProblem {
    pub keyframes: Vec<BaKeyframe>,
    pub landmarks: Vec<BaLandmark>,
    pub observations: Vec<BaObservation>,
    pub camera: CameraConstants,
}

#[derive(Debug, Clone)]
pub struct BaResult {
    pub keyframes: Vec<(KeyframeId, SE3)>,
    pub landmarks: Vec<(LandmarkId, Vector3<f64>)>,
    /// Observations whose final error exceeds the χ² gate.
    pub outliers: Vec<(KeyframeId, LandmarkId, usize)>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub aborted: bool,
}

/// First stage iterations, then the refinement stage on inliers.
const STAGE_1_ITERATIONS: usize = 5;
const STAGE_2_ITERATIONS: usize = 10;

/// PHASE 1 (local): collect the covisibility cluster of `current`.
///
/// Variable: `current` and its first-order covisibilities. Landmarks: every
/// landmark observed by a variable keyframe. Fixed: any other keyframe
/// observing one of those landmarks, plus the origin keyframe.
pub fn collect_local_ba(map: &MapDatabase, current: KeyframeId) -> Option<BaProblem> {
    let current_kf = map.keyframe(current)?;
    let mut variable: Vec<KeyframeId> = vec![current];
    variable.extend(current_kf.connections().keys().copied());
    variable.sort();
    variable.dedup();

    collect_ba(map, &variable)
}

/// Shared collection: `variable` keyframes are optimized, observers outside
/// the set are fixed anchors, the origin keyframe is always fixed.
pub(crate) fn collect_ba(map: &MapDatabase, variable: &[KeyframeId]) -> Option<BaProblem> {
    let origin = map.origin_keyframe();
    let variable_set: std::collections::HashSet<KeyframeId> = variable.iter().copied().collect();

    // Landmarks seen by the variable set.
    let mut landmark_slots: HashMap<LandmarkId, usize> = HashMap::new();
    let mut landmarks = Vec::new();
    for &kf_id in variable {
        let kf = map.keyframe(kf_id)?;
        for (_, lm_id) in kf.landmark_associations() {
            let Some(lm) = map.landmark(lm_id) else {
                continue;
            };
            if lm.is_bad || landmark_slots.contains_key(&lm_id) {
                continue;
            }
            landmark_slots.insert(lm_id, landmarks.len());
            landmarks.push(BaLandmark {
                id: lm_id,
                position: lm.position,
            });
        }
    }
    if landmarks.is_empty() {
        return None;
    }

    // Keyframe slots: variable first, then fixed observers.
    let mut kf_slots: HashMap<KeyframeId, usize> = HashMap::new();
    let mut keyframes = Vec::new();
    let mut camera = None;
    for &kf_id in variable {
        let kf = map.keyframe(kf_id)?;
        camera.get_or_insert_with(|| CameraConstants::from_camera(&kf.camera));
        kf_slots.insert(kf_id, keyframes.len());
        keyframes.push(BaKeyframe {
            id: kf_id,
            pose_cw: kf.pose_cw().clone(),
            fixed: Some(kf_id) == origin,
        });
    }
    for lm in &landmarks {
        let observers = &map.landmark(lm.id)?.observations;
        for (&kf_id, _) in observers.iter() {
            if variable_set.contains(&kf_id) || kf_slots.contains_key(&kf_id) {
                continue;
            }
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            kf_slots.insert(kf_id, keyframes.len());
            keyframes.push(BaKeyframe {
                id: kf_id,
                pose_cw: kf.pose_cw().clone(),
                fixed: true,
            });
        }
    }

    // At least one anchor keeps the gauge.
    if !keyframes.iter().any(|kf| kf.fixed) {
        if let Some(first) = keyframes.first_mut() {
            first.fixed = true;
        }
    }

    // Observations.
    let mut observations = Vec::new();
    for (lm_slot, lm) in landmarks.iter().enumerate() {
        let lm_data = map.landmark(lm.id)?;
        for (&kf_id, &keypoint_idx) in lm_data.observations.iter() {
            let Some(&kf_slot) = kf_slots.get(&kf_id) else {
                continue;
            };
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            let bearing = &kf.bearings[keypoint_idx];
            if bearing.z <= 1e-6 {
                continue;
            }
            let kp = &kf.keypoints[keypoint_idx];
            let disparity = kf.stereo_x_right[keypoint_idx].map(|xr| kp.x - xr);
            observations.push(BaObservation {
                kf_slot,
                lm_slot,
                keypoint_idx,
                meas_x: bearing.x / bearing.z,
                meas_y: bearing.y / bearing.z,
                disparity,
                inv_sigma_sq: kf.orb_params.inv_level_sigma_sq_at(kp.octave as usize),
            });
        }
    }
    if observations.is_empty() {
        return None;
    }

    Some(BaProblem {
        keyframes,
        landmarks,
        observations,
        camera: camera?,
    })
}

/// PHASE 2: solve. Returns `None` when no iteration completed (abort or
/// divergence) — the database then stays untouched.
pub fn solve_ba(problem: &BaProblem, should_abort: &dyn Fn() -> bool) -> Option<BaResult> {
    let mut state = State::from_problem(problem);
    let mut inliers = vec![true; problem.observations.len()];

    let initial_error = state.robust_cost(problem, &inliers)?;
    let mut completed_iterations = 0usize;
    let mut aborted = false;

    'stages: for (stage, &num_iterations) in
        [STAGE_1_ITERATIONS, STAGE_2_ITERATIONS].iter().enumerate()
    {
        let mut lambda = 1e-4;
        let mut current_cost = state.robust_cost(problem, &inliers)?;
        for _ in 0..num_iterations {
            if should_abort() {
                aborted = true;
                break 'stages;
            }
            match state.step(problem, &inliers, &mut lambda, current_cost) {
                StepOutcome::Accepted(cost) => {
                    current_cost = cost;
                    completed_iterations += 1;
                }
                StepOutcome::Converged => break,
                StepOutcome::Diverged => return None,
            }
        }
        if stage == 0 {
            state.classify(problem, &mut inliers);
        }
    }

    if completed_iterations == 0 {
        return None;
    }

    state.classify(problem, &mut inliers);
    let final_error = state.robust_cost(problem, &inliers)?;

    let outliers = problem
        .observations
        .iter()
        .zip(inliers.iter())
        .filter(|(_, &inlier)| !inlier)
        .map(|(obs, _)| {
            (
                problem.keyframes[obs.kf_slot].id,
                problem.landmarks[obs.lm_slot].id,
                obs.keypoint_idx,
            )
        })
        .collect();

    Some(BaResult {
        keyframes: problem
            .keyframes
            .iter()
            .enumerate()
            .filter(|(_, kf)| !kf.fixed)
            .map(|(slot, kf)| (kf.id, state.poses[slot].clone()))
            .collect(),
        landmarks: problem
            .landmarks
            .iter()
            .enumerate()
            .map(|(slot, lm)| (lm.id, state.points[slot]))
            .collect(),
        outliers,
        iterations: completed_iterations,
        initial_error,
        final_error,
        aborted,
    })
}

/// PHASE 3: write results back. Returns the number of updated entities.
pub fn apply_ba_results(map: &mut MapDatabase, result: &BaResult) -> usize {
    let mut updated = 0;
    for (kf_id, pose) in &result.keyframes {
        if let Some(kf) = map.keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.set_pose_cw(pose.clone());
                updated += 1;
            }
        }
    }
    for (lm_id, position) in &result.landmarks {
        if let Some(lm) = map.landmark_mut(*lm_id) {
            if !lm.is_bad {
                lm.position = *position;
                updated += 1;
            }
        }
    }
    for (kf_id, lm_id, keypoint_idx) in &result.outliers {
        if map
            .keyframe(*kf_id)
            .map(|kf| kf.landmark_at(*keypoint_idx) == Some(*lm_id))
            .unwrap_or(false)
        {
            map.disassociate(*kf_id, *keypoint_idx);
            map.update_landmark_geometry(*lm_id);
        }
    }
    debug!(
        keyframes = result.keyframes.len(),
        landmarks = result.landmarks.len(),
        outliers = result.outliers.len(),
        "applied bundle adjustment"
    );
    updated
}

// ─────────────────────────────────────────────────────────────────────────
// Solver internals
// ─────────────────────────────────────────────────────────────────────────

enum StepOutcome {
    Accepted(f64),
    Converged,
    Diverged,
}

struct State {
    poses: Vec<SE3>,
    points: Vec<Vector3<f64>>,
    /// Parameter offset per keyframe slot (None = fixed).
    pose_param: Vec<Option<usize>>,
    num_pose_params: usize,
}

impl State {
    fn from_problem(problem: &BaProblem) -> Self {
        let mut pose_param = Vec::with_capacity(problem.keyframes.len());
        let mut offset = 0;
        for kf in &problem.keyframes {
            if kf.fixed {
                pose_param.push(None);
            } else {
                pose_param.push(Some(offset));
                offset += 6;
            }
        }
        Self {
            poses: problem.keyframes.iter().map(|kf| kf.pose_cw.clone()).collect(),
            points: problem.landmarks.iter().map(|lm| lm.position).collect(),
            pose_param,
            num_pose_params: offset,
        }
    }

    fn num_params(&self) -> usize {
        self.num_pose_params + self.points.len() * 3
    }

    fn residual(
        &self,
        problem: &BaProblem,
        obs: &BaObservation,
    ) -> Option<(Vec<f64>, Vector3<f64>)> {
        let p_cam = self.poses[obs.kf_slot].transform_point(&self.points[obs.lm_slot]);
        if p_cam.z <= 1e-6 {
            return None;
        }
        let f = problem.camera.focal;
        let mut e = vec![
            f * (p_cam.x / p_cam.z - obs.meas_x),
            f * (p_cam.y / p_cam.z - obs.meas_y),
        ];
        if let Some(disparity) = obs.disparity {
            e.push(problem.camera.focal_x_baseline / p_cam.z - disparity);
        }
        Some((e, p_cam))
    }

    fn chi_sq(&self, problem: &BaProblem, obs: &BaObservation) -> f64 {
        match self.residual(problem, obs) {
            Some((e, _)) => e.iter().map(|v| v * v).sum::<f64>() * obs.inv_sigma_sq,
            None => f64::INFINITY,
        }
    }

    fn robust_cost(&self, problem: &BaProblem, inliers: &[bool]) -> Option<f64> {
        let mut cost = 0.0;
        for (obs, &inlier) in problem.observations.iter().zip(inliers.iter()) {
            if !inlier {
                continue;
            }
            let chi_sq = self.chi_sq(problem, obs);
            let delta_sq = if obs.disparity.is_some() {
                CHI_SQ_3D
            } else {
                CHI_SQ_2D
            };
            // Huber ρ.
            let rho = if chi_sq.is_finite() {
                if chi_sq <= delta_sq {
                    chi_sq
                } else {
                    2.0 * (delta_sq * chi_sq).sqrt() - delta_sq
                }
            } else {
                1e9
            };
            cost += rho;
        }
        cost.is_finite().then_some(cost)
    }

    fn step(
        &mut self,
        problem: &BaProblem,
        inliers: &[bool],
        lambda: &mut f64,
        current_cost: f64,
    ) -> StepOutcome {
        let n = self.num_params();
        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);

        for (obs, &inlier) in problem.observations.iter().zip(inliers.iter()) {
            if !inlier {
                continue;
            }
            let Some((e, p_cam)) = self.residual(problem, obs) else {
                continue;
            };
            let chi_sq = e.iter().map(|v| v * v).sum::<f64>() * obs.inv_sigma_sq;
            if !chi_sq.is_finite() {
                return StepOutcome::Diverged;
            }
            let delta_sq = if obs.disparity.is_some() {
                CHI_SQ_3D
            } else {
                CHI_SQ_2D
            };
            let weight = obs.inv_sigma_sq * huber_weight(chi_sq, delta_sq);

            let f = problem.camera.focal;
            let z_inv = 1.0 / p_cam.z;
            let z_inv_sq = z_inv * z_inv;
            let mut rows: Vec<Vector3<f64>> = vec![
                Vector3::new(f * z_inv, 0.0, -f * p_cam.x * z_inv_sq),
                Vector3::new(0.0, f * z_inv, -f * p_cam.y * z_inv_sq),
            ];
            if obs.disparity.is_some() {
                rows.push(Vector3::new(
                    0.0,
                    0.0,
                    -problem.camera.focal_x_baseline * z_inv_sq,
                ));
            }

            // dp_cam/dξ = [-[p_cam]× | I]; dp_cam/dp_w = R.
            let mut dpose = Matrix3x6::zeros();
            dpose.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p_cam)));
            dpose
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());
            let rotation = self.poses[obs.kf_slot].rotation_matrix();

            let pose_offset = self.pose_param[obs.kf_slot];
            let point_offset = self.num_pose_params + obs.lm_slot * 3;

            for (r, row) in rows.iter().enumerate() {
                let j_pose: Option<Vector6<f64>> =
                    pose_offset.map(|_| (row.transpose() * &dpose).transpose());
                let j_point: Vector3<f64> = (row.transpose() * &rotation).transpose();
                let residual = e[r];

                // Accumulate the normal equations for this residual row.
                if let (Some(po), Some(jp)) = (pose_offset, j_pose.as_ref()) {
                    for a in 0..6 {
                        b[po + a] += weight * jp[a] * residual;
                        for c in 0..6 {
                            h[(po + a, po + c)] += weight * jp[a] * jp[c];
                        }
                        for c in 0..3 {
                            let v = weight * jp[a] * j_point[c];
                            h[(po + a, point_offset + c)] += v;
                            h[(point_offset + c, po + a)] += v;
                        }
                    }
                }
                for a in 0..3 {
                    b[point_offset + a] += weight * j_point[a] * residual;
                    for c in 0..3 {
                        h[(point_offset + a, point_offset + c)] +=
                            weight * j_point[a] * j_point[c];
                    }
                }
            }
        }

        // Try increasingly damped solves.
        for _ in 0..5 {
            let mut damped = h.clone();
            for i in 0..n {
                damped[(i, i)] += *lambda * damped[(i, i)].max(1e-9);
            }
            let Some(delta) = damped.lu().solve(&(-&b)) else {
                *lambda *= 10.0;
                continue;
            };
            if delta.norm() < 1e-10 {
                return StepOutcome::Converged;
            }

            let candidate = self.apply_delta(&delta);
            match candidate.robust_cost_with(self, problem, inliers) {
                Some(cost) if cost <= current_cost => {
                    self.poses = candidate.0;
                    self.points = candidate.1;
                    *lambda = (*lambda * 0.5).max(1e-10);
                    return StepOutcome::Accepted(cost);
                }
                Some(_) => *lambda *= 10.0,
                None => return StepOutcome::Diverged,
            }
        }
        StepOutcome::Converged
    }

    fn apply_delta(&self, delta: &DVector<f64>) -> (Vec<SE3>, Vec<Vector3<f64>>) {
        let mut poses = self.poses.clone();
        for (slot, offset) in self.pose_param.iter().enumerate() {
            if let Some(offset) = offset {
                let d = Vector6::new(
                    delta[*offset],
                    delta[offset + 1],
                    delta[offset + 2],
                    delta[offset + 3],
                    delta[offset + 4],
                    delta[offset + 5],
                );
                poses[slot] = poses[slot].retract(&d);
            }
        }
        let mut points = self.points.clone();
        for (slot, p) in points.iter_mut().enumerate() {
            let offset = self.num_pose_params + slot * 3;
            *p += Vector3::new(delta[offset], delta[offset + 1], delta[offset + 2]);
        }
        (poses, points)
    }

    fn classify(&self, problem: &BaProblem, inliers: &mut [bool]) {
        for (obs, inlier) in problem.observations.iter().zip(inliers.iter_mut()) {
            let threshold = if obs.disparity.is_some() {
                CHI_SQ_3D
            } else {
                CHI_SQ_2D
            };
            *inlier = self.chi_sq(problem, obs) <= threshold;
        }
    }
}

/// Cost of a candidate (poses, points) pair reusing the owning state's
/// layout.
trait CandidateCost {
    fn robust_cost_with(
        &self,
        state: &State,
        problem: &BaProblem,
        inliers: &[bool],
    ) -> Option<f64>;
}

impl CandidateCost for (Vec<SE3>, Vec<Vector3<f64>>) {
    fn robust_cost_with(
        &self,
        state: &State,
        problem: &BaProblem,
        inliers: &[bool],
    ) -> Option<f64> {
        let candidate = State {
            poses: self.0.clone(),
            points: self.1.clone(),
            pose_param: state.pose_param.clone(),
            num_pose_params: state.num_pose_params,
        };
        candidate.robust_cost(problem, inliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// Two-keyframe problem with perturbed second pose and perturbed points.
    fn synthetic_problem() -> (BaProblem, SE3, Vec<Vector3<f64>>) {
        let pose_1 = SE3::identity();
        let pose_2_true = SE3::new(
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(Vector3::y()), 0.02),
            Vector3::new(-0.4, 0.0, 0.05),
        );
        let points_true: Vec<Vector3<f64>> = (0..25)
            .map(|i| {
                Vector3::new(
                    -1.0 + 0.08 * i as f64,
                    ((i * 3) % 5) as f64 * 0.2 - 0.4,
                    4.0 + (i % 3) as f64 * 0.5,
                )
            })
            .collect();

        let camera = CameraConstants {
            focal: 500.0,
            focal_x_baseline: 50.0,
        };

        let mut observations = Vec::new();
        for (lm_slot, p) in points_true.iter().enumerate() {
            for (kf_slot, pose) in [&pose_1, &pose_2_true].iter().enumerate() {
                let p_cam = pose.transform_point(p);
                observations.push(BaObservation {
                    kf_slot,
                    lm_slot,
                    keypoint_idx: lm_slot,
                    meas_x: p_cam.x / p_cam.z,
                    meas_y: p_cam.y / p_cam.z,
                    disparity: Some(camera.focal_x_baseline / p_cam.z),
                    inv_sigma_sq: 1.0,
                });
            }
        }

        // Perturb the variable pose and the points.
        let pose_2_init = SE3::new(
            pose_2_true.rotation
                * UnitQuaternion::from_axis_angle(
                    &nalgebra::Unit::new_normalize(Vector3::x()),
                    0.01,
                ),
            pose_2_true.translation + Vector3::new(0.03, -0.02, 0.01),
        );
        let points_init: Vec<Vector3<f64>> = points_true
            .iter()
            .map(|p| p + Vector3::new(0.01, -0.01, 0.02))
            .collect();

        let problem = BaProblem {
            keyframes: vec![
                BaKeyframe {
                    id: KeyframeId(0),
                    pose_cw: pose_1,
                    fixed: true,
                },
                BaKeyframe {
                    id: KeyframeId(1),
                    pose_cw: pose_2_init,
                    fixed: false,
                },
            ],
            landmarks: points_init
                .iter()
                .enumerate()
                .map(|(i, p)| BaLandmark {
                    id: LandmarkId(i as u64),
                    position: *p,
                })
                .collect(),
            observations,
            camera,
        };
        (problem, pose_2_true, points_true)
    }

    #[test]
    fn test_ba_reduces_error_and_recovers_geometry() {
        let (problem, pose_2_true, points_true) = synthetic_problem();
        let result = solve_ba(&problem, &|| false).unwrap();
        assert!(result.final_error < result.initial_error * 0.01);

        let (_, optimized_pose) = &result.keyframes[0];
        assert_relative_eq!(
            optimized_pose.to_matrix(),
            pose_2_true.to_matrix(),
            epsilon = 1e-4
        );
        for ((_, p_opt), p_true) in result.landmarks.iter().zip(points_true.iter()) {
            assert!((p_opt - p_true).norm() < 1e-3);
        }
        assert!(result.outliers.is_empty());
    }

    #[test]
    fn test_ba_abort_before_first_iteration() {
        let (problem, _, _) = synthetic_problem();
        // Abort immediately: no result, so nothing will be written back.
        assert!(solve_ba(&problem, &|| true).is_none());
    }

    #[test]
    fn test_ba_abort_mid_run_keeps_completed_iterate() {
        let (problem, _, _) = synthetic_problem();
        let calls = std::cell::Cell::new(0usize);
        let result = solve_ba(&problem, &|| {
            calls.set(calls.get() + 1);
            calls.get() > 3
        });
        if let Some(result) = result {
            assert!(result.aborted);
            assert!(result.iterations >= 1);
        }
    }
}
