//! Loop verification and correction.
//!
//! Verification matches the current and candidate keyframes BoW-guided,
//! pairs up their landmarks as 3D-3D correspondences in the two camera
//! frames, and solves a Sim(3) by RANSAC + refinement. Correction pauses
//! mapping, propagates the corrected Sim(3) through the current covisibility
//! neighborhood (poses and landmarks), fuses duplicated landmarks across the
//! two sides, adds the loop edge, and runs pose-graph optimization. Global
//! BA runs afterwards in a helper task owned by the stage loop.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::geometry::{SE3, Sim3};
use crate::map::{KeyframeId, LandmarkId, MapDatabase};
use crate::matcher::{bow_match, fuse};
use crate::optimize::{
    apply_pose_graph_results, collect_pose_graph, optimize_sim3, solve_pose_graph, BaResult,
    Sim3RefineProblem,
};
use crate::system::SharedContext;

use super::sim3_solver::{estimate_sim3_ransac, Sim3SolverConfig};

/// BoW matching ratio during loop verification.
const LOOP_BOW_RATIO: f64 = 0.75;
/// Inliers required to accept a loop.
const MIN_LOOP_INLIERS: usize = 20;
/// Fusion margin when merging the two loop sides.
const LOOP_FUSE_MARGIN: f64 = 4.0;
/// Pose-graph iteration budget.
const POSE_GRAPH_ITERATIONS: usize = 20;

/// A geometrically verified loop.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current: KeyframeId,
    pub loop_kf: KeyframeId,
    /// Maps current-camera coordinates into loop-camera coordinates.
    pub sim3_loop_from_current: Sim3,
    /// Inlier landmark pairs `(current side, loop side)`.
    pub matched_landmarks: Vec<(LandmarkId, LandmarkId)>,
}

/// Geometric verification of a loop candidate.
pub fn verify_candidate(
    current_id: KeyframeId,
    candidate_id: KeyframeId,
    map: &MapDatabase,
    fix_scale: bool,
) -> Option<VerifiedLoop> {
    let current = map.keyframe(current_id)?;
    let candidate = map.keyframe(candidate_id)?;
    if current.is_bad || candidate.is_bad {
        return None;
    }

    let keypoint_matches = bow_match::match_keyframes(current, candidate, LOOP_BOW_RATIO);
    if keypoint_matches.len() < MIN_LOOP_INLIERS {
        debug!(
            %current_id, %candidate_id,
            matches = keypoint_matches.len(),
            "loop rejected: too few BoW matches"
        );
        return None;
    }

    // 3D-3D correspondences in the two camera frames.
    let mut points_current = Vec::new();
    let mut points_loop = Vec::new();
    let mut landmark_pairs = Vec::new();
    for (cur_idx, loop_idx) in keypoint_matches {
        let (Some(lm_cur), Some(lm_loop)) = (
            current
                .landmark_at(cur_idx)
                .and_then(|id| map.resolve_landmark(id)),
            candidate
                .landmark_at(loop_idx)
                .and_then(|id| map.resolve_landmark(id)),
        ) else {
            continue;
        };
        let (Some(cur), Some(lp)) = (map.landmark(lm_cur), map.landmark(lm_loop)) else {
            continue;
        };
        if cur.is_bad || lp.is_bad {
            continue;
        }
        points_current.push(current.pose_cw().transform_point(&cur.position));
        points_loop.push(candidate.pose_cw().transform_point(&lp.position));
        landmark_pairs.push((lm_cur, lm_loop));
    }
    if points_current.len() < MIN_LOOP_INLIERS {
        return None;
    }

    let config = Sim3SolverConfig {
        fix_scale,
        min_inliers: MIN_LOOP_INLIERS,
        ..Default::default()
    };
    let estimate = estimate_sim3_ransac(&points_current, &points_loop, &config, current_id.0)?;

    // Refine over all pairs and reclassify.
    let refined = optimize_sim3(&Sim3RefineProblem {
        initial: estimate.sim3,
        pairs: points_current
            .iter()
            .zip(points_loop.iter())
            .map(|(a, b)| (*a, *b))
            .collect(),
        inlier_threshold: config.inlier_threshold,
        fix_scale,
    });
    if refined.num_inliers < MIN_LOOP_INLIERS {
        debug!(%current_id, %candidate_id, inliers = refined.num_inliers, "loop rejected after refinement");
        return None;
    }

    let matched_landmarks = landmark_pairs
        .into_iter()
        .zip(refined.inliers.iter())
        .filter(|(_, &inlier)| inlier)
        .map(|(pair, _)| pair)
        .collect();

    info!(%current_id, %candidate_id, inliers = refined.num_inliers, "loop verified");
    Some(VerifiedLoop {
        current: current_id,
        loop_kf: candidate_id,
        sim3_loop_from_current: refined.sim3,
        matched_landmarks,
    })
}

/// Apply the loop: Sim(3) propagation, fusion, loop edge, pose graph.
/// Mapping is paused for the duration. Returns false when the correction had
/// to be abandoned (e.g. shutdown).
pub fn correct_loop(verified: &VerifiedLoop, shared: &SharedContext, fix_scale: bool) -> bool {
    // Pause mapping and wait until it acknowledges.
    let paused = shared.mapping_lifecycle.async_pause();
    if paused.recv_timeout(Duration::from_secs(2)).is_err() {
        warn!("mapping did not pause in time, skipping loop correction");
        shared.mapping_lifecycle.resume();
        return false;
    }

    let problem = {
        let mut map = shared.map.write();

        // Corrected Sim(3) of the current keyframe:
        // S_corrected = S_loop_from_current⁻¹ ∘ S_loop.
        let Some(loop_pose) = map.keyframe(verified.loop_kf).map(|kf| kf.pose_cw().clone())
        else {
            shared.mapping_lifecycle.resume();
            return false;
        };
        let Some(current_pose) = map.keyframe(verified.current).map(|kf| kf.pose_cw().clone())
        else {
            shared.mapping_lifecycle.resume();
            return false;
        };
        let corrected_current = verified
            .sim3_loop_from_current
            .inverse()
            .compose(&Sim3::from_se3(&loop_pose));

        // Propagate the correction over the current covisibility
        // neighborhood: relative poses to the current keyframe stay fixed.
        let neighborhood: Vec<KeyframeId> = {
            let mut ids = vec![verified.current];
            if let Some(kf) = map.keyframe(verified.current) {
                ids.extend(kf.top_covisibilities_readonly(usize::MAX));
            }
            ids
        };
        let current_sim3_old = Sim3::from_se3(&current_pose);
        let mut corrected: HashMap<KeyframeId, Sim3> = HashMap::new();
        let mut old_poses: HashMap<KeyframeId, Sim3> = HashMap::new();
        for &kf_id in &neighborhood {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            let old = Sim3::from_se3(kf.pose_cw());
            let relative = old.compose(&current_sim3_old.inverse());
            corrected.insert(kf_id, relative.compose(&corrected_current));
            old_poses.insert(kf_id, old);
        }

        // Pose-graph problem uses pre-correction measurements with corrected
        // initial vertices; collect before touching the map.
        let problem = collect_pose_graph(
            &map,
            verified.loop_kf,
            verified.current,
            &corrected,
            fix_scale,
        );

        // Move the neighborhood's landmarks with their keyframes, once each.
        let mut moved: HashSet<LandmarkId> = HashSet::new();
        for &kf_id in &neighborhood {
            let (Some(old), Some(new)) = (old_poses.get(&kf_id), corrected.get(&kf_id)) else {
                continue;
            };
            let landmark_ids: Vec<LandmarkId> = map
                .keyframe(kf_id)
                .map(|kf| kf.landmark_associations().map(|(_, lm)| lm).collect())
                .unwrap_or_default();
            for lm_id in landmark_ids {
                if !moved.insert(lm_id) {
                    continue;
                }
                if let Some(lm) = map.landmark_mut(lm_id) {
                    let p: Vector3<f64> = lm.position;
                    lm.position = new.inverse().transform_point(&old.transform_point(&p));
                }
            }
        }
        for (&kf_id, sim3) in &corrected {
            if let Some(kf) = map.keyframe_mut(kf_id) {
                kf.set_pose_cw(sim3.to_se3());
            }
        }

        // Merge the duplicated structure: matched pairs first (keep the loop
        // side, the older geometry), then a projection fuse of the loop
        // neighborhood into the corrected one.
        for &(lm_current, lm_loop) in &verified.matched_landmarks {
            let (Some(a), Some(b)) = (map.resolve_landmark(lm_current), map.resolve_landmark(lm_loop))
            else {
                continue;
            };
            if a != b {
                map.replace_landmark(a, b);
            }
        }
        let loop_side_landmarks: Vec<LandmarkId> = {
            let mut set: HashSet<LandmarkId> = HashSet::new();
            let mut loop_neighborhood = vec![verified.loop_kf];
            if let Some(kf) = map.keyframe(verified.loop_kf) {
                loop_neighborhood.extend(kf.top_covisibilities_readonly(10));
            }
            for kf_id in loop_neighborhood {
                if let Some(kf) = map.keyframe(kf_id) {
                    set.extend(kf.landmark_associations().map(|(_, lm)| lm));
                }
            }
            let mut v: Vec<LandmarkId> = set.into_iter().collect();
            v.sort();
            v
        };
        for &kf_id in &neighborhood {
            fuse::replace_or_add(kf_id, &loop_side_landmarks, &mut map, LOOP_FUSE_MARGIN);
        }

        // New covisibility edges across the loop, then the loop edge itself.
        for &kf_id in &neighborhood {
            map.update_connections(kf_id);
        }
        map.update_connections(verified.loop_kf);
        if let Some(kf) = map.keyframe_mut(verified.current) {
            kf.add_loop_edge(verified.loop_kf);
        }
        if let Some(kf) = map.keyframe_mut(verified.loop_kf) {
            kf.add_loop_edge(verified.current);
        }

        problem
    };

    // Pose graph, lock-free.
    let applied = if let Some(problem) = problem {
        let abort = || shared.global_lifecycle.is_terminated();
        match solve_pose_graph(&problem, POSE_GRAPH_ITERATIONS, &abort) {
            Some(result) => {
                let mut map = shared.map.write();
                apply_pose_graph_results(&mut map, &result);
                true
            }
            None => false,
        }
    } else {
        false
    };

    shared.mapping_lifecycle.resume();
    info!(
        current = %verified.current,
        loop_kf = %verified.loop_kf,
        pose_graph = applied,
        "loop correction finished"
    );
    true
}

/// Write back an asynchronous global BA, propagating corrections to
/// keyframes and landmarks created while it ran.
///
/// Keyframes absent from the result get `T_new = T_old ∘ T_parent_old⁻¹ ∘
/// T_parent_new` walking the spanning tree from the origin; landmarks absent
/// from the result follow their reference keyframe's correction.
pub fn apply_global_ba(map: &mut MapDatabase, result: &BaResult) {
    let optimized: HashMap<KeyframeId, SE3> = result.keyframes.iter().cloned().collect();
    let optimized_landmarks: HashMap<LandmarkId, Vector3<f64>> =
        result.landmarks.iter().cloned().collect();

    let Some(origin) = map.origin_keyframe() else {
        return;
    };

    // Old poses before any write.
    let old_poses: HashMap<KeyframeId, SE3> = map
        .keyframes()
        .map(|kf| (kf.id, kf.pose_cw().clone()))
        .collect();

    // Spanning-tree walk from the origin.
    let mut new_poses: HashMap<KeyframeId, SE3> = HashMap::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(origin);
    while let Some(kf_id) = queue.pop_front() {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        let new_pose = match optimized.get(&kf_id) {
            Some(pose) => pose.clone(),
            None => match kf.parent {
                Some(parent) => {
                    let (Some(parent_old), Some(parent_new)) =
                        (old_poses.get(&parent), new_poses.get(&parent))
                    else {
                        continue;
                    };
                    let old = &old_poses[&kf_id];
                    old.compose(&parent_old.inverse()).compose(parent_new)
                }
                None => old_poses[&kf_id].clone(),
            },
        };
        new_poses.insert(kf_id, new_pose);
        queue.extend(kf.children.iter().copied());
    }

    for (kf_id, pose) in &new_poses {
        if let Some(kf) = map.keyframe_mut(*kf_id) {
            kf.set_pose_cw(pose.clone());
        }
    }

    let landmark_ids = map.landmark_ids();
    for lm_id in landmark_ids {
        let correction = {
            let Some(lm) = map.landmark(lm_id) else {
                continue;
            };
            match optimized_landmarks.get(&lm_id) {
                Some(position) => Some(*position),
                None => {
                    let reference = lm.ref_keyframe;
                    match (old_poses.get(&reference), new_poses.get(&reference)) {
                        (Some(old), Some(new)) => Some(
                            new.inverse()
                                .transform_point(&old.transform_point(&lm.position)),
                        ),
                        _ => None,
                    }
                }
            }
        };
        if let Some(position) = correction {
            if let Some(lm) = map.landmark_mut(lm_id) {
                lm.position = position;
            }
        }
    }
    debug!(
        optimized_keyframes = optimized.len(),
        propagated = new_poses.len() - optimized.len(),
        "global BA applied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_apply_global_ba_propagates_to_new_keyframes() {
        let mut map = MapDatabase::new();
        let kf0 = insert_keyframe(&mut map, 20);
        let kf1 = insert_keyframe(&mut map, 20);
        let kf2 = insert_keyframe(&mut map, 20);
        for i in 0..16 {
            insert_landmark(
                &mut map,
                Vector3::new(0.1 * i as f64, 0.0, 3.0),
                &[(kf0, i), (kf1, i), (kf2, i)],
            );
        }
        map.set_spanning_tree_parent(kf1, kf0);
        map.set_spanning_tree_parent(kf2, kf1);

        // Give kf2 a distinctive pre-BA pose relative to kf1.
        let kf2_old = SE3::new(UnitQuaternion::identity(), Vector3::new(2.0, 0.0, 0.0));
        map.keyframe_mut(kf2).unwrap().set_pose_cw(kf2_old.clone());

        // The BA result only covers kf0 and kf1; kf2 "arrived later".
        let kf1_new = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 1.0, 0.0));
        let result = BaResult {
            keyframes: vec![(kf1, kf1_new.clone())],
            landmarks: vec![],
            outliers: vec![],
            iterations: 1,
            initial_error: 1.0,
            final_error: 0.5,
            aborted: false,
        };
        apply_global_ba(&mut map, &result);

        // kf2 moved by the same relative transform it had to kf1.
        let kf1_old = SE3::identity();
        let expected = kf2_old.compose(&kf1_old.inverse()).compose(&kf1_new);
        let actual = map.keyframe(kf2).unwrap().pose_cw().clone();
        assert!((actual.to_matrix() - expected.to_matrix()).norm() < 1e-12);
    }
}
