//! Relocalization after track loss.
//!
//! Candidates come from the BoW index (no exclusion set). Each candidate is
//! matched BoW-guided; with enough matches the candidate's pose seeds a
//! pose-only optimization, the candidate neighborhood's landmarks are
//! projection-matched in, and the pose is refined again. The first candidate
//! reaching the valid-observation floor wins; the list is simply exhausted
//! otherwise.

use tracing::debug;

use crate::config::TrackingConfig;
use crate::map::{BowDatabase, Frame, MapDatabase};
use crate::matcher::{bow_match, projection};
use crate::optimize::optimize_pose;

use super::tracker::{apply_pose_result, build_pose_problem};

/// Projection-match margin during relocalization refinement.
const RELOC_PROJ_MARGIN: f64 = 10.0;

/// Try to relocalize the frame. On success its pose and landmark
/// associations are filled in and `true` is returned.
pub fn relocalize(
    frame: &mut Frame,
    map: &mut MapDatabase,
    bow_db: &BowDatabase,
    config: &TrackingConfig,
) -> bool {
    let Some(bow) = frame.bow.clone() else {
        return false;
    };
    let candidates = bow_db.acquire_relocalization_candidates(&bow, map);
    if candidates.is_empty() {
        return false;
    }
    debug!(frame = frame.id, candidates = candidates.len(), "relocalization candidates");

    for candidate_id in candidates {
        let Some(candidate) = map.keyframe(candidate_id) else {
            continue;
        };
        if candidate.is_bad {
            continue;
        }
        let candidate = candidate.clone();

        // Fresh associations per attempt.
        frame.landmarks.iter_mut().for_each(|slot| *slot = None);
        frame.outliers.iter_mut().for_each(|flag| *flag = false);

        let num_bow_matches = bow_match::match_frame_against_keyframe(
            frame,
            &candidate,
            map,
            config.reloc_bow_match_lowe_ratio,
        );
        if num_bow_matches < config.reloc_min_num_bow_matches {
            continue;
        }

        // Seed from the candidate's pose and refine.
        frame.set_pose(candidate.pose_cw().clone());
        let (problem, keypoint_indices) = build_pose_problem(frame, map);
        let result = optimize_pose(&problem);
        if result.diverged || result.num_inliers < config.min_num_inliers {
            continue;
        }
        apply_pose_result(frame, &result, &keypoint_indices);

        // Widen with the candidate neighborhood's landmarks.
        let mut neighborhood = candidate.top_covisibilities_readonly(10);
        neighborhood.push(candidate_id);
        let mut local_landmarks = std::collections::HashSet::new();
        for kf_id in neighborhood {
            if let Some(kf) = map.keyframe(kf_id) {
                for (_, lm_id) in kf.landmark_associations() {
                    local_landmarks.insert(lm_id);
                }
            }
        }
        let mut local_landmarks: Vec<_> = local_landmarks.into_iter().collect();
        local_landmarks.sort();
        projection::match_frame_and_local_landmarks(
            frame,
            map,
            &local_landmarks,
            RELOC_PROJ_MARGIN,
            config.reloc_proj_match_lowe_ratio,
        );

        let (problem, keypoint_indices) = build_pose_problem(frame, map);
        let result = optimize_pose(&problem);
        if result.diverged {
            continue;
        }
        apply_pose_result(frame, &result, &keypoint_indices);

        if result.num_inliers >= config.reloc_min_num_valid_obs {
            debug!(
                frame = frame.id,
                candidate = %candidate_id,
                inliers = result.num_inliers,
                "relocalization succeeded"
            );
            frame.ref_keyframe = Some(candidate_id);
            return true;
        }
    }
    false
}
