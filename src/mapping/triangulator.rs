//! New-landmark triangulation between covisible keyframes.
//!
//! For the freshly inserted keyframe and each of its best covisibility
//! neighbors with a sufficient baseline, unmatched keypoint pairs passing
//! the epipolar constraint are triangulated; points with positive depth in
//! both cameras, low reprojection error, enough parallax and consistent
//! scale become landmarks.

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::config::MappingConfig;
use crate::geometry::epipolar::{essential_from_rt, sampson_error_sq};
use crate::geometry::{triangulation, SE3};
use crate::map::{Keyframe, KeyframeId, Landmark, MapDatabase};
use crate::matcher::{HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST};

/// Neighbors considered for triangulation.
const NUM_TRIANGULATION_NEIGHBORS: usize = 10;
/// Minimum parallax: cos 1.0° ≈ 0.99985.
const MAX_PARALLAX_COS: f64 = 0.99985;
/// Reprojection gate (χ², 2 DoF, 95%).
const REPROJ_CHI_SQ: f64 = 5.99;
/// Slack on the scale-consistency ratio between the two observations.
const SCALE_CONSISTENCY_FACTOR: f64 = 1.5;

/// Triangulate new landmarks for `current`. Returns the number created.
pub fn create_new_landmarks(
    map: &mut MapDatabase,
    current: KeyframeId,
    config: &MappingConfig,
) -> usize {
    let neighbors = match map.keyframe_mut(current) {
        Some(kf) => kf.top_covisibilities(NUM_TRIANGULATION_NEIGHBORS),
        None => return 0,
    };

    let mut num_created = 0;
    for neighbor in neighbors {
        // Baseline test against the neighbor's scene depth.
        let (baseline_ok, median_depth) = {
            let (Some(cur), Some(other)) = (map.keyframe(current), map.keyframe(neighbor)) else {
                continue;
            };
            let baseline = (cur.camera_center() - other.camera_center()).norm();
            let median_depth = map.median_depth(neighbor).unwrap_or(f64::INFINITY);
            let threshold = if config.use_baseline_dist_thr_ratio {
                config.baseline_dist_thr_ratio * median_depth
            } else {
                config.baseline_dist_thr
            };
            (baseline > threshold, median_depth)
        };
        if !baseline_ok {
            debug!(%current, %neighbor, median_depth, "baseline too short, skipping pair");
            continue;
        }

        num_created += triangulate_pair(map, current, neighbor);
    }
    if num_created > 0 {
        map.update_connections(current);
        debug!(%current, num_created, "triangulated new landmarks");
    }
    num_created
}

fn triangulate_pair(map: &mut MapDatabase, id_1: KeyframeId, id_2: KeyframeId) -> usize {
    let matches = {
        let (Some(kf_1), Some(kf_2)) = (map.keyframe(id_1), map.keyframe(id_2)) else {
            return 0;
        };
        match_unassociated(kf_1, kf_2)
    };
    if matches.is_empty() {
        return 0;
    }

    let mut created = 0;
    for (idx_1, idx_2) in matches {
        let new_landmark = {
            let (Some(kf_1), Some(kf_2)) = (map.keyframe(id_1), map.keyframe(id_2)) else {
                return created;
            };
            // Slots may have been taken by an earlier pair this round.
            if kf_1.landmark_at(idx_1).is_some() || kf_2.landmark_at(idx_2).is_some() {
                continue;
            }
            triangulate_checked(kf_1, idx_1, kf_2, idx_2)
        };
        let Some(position) = new_landmark else {
            continue;
        };

        let lm_id = map.next_landmark_id();
        let descriptor = map
            .keyframe(id_1)
            .map(|kf| kf.descriptors[idx_1])
            .unwrap_or_default();
        let mut landmark = Landmark::new(lm_id, position, descriptor, id_1);
        landmark.first_keyframe = id_1;
        map.add_landmark(landmark);
        map.associate(id_1, idx_1, lm_id);
        map.associate(id_2, idx_2, lm_id);
        map.update_landmark_geometry(lm_id);
        created += 1;
    }
    if created > 0 {
        map.update_connections(id_2);
    }
    created
}

/// Node-lockstep matching restricted to keypoints without landmarks, gated
/// by the epipolar constraint of the known relative pose.
fn match_unassociated(kf_1: &Keyframe, kf_2: &Keyframe) -> Vec<(usize, usize)> {
    let (Some(fv_1), Some(fv_2)) = (kf_1.feature_vec.as_ref(), kf_2.feature_vec.as_ref()) else {
        return Vec::new();
    };

    // Essential matrix of the pair: p₂ = R₂₁ p₁ + t₂₁.
    let rel: SE3 = kf_2.pose_cw().compose(kf_1.pose_wc());
    let essential: Matrix3<f64> = essential_from_rt(&rel.rotation, &rel.translation.normalize());
    let focal = kf_1.camera.focal_length_x().max(1.0);
    let sigma_sq = 1.0 / (focal * focal);

    let mut matches = Vec::new();
    let mut used_2 = vec![false; kf_2.num_keypoints()];

    let mut iter_2 = fv_2.iter().peekable();
    for (node, indices_1) in fv_1.iter() {
        let indices_2 = loop {
            match iter_2.peek() {
                Some((node_2, indices)) if *node_2 == node => break Some(*indices),
                Some((node_2, _)) if *node_2 < node => {
                    iter_2.next();
                }
                _ => break None,
            }
        };
        let Some(indices_2) = indices_2 else {
            continue;
        };

        for &idx_1 in indices_1 {
            if kf_1.landmark_at(idx_1).is_some() {
                continue;
            }
            let desc_1 = &kf_1.descriptors[idx_1];
            let mut best = MAX_HAMMING_DIST;
            let mut best_idx = None;
            for &idx_2 in indices_2 {
                if used_2[idx_2] || kf_2.landmark_at(idx_2).is_some() {
                    continue;
                }
                let dist = desc_1.distance(&kf_2.descriptors[idx_2]);
                if dist < best {
                    best = dist;
                    best_idx = Some(idx_2);
                }
            }
            let Some(idx_2) = best_idx else {
                continue;
            };
            if best > HAMMING_DIST_THR_LOW {
                continue;
            }
            // Epipolar consistency, scaled by the observed pyramid level.
            let err = sampson_error_sq(&essential, &kf_1.bearings[idx_1], &kf_2.bearings[idx_2]);
            let level_sigma = kf_2
                .orb_params
                .level_sigma_sq_at(kf_2.keypoints[idx_2].octave as usize);
            if err > 3.84 * sigma_sq * level_sigma {
                continue;
            }
            used_2[idx_2] = true;
            matches.push((idx_1, idx_2));
        }
    }
    matches
}

/// Triangulate one pair and run the acceptance checks.
fn triangulate_checked(
    kf_1: &Keyframe,
    idx_1: usize,
    kf_2: &Keyframe,
    idx_2: usize,
) -> Option<Vector3<f64>> {
    let b1 = &kf_1.bearings[idx_1];
    let b2 = &kf_2.bearings[idx_2];

    let point = triangulation::triangulate(b1, kf_1.pose_cw(), b2, kf_2.pose_cw())?;
    if !point.iter().all(|v| v.is_finite()) {
        return None;
    }

    // Positive depth in both views.
    let z1 = triangulation::depth_in_camera(&point, kf_1.pose_cw());
    let z2 = triangulation::depth_in_camera(&point, kf_2.pose_cw());
    if z1 <= 0.0 || z2 <= 0.0 {
        return None;
    }

    // Parallax.
    let c1 = kf_1.camera_center();
    let c2 = kf_2.camera_center();
    if triangulation::parallax_cosine(&point, &c1, &c2) > MAX_PARALLAX_COS {
        return None;
    }

    // Reprojection in both normalized planes, in pixel units.
    let focal = kf_1.camera.focal_length_x().max(1.0);
    for (kf, idx, z) in [(kf_1, idx_1, z1), (kf_2, idx_2, z2)] {
        let p_cam = kf.pose_cw().transform_point(&point);
        let bearing = &kf.bearings[idx];
        let dx = focal * (p_cam.x / z - bearing.x / bearing.z);
        let dy = focal * (p_cam.y / z - bearing.y / bearing.z);
        let sigma_sq = kf
            .orb_params
            .level_sigma_sq_at(kf.keypoints[idx].octave as usize);
        if (dx * dx + dy * dy) / sigma_sq > REPROJ_CHI_SQ {
            return None;
        }
    }

    // Scale consistency: distance ratio must agree with the octave ratio.
    let dist_1 = (point - c1).norm();
    let dist_2 = (point - c2).norm();
    if dist_1 <= 0.0 || dist_2 <= 0.0 {
        return None;
    }
    let scale_1 = kf_1.orb_params.scale_factor_at(kf_1.keypoints[idx_1].octave as usize);
    let scale_2 = kf_2.orb_params.scale_factor_at(kf_2.keypoints[idx_2].octave as usize);
    let ratio_dist = dist_2 / dist_1;
    let ratio_octave = scale_1 / scale_2;
    if ratio_dist > ratio_octave * SCALE_CONSISTENCY_FACTOR
        || ratio_dist < ratio_octave / SCALE_CONSISTENCY_FACTOR
    {
        return None;
    }

    Some(point)
}
