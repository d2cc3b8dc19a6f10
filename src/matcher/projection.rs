//! Projection-guided matching.
//!
//! With a predicted pose, each candidate landmark is projected into the
//! current frame and the descriptor search is limited to the grid cells
//! within `margin × scale_factor^octave` pixels, at octaves within ±1 of the
//! predicted level.

use nalgebra::Vector2;

use crate::map::{Frame, LandmarkId, MapDatabase};

use super::{passes_ratio_test, AngleChecker, HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST};

/// Maximum angle between a landmark's mean viewing direction and the current
/// viewing ray (cos 60°).
const MAX_VIEWING_COS: f64 = 0.5;

/// A landmark projected into the current frame with its search parameters.
struct Reprojection {
    lm_id: LandmarkId,
    u: f64,
    v: f64,
    predicted_octave: usize,
}

/// Match unobserved local-map landmarks into the frame.
///
/// The frame must carry a pose estimate. Successful matches are written into
/// `frame.landmarks`; landmark visibility counters are updated (`n_visible`
/// for every landmark that projects into the frame, `n_found` by the caller
/// after pose optimization confirms the match). Returns the match count.
pub fn match_frame_and_local_landmarks(
    frame: &mut Frame,
    map: &mut MapDatabase,
    local_landmarks: &[LandmarkId],
    margin: f64,
    lowe_ratio: f64,
) -> usize {
    let Some(pose_cw) = frame.pose_cw.clone() else {
        return 0;
    };
    let cam_center = pose_cw.camera_center();
    let bounds = frame.camera.image_bounds();

    // Project every candidate under the read view first.
    let mut reprojections = Vec::new();
    let mut observable = Vec::new();
    for &lm_id in local_landmarks {
        let Some(lm) = map.landmark(lm_id) else {
            continue;
        };
        if lm.is_bad {
            continue;
        }
        // Already associated in this frame.
        if frame.landmarks.iter().any(|l| *l == Some(lm_id)) {
            continue;
        }
        let p_cam = pose_cw.transform_point(&lm.position);
        let Some(px) = frame.camera.project(&p_cam) else {
            continue;
        };
        if !bounds.contains(px.x, px.y) {
            continue;
        }
        let ray = lm.position - cam_center;
        let dist = ray.norm();
        if !lm.is_inside_scale_range(dist) {
            continue;
        }
        if lm.mean_normal.norm() > 0.5 && ray.dot(&lm.mean_normal) / dist < MAX_VIEWING_COS {
            continue;
        }
        let predicted_octave = frame
            .orb_params
            .predict_scale_level(lm.max_valid_distance, dist);
        observable.push(lm_id);
        reprojections.push(Reprojection {
            lm_id,
            u: px.x,
            v: px.y,
            predicted_octave,
        });
    }

    for lm_id in observable {
        if let Some(lm) = map.landmark_mut(lm_id) {
            lm.increase_num_observable(1);
        }
    }

    let mut num_matched = 0;
    for rp in reprojections {
        let radius =
            margin * frame.orb_params.scale_factor_at(rp.predicted_octave);
        let min_octave = rp.predicted_octave.saturating_sub(1) as u32;
        let max_octave = (rp.predicted_octave + 1).min(frame.orb_params.num_levels as usize - 1) as u32;
        let candidates =
            frame.features_in_area(rp.u, rp.v, radius, Some(min_octave), Some(max_octave));

        let descriptor = match map.landmark(rp.lm_id) {
            Some(lm) => lm.descriptor,
            None => continue,
        };

        let mut best = MAX_HAMMING_DIST;
        let mut second = MAX_HAMMING_DIST;
        let mut best_idx = None;
        for idx in candidates {
            if frame.landmarks[idx].is_some() {
                continue;
            }
            let dist = descriptor.distance(&frame.descriptors[idx]);
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(idx);
            } else if dist < second {
                second = dist;
            }
        }

        if let Some(idx) = best_idx {
            if best <= HAMMING_DIST_THR_LOW && passes_ratio_test(best, second, lowe_ratio) {
                frame.landmarks[idx] = Some(rp.lm_id);
                num_matched += 1;
            }
        }
    }
    num_matched
}

/// Motion-model matching: carry the last frame's landmark associations into
/// the current frame by projecting them through the current pose prior.
///
/// Returns the match count; on a weak result callers retry with a doubled
/// margin.
pub fn match_current_and_last_frame(
    current: &mut Frame,
    last: &Frame,
    map: &MapDatabase,
    margin: f64,
    lowe_ratio: f64,
) -> usize {
    let Some(pose_cw) = current.pose_cw.clone() else {
        return 0;
    };
    let bounds = current.camera.image_bounds();

    let mut checker = AngleChecker::new();
    let mut assigned: Vec<(usize, LandmarkId)> = Vec::new();

    for (last_idx, lm_slot) in last.landmarks.iter().enumerate() {
        let Some(raw_id) = *lm_slot else {
            continue;
        };
        if last.outliers[last_idx] {
            continue;
        }
        let Some(lm_id) = map.resolve_landmark(raw_id) else {
            continue;
        };
        let Some(lm) = map.landmark(lm_id) else {
            continue;
        };
        if lm.is_bad {
            continue;
        }

        let p_cam = pose_cw.transform_point(&lm.position);
        let Some(px) = current.camera.project(&p_cam) else {
            continue;
        };
        if !bounds.contains(px.x, px.y) {
            continue;
        }

        let last_octave = last.keypoints[last_idx].octave as usize;
        let radius = margin * current.orb_params.scale_factor_at(last_octave);
        let min_octave = last_octave.saturating_sub(1) as u32;
        let max_octave =
            (last_octave + 1).min(current.orb_params.num_levels as usize - 1) as u32;
        let candidates = current.features_in_area(
            px.x,
            px.y,
            radius,
            Some(min_octave),
            Some(max_octave),
        );

        let descriptor = lm.descriptor;
        let mut best = MAX_HAMMING_DIST;
        let mut second = MAX_HAMMING_DIST;
        let mut best_idx = None;
        for idx in candidates {
            if current.landmarks[idx].is_some() {
                continue;
            }
            let dist = descriptor.distance(&current.descriptors[idx]);
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(idx);
            } else if dist < second {
                second = dist;
            }
        }

        if let Some(idx) = best_idx {
            if best <= HAMMING_DIST_THR_LOW && passes_ratio_test(best, second, lowe_ratio) {
                checker.append(
                    assigned.len(),
                    last.keypoints[last_idx].angle,
                    current.keypoints[idx].angle,
                );
                assigned.push((idx, lm_id));
            }
        }
    }

    let invalid: std::collections::HashSet<usize> =
        checker.invalid_matches().into_iter().collect();
    let mut num_matched = 0;
    for (match_idx, (frame_idx, lm_id)) in assigned.into_iter().enumerate() {
        if invalid.contains(&match_idx) {
            continue;
        }
        if current.landmarks[frame_idx].is_none() {
            current.landmarks[frame_idx] = Some(lm_id);
            num_matched += 1;
        }
    }
    num_matched
}

/// Project a world point with the frame pose; helper shared with the
/// relocalizer.
pub fn project_to_frame(frame: &Frame, point: &nalgebra::Vector3<f64>) -> Option<Vector2<f64>> {
    let pose = frame.pose_cw.as_ref()?;
    let px = frame.camera.project(&pose.transform_point(point))?;
    frame.camera.image_bounds().contains(px.x, px.y).then_some(px)
}
