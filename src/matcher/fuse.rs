//! Landmark fusion by projection (replace-or-add).
//!
//! Projects candidate landmarks into a target keyframe. When the best
//! matching keypoint already carries a landmark, the two are merged keeping
//! the one with more observations; otherwise the candidate is attached as a
//! new observation.

use crate::map::{KeyframeId, LandmarkId, MapDatabase};

use super::{HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST};

/// Maximum angle between mean viewing direction and the current ray (cos 60°).
const MAX_VIEWING_COS: f64 = 0.5;

/// Outcome counts of one fusion pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseResult {
    /// Duplicate pairs merged.
    pub num_fused: usize,
    /// New observations attached.
    pub num_added: usize,
}

/// Fuse `candidates` into `target_kf`.
pub fn replace_or_add(
    target_kf: KeyframeId,
    candidates: &[LandmarkId],
    map: &mut MapDatabase,
    margin: f64,
) -> FuseResult {
    let mut result = FuseResult::default();

    for &raw_id in candidates {
        let Some(lm_id) = map.resolve_landmark(raw_id) else {
            continue;
        };

        // Decide the action under an immutable view, apply afterwards.
        enum Action {
            Merge { existing: LandmarkId },
            Add { keypoint_idx: usize },
        }

        let action = {
            let Some(kf) = map.keyframe(target_kf) else {
                return result;
            };
            let Some(lm) = map.landmark(lm_id) else {
                continue;
            };
            if lm.is_bad || lm.is_observed_in(target_kf) {
                continue;
            }

            let p_cam = kf.pose_cw().transform_point(&lm.position);
            let Some(px) = kf.camera.project(&p_cam) else {
                continue;
            };
            if !kf.camera.image_bounds().contains(px.x, px.y) {
                continue;
            }
            let ray = lm.position - kf.camera_center();
            let dist = ray.norm();
            if !lm.is_inside_scale_range(dist) {
                continue;
            }
            if lm.mean_normal.norm() > 0.5 && ray.dot(&lm.mean_normal) / dist < MAX_VIEWING_COS {
                continue;
            }

            let predicted_octave = kf.orb_params.predict_scale_level(lm.max_valid_distance, dist);
            let radius = margin * kf.orb_params.scale_factor_at(predicted_octave);
            let min_octave = predicted_octave.saturating_sub(1) as u32;
            let max_octave =
                (predicted_octave + 1).min(kf.orb_params.num_levels as usize - 1) as u32;
            let candidates_idx =
                kf.features_in_area(px.x, px.y, radius, Some(min_octave), Some(max_octave));

            let mut best = MAX_HAMMING_DIST;
            let mut best_idx = None;
            for idx in candidates_idx {
                // Reprojection gate scaled by the keypoint's level.
                let kp = &kf.keypoints[idx];
                let sigma_sq = kf.orb_params.level_sigma_sq_at(kp.octave as usize);
                let du = kp.x - px.x;
                let dv = kp.y - px.y;
                if (du * du + dv * dv) / sigma_sq > 5.99 {
                    continue;
                }
                let dist = lm.descriptor.distance(&kf.descriptors[idx]);
                if dist < best {
                    best = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(keypoint_idx) = best_idx else {
                continue;
            };
            if best > HAMMING_DIST_THR_LOW {
                continue;
            }

            match kf.landmark_at(keypoint_idx).and_then(|id| map.resolve_landmark(id)) {
                Some(existing) if existing != lm_id => Action::Merge { existing },
                Some(_) => continue,
                None => Action::Add { keypoint_idx },
            }
        };

        match action {
            Action::Merge { existing } => {
                let keep_existing = {
                    let n_existing = map
                        .landmark(existing)
                        .map(|lm| lm.num_observations())
                        .unwrap_or(0);
                    let n_candidate = map
                        .landmark(lm_id)
                        .map(|lm| lm.num_observations())
                        .unwrap_or(0);
                    n_existing >= n_candidate
                };
                if keep_existing {
                    map.replace_landmark(lm_id, existing);
                } else {
                    map.replace_landmark(existing, lm_id);
                }
                result.num_fused += 1;
            }
            Action::Add { keypoint_idx } => {
                map.associate(target_kf, keypoint_idx, lm_id);
                map.update_landmark_geometry(lm_id);
                result.num_added += 1;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{Descriptor, KeyPoint};
    use crate::geometry::SE3;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use crate::map::frame::test_support::frame_with_keypoints;
    use crate::map::Keyframe;
    use nalgebra::Vector3;

    fn unique_descriptor(tag: u8) -> Descriptor {
        let mut d = Descriptor::ZERO;
        d.0[0] = tag;
        d.0[1] = tag.wrapping_mul(31);
        d
    }

    /// A keyframe at identity whose keypoint 0 images the world point
    /// (0, 0, 4).
    fn target_keyframe(map: &mut MapDatabase, descriptor: Descriptor) -> KeyframeId {
        let id = map.next_keyframe_id();
        let mut frame = frame_with_keypoints(50, vec![KeyPoint::new(320.0, 240.0, 0)]);
        frame.descriptors = vec![descriptor];
        frame.set_pose(SE3::identity());
        map.add_keyframe(Keyframe::from_frame(id, &frame));
        id
    }

    #[test]
    fn test_add_attaches_observation() {
        let mut map = MapDatabase::new();
        let desc = unique_descriptor(7);
        let other_kf = insert_keyframe(&mut map, 5);
        let target = target_keyframe(&mut map, desc);

        let lm = insert_landmark(&mut map, Vector3::new(0.0, 0.0, 4.0), &[(other_kf, 0)]);
        {
            let lm_mut = map.landmark_mut(lm).unwrap();
            lm_mut.descriptor = desc;
            lm_mut.min_valid_distance = 0.5;
            lm_mut.max_valid_distance = 4.2;
        }

        let result = replace_or_add(target, &[lm], &mut map, 4.0);
        assert_eq!(result.num_added, 1);
        assert_eq!(result.num_fused, 0);
        assert!(map.landmark(lm).unwrap().is_observed_in(target));
        assert_eq!(map.keyframe(target).unwrap().landmark_at(0), Some(lm));
    }

    #[test]
    fn test_duplicate_merged_keeping_more_observed() {
        let mut map = MapDatabase::new();
        let desc = unique_descriptor(9);
        let kf_a = insert_keyframe(&mut map, 5);
        let kf_b = insert_keyframe(&mut map, 5);
        let target = target_keyframe(&mut map, desc);

        // Existing landmark already attached to the target keypoint, with two
        // observations.
        let existing = insert_landmark(
            &mut map,
            Vector3::new(0.0, 0.0, 4.0),
            &[(kf_a, 0), (target, 0)],
        );
        // Duplicate observed once elsewhere.
        let duplicate = insert_landmark(&mut map, Vector3::new(0.0, 0.001, 4.0), &[(kf_b, 0)]);
        for &id in &[existing, duplicate] {
            let lm = map.landmark_mut(id).unwrap();
            lm.descriptor = desc;
            lm.min_valid_distance = 0.5;
            lm.max_valid_distance = 4.2;
        }

        let result = replace_or_add(target, &[duplicate], &mut map, 4.0);
        assert_eq!(result.num_fused, 1);
        // The better-observed landmark survived and absorbed the other.
        assert!(map.landmark(existing).is_some());
        assert!(map.landmark(duplicate).is_none());
        assert!(map.landmark(existing).unwrap().is_observed_in(kf_b));
    }
}
