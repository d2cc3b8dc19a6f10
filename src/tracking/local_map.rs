//! Local map assembly.
//!
//! The local map of a frame is built from the keyframes sharing landmark
//! observations with it (first order, capped), extended by each one's best
//! covisibilities and spanning-tree relatives (second order). The union of
//! their landmarks is the search set for projection matching.

use std::collections::{HashMap, HashSet};

use crate::map::{Frame, KeyframeId, LandmarkId, MapDatabase};

/// First-order keyframe cap.
const MAX_FIRST_ORDER_KEYFRAMES: usize = 60;
/// Neighbors pulled in per first-order keyframe.
const SECOND_ORDER_NEIGHBORS: usize = 10;

#[derive(Debug, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyframeId>,
    pub landmarks: Vec<LandmarkId>,
    /// Keyframe sharing the most landmarks with the frame.
    pub ref_keyframe: Option<KeyframeId>,
}

/// Build the local map around the frame's current landmark associations.
pub fn build_local_map(map: &MapDatabase, frame: &Frame) -> LocalMap {
    // First order: observers of the frame's landmarks, weighted by shares.
    let mut share_counts: HashMap<KeyframeId, usize> = HashMap::new();
    for lm_slot in frame.landmarks.iter().flatten() {
        let Some(lm_id) = map.resolve_landmark(*lm_slot) else {
            continue;
        };
        if let Some(lm) = map.landmark(lm_id) {
            for (&kf_id, _) in lm.observations.iter() {
                *share_counts.entry(kf_id).or_insert(0) += 1;
            }
        }
    }
    if share_counts.is_empty() {
        return LocalMap::default();
    }

    let ref_keyframe = share_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(&id, _)| id);

    let mut first_order: Vec<(KeyframeId, usize)> = share_counts.into_iter().collect();
    first_order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    first_order.truncate(MAX_FIRST_ORDER_KEYFRAMES);

    let mut keyframes: HashSet<KeyframeId> = HashSet::new();
    for &(kf_id, _) in &first_order {
        keyframes.insert(kf_id);
    }

    // Second order: best covisibilities plus tree relatives.
    let mut second_order = Vec::new();
    for &(kf_id, _) in &first_order {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        second_order.extend(kf.top_covisibilities_readonly(SECOND_ORDER_NEIGHBORS));
        if let Some(parent) = kf.parent {
            second_order.push(parent);
        }
        second_order.extend(kf.children.iter().copied());
    }
    for kf_id in second_order {
        keyframes.insert(kf_id);
    }

    // Landmark union.
    let mut landmarks: HashSet<LandmarkId> = HashSet::new();
    for &kf_id in &keyframes {
        if let Some(kf) = map.keyframe(kf_id) {
            for (_, lm_id) in kf.landmark_associations() {
                if map.landmark(lm_id).map_or(false, |lm| !lm.is_bad) {
                    landmarks.insert(lm_id);
                }
            }
        }
    }

    let mut keyframes: Vec<KeyframeId> = keyframes.into_iter().collect();
    keyframes.sort();
    let mut landmarks: Vec<LandmarkId> = landmarks.into_iter().collect();
    landmarks.sort();

    LocalMap {
        keyframes,
        landmarks,
        ref_keyframe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::KeyPoint;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use crate::map::frame::test_support::frame_with_keypoints;
    use nalgebra::Vector3;

    #[test]
    fn test_local_map_collects_neighborhood() {
        let mut map = MapDatabase::new();
        let kf1 = insert_keyframe(&mut map, 40);
        let kf2 = insert_keyframe(&mut map, 40);
        let kf3 = insert_keyframe(&mut map, 40);

        // kf1↔kf2 strongly covisible; kf3 only connected to kf2.
        let mut lms_12 = Vec::new();
        for i in 0..20 {
            lms_12.push(insert_landmark(
                &mut map,
                Vector3::new(0.0, 0.0, 3.0),
                &[(kf1, i), (kf2, i)],
            ));
        }
        for i in 20..36 {
            insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(kf2, i), (kf3, i)]);
        }
        map.update_connections(kf1);
        map.update_connections(kf2);
        map.update_connections(kf3);

        // Frame observing landmarks of kf1/kf2.
        let mut frame = frame_with_keypoints(9, vec![KeyPoint::new(10.0, 10.0, 0); 10]);
        for (slot, lm) in lms_12.iter().take(10).enumerate() {
            frame.landmarks[slot] = Some(*lm);
        }

        let local = build_local_map(&map, &frame);
        // Both direct observers present, kf3 pulled in second order.
        assert!(local.keyframes.contains(&kf1));
        assert!(local.keyframes.contains(&kf2));
        assert!(local.keyframes.contains(&kf3));
        // Reference = most shares (kf1 and kf2 tie at 10; deterministic pick).
        assert!(local.ref_keyframe == Some(kf1) || local.ref_keyframe == Some(kf2));
        // All 36 landmarks unioned.
        assert_eq!(local.landmarks.len(), 36);
    }

    #[test]
    fn test_empty_frame_gives_empty_local_map() {
        let map = MapDatabase::new();
        let frame = frame_with_keypoints(0, vec![]);
        let local = build_local_map(&map, &frame);
        assert!(local.keyframes.is_empty());
        assert!(local.ref_keyframe.is_none());
    }
}
