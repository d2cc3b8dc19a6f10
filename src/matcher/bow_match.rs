//! BoW-guided matching.
//!
//! Walks the two feature vectors in lockstep and compares descriptors only
//! under shared vocabulary nodes, turning the quadratic exhaustive search
//! into a per-node one.

use crate::map::{Frame, Keyframe, LandmarkId, MapDatabase};

use super::{passes_ratio_test, AngleChecker, HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST};

/// Match a keyframe's landmark-bearing features against a frame.
///
/// Writes accepted associations into `frame.landmarks` and returns the match
/// count. Both sides must have their BoW representation computed.
pub fn match_frame_against_keyframe(
    frame: &mut Frame,
    keyframe: &Keyframe,
    map: &MapDatabase,
    lowe_ratio: f64,
) -> usize {
    let (Some(kf_fv), Some(frame_fv)) = (keyframe.feature_vec.as_ref(), frame.feature_vec.as_ref())
    else {
        return 0;
    };

    let mut checker = AngleChecker::new();
    let mut assigned: Vec<(usize, LandmarkId)> = Vec::new();

    // BTreeMap iteration is ordered: merge-join on node ids.
    let mut frame_iter = frame_fv.iter().peekable();
    for (node, kf_indices) in kf_fv.iter() {
        let frame_indices = loop {
            match frame_iter.peek() {
                Some((frame_node, indices)) if *frame_node == node => break Some(*indices),
                Some((frame_node, _)) if *frame_node < node => {
                    frame_iter.next();
                }
                _ => break None,
            }
        };
        let Some(frame_indices) = frame_indices else {
            continue;
        };

        for &kf_idx in kf_indices {
            let Some(raw_id) = keyframe.landmark_at(kf_idx) else {
                continue;
            };
            let Some(lm_id) = map.resolve_landmark(raw_id) else {
                continue;
            };
            if map.landmark(lm_id).map_or(true, |lm| lm.is_bad) {
                continue;
            }
            let kf_desc = &keyframe.descriptors[kf_idx];

            let mut best = MAX_HAMMING_DIST;
            let mut second = MAX_HAMMING_DIST;
            let mut best_idx = None;
            for &frame_idx in frame_indices {
                if frame.landmarks[frame_idx].is_some() {
                    continue;
                }
                let dist = kf_desc.distance(&frame.descriptors[frame_idx]);
                if dist < best {
                    second = best;
                    best = dist;
                    best_idx = Some(frame_idx);
                } else if dist < second {
                    second = dist;
                }
            }

            if let Some(frame_idx) = best_idx {
                if best <= HAMMING_DIST_THR_LOW && passes_ratio_test(best, second, lowe_ratio) {
                    checker.append(
                        assigned.len(),
                        keyframe.keypoints[kf_idx].angle,
                        frame.keypoints[frame_idx].angle,
                    );
                    assigned.push((frame_idx, lm_id));
                }
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
        if frame.landmarks[frame_idx].is_none() {
            frame.landmarks[frame_idx] = Some(lm_id);
            num_matched += 1;
        }
    }
    num_matched
}

/// Match two keyframes' features under shared vocabulary nodes.
///
/// Returns (keypoint index in `kf_1`, keypoint index in `kf_2`) pairs; used
/// by loop verification, where the caller then pairs up the associated
/// landmarks.
pub fn match_keyframes(
    kf_1: &Keyframe,
    kf_2: &Keyframe,
    lowe_ratio: f64,
) -> Vec<(usize, usize)> {
    let (Some(fv_1), Some(fv_2)) = (kf_1.feature_vec.as_ref(), kf_2.feature_vec.as_ref()) else {
        return Vec::new();
    };

    let mut checker = AngleChecker::new();
    let mut matches: Vec<(usize, usize)> = Vec::new();
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
            if kf_1.landmark_at(idx_1).is_none() {
                continue;
            }
            let desc_1 = &kf_1.descriptors[idx_1];

            let mut best = MAX_HAMMING_DIST;
            let mut second = MAX_HAMMING_DIST;
            let mut best_idx = None;
            for &idx_2 in indices_2 {
                if used_2[idx_2] || kf_2.landmark_at(idx_2).is_none() {
                    continue;
                }
                let dist = desc_1.distance(&kf_2.descriptors[idx_2]);
                if dist < best {
                    second = best;
                    best = dist;
                    best_idx = Some(idx_2);
                } else if dist < second {
                    second = dist;
                }
            }

            if let Some(idx_2) = best_idx {
                if best <= HAMMING_DIST_THR_LOW && passes_ratio_test(best, second, lowe_ratio) {
                    used_2[idx_2] = true;
                    checker.append(
                        matches.len(),
                        kf_1.keypoints[idx_1].angle,
                        kf_2.keypoints[idx_2].angle,
                    );
                    matches.push((idx_1, idx_2));
                }
            }
        }
    }

    let invalid: std::collections::HashSet<usize> =
        checker.invalid_matches().into_iter().collect();
    matches
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !invalid.contains(i))
        .map(|(_, m)| m)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bow::Vocabulary;
    use crate::feature::{Descriptor, KeyPoint};
    use crate::geometry::SE3;
    use crate::map::database::test_support::insert_landmark;
    use crate::map::frame::test_support::frame_with_keypoints;
    use crate::map::KeyframeId;
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut d = Descriptor::ZERO;
                for b in d.0.iter_mut() {
                    *b = rng.gen();
                }
                d
            })
            .collect()
    }

    #[test]
    fn test_bow_match_frame_against_keyframe() {
        let vocab = Vocabulary::synthetic(4, 3, 21);
        let descriptors = random_descriptors(12, 3);

        let mut map = MapDatabase::new();
        // Keyframe observing 12 landmarks with known descriptors.
        let kf_id = {
            let id = map.next_keyframe_id();
            let mut kf_frame =
                frame_with_keypoints(0, vec![KeyPoint::new(100.0, 100.0, 0); 12]);
            kf_frame.descriptors = descriptors.clone();
            kf_frame.set_pose(SE3::identity());
            kf_frame.compute_bow(&vocab);
            map.add_keyframe(crate::map::Keyframe::from_frame(id, &kf_frame));
            id
        };
        let mut lms = Vec::new();
        for i in 0..12 {
            let lm = insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(kf_id, i)]);
            map.landmark_mut(lm).unwrap().descriptor = descriptors[i];
            lms.push(lm);
        }

        // Frame with the same descriptors shuffled.
        let mut frame = frame_with_keypoints(5, vec![KeyPoint::new(200.0, 200.0, 0); 12]);
        let perm: Vec<usize> = (0..12).rev().collect();
        frame.descriptors = perm.iter().map(|&i| descriptors[i]).collect();
        frame.compute_bow(&vocab);

        let kf = map.keyframe(kf_id).unwrap().clone();
        let n = match_frame_against_keyframe(&mut frame, &kf, &map, 0.75);
        assert_eq!(n, 12);
        for (frame_idx, &kf_idx) in perm.iter().enumerate() {
            assert_eq!(frame.landmarks[frame_idx], Some(lms[kf_idx]));
        }
    }

    #[test]
    fn test_match_keyframes_pairs_indices() {
        let vocab = Vocabulary::synthetic(4, 3, 21);
        let descriptors = random_descriptors(10, 8);

        let mut map = MapDatabase::new();
        let mut kf_ids = Vec::new();
        for round in 0..2 {
            let id = map.next_keyframe_id();
            let mut kf_frame =
                frame_with_keypoints(round, vec![KeyPoint::new(100.0, 100.0, 0); 10]);
            kf_frame.descriptors = descriptors.clone();
            kf_frame.set_pose(SE3::identity());
            kf_frame.compute_bow(&vocab);
            map.add_keyframe(crate::map::Keyframe::from_frame(id, &kf_frame));
            kf_ids.push(id);
        }
        for i in 0..10 {
            insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(kf_ids[0], i)]);
            insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(kf_ids[1], i)]);
        }

        let kf_1 = map.keyframe(kf_ids[0]).unwrap();
        let kf_2 = map.keyframe(kf_ids[1]).unwrap();
        let matches = match_keyframes(kf_1, kf_2, 0.75);
        assert_eq!(matches.len(), 10);
        for (a, b) in matches {
            assert_eq!(a, b);
        }
    }
}
