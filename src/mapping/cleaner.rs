//! Landmark and keyframe culling.

use tracing::debug;

use crate::config::SetupType;
use crate::map::{BowDatabase, KeyframeId, LandmarkId, MapDatabase};

/// Observation-ratio floor for any landmark.
const MIN_OBSERVED_RATIO: f64 = 0.25;
/// Keyframes a landmark has to prove itself over after creation.
const GRACE_WINDOW_KEYFRAMES: u64 = 3;
/// A keyframe is redundant when this fraction of its landmarks is seen
/// elsewhere at equal-or-finer scale.
const REDUNDANT_OBS_RATIO: f64 = 0.9;
/// Observers (excluding the candidate) needed to call a landmark redundant.
const MIN_REDUNDANT_OBSERVERS: usize = 3;

/// Observations required inside the grace window before a landmark is
/// considered established. Depth-carrying setups seed landmarks from a
/// single frame, so they must re-observe under a stricter bar.
fn required_observations(setup: SetupType) -> usize {
    match setup {
        SetupType::Monocular => 2,
        SetupType::Stereo | SetupType::RgbD => 3,
    }
}

/// Cull under-performing recent landmarks. Returns the number erased.
pub fn cull_landmarks(map: &mut MapDatabase, current: KeyframeId, setup: SetupType) -> usize {
    let required = required_observations(setup);

    let to_erase: Vec<LandmarkId> = map
        .landmarks()
        .filter(|lm| {
            if lm.is_bad {
                return true;
            }
            if lm.observed_ratio() < MIN_OBSERVED_RATIO {
                return true;
            }
            let age = current.0.saturating_sub(lm.first_keyframe.0);
            // Inside the grace window a landmark must accumulate observers;
            // past it, only the ratio test applies.
            if (2..=GRACE_WINDOW_KEYFRAMES).contains(&age) && lm.num_observations() < 2 {
                return true;
            }
            if age > GRACE_WINDOW_KEYFRAMES && lm.num_observations() < required {
                return true;
            }
            false
        })
        .map(|lm| lm.id)
        .collect();

    let num_culled = to_erase.len();
    for lm_id in to_erase {
        map.erase_landmark(lm_id);
    }
    if num_culled > 0 {
        debug!(keyframe = %current, num_culled, "culled landmarks");
    }
    num_culled
}

/// Cull redundant keyframes among the current keyframe's neighbors.
///
/// A neighbor is redundant when ≥ 90% of its observed landmarks are also
/// seen by at least three other keyframes at equal-or-finer scale. Returns
/// the erased keyframe ids (already pruned from the BoW index).
pub fn cull_keyframes(
    map: &mut MapDatabase,
    bow_db: &mut BowDatabase,
    current: KeyframeId,
) -> Vec<KeyframeId> {
    let neighbors = match map.keyframe_mut(current) {
        Some(kf) => kf.top_covisibilities(usize::MAX),
        None => return Vec::new(),
    };

    let mut erased = Vec::new();
    for candidate in neighbors {
        if candidate == current {
            continue;
        }
        let redundant = {
            let Some(kf) = map.keyframe(candidate) else {
                continue;
            };
            if kf.is_bad || kf.not_to_be_erased {
                continue;
            }
            let mut num_landmarks = 0usize;
            let mut num_redundant = 0usize;
            for (keypoint_idx, lm_id) in kf.landmark_associations() {
                let Some(lm) = map.landmark(lm_id) else {
                    continue;
                };
                if lm.is_bad {
                    continue;
                }
                num_landmarks += 1;
                let own_octave = kf.keypoints[keypoint_idx].octave;

                let mut better_observers = 0usize;
                for (&other_kf, &other_idx) in lm.observations.iter() {
                    if other_kf == candidate {
                        continue;
                    }
                    let Some(other) = map.keyframe(other_kf) else {
                        continue;
                    };
                    // Equal-or-finer scale only.
                    if other.keypoints[other_idx].octave <= own_octave {
                        better_observers += 1;
                        if better_observers >= MIN_REDUNDANT_OBSERVERS {
                            break;
                        }
                    }
                }
                if better_observers >= MIN_REDUNDANT_OBSERVERS {
                    num_redundant += 1;
                }
            }
            num_landmarks > 0
                && (num_redundant as f64) > REDUNDANT_OBS_RATIO * num_landmarks as f64
        };

        if redundant {
            if let Some(removed) = map.erase_keyframe(candidate) {
                if let Some(bow) = removed.bow.as_ref() {
                    bow_db.erase(candidate, bow);
                }
                erased.push(candidate);
            }
        }
    }
    if !erased.is_empty() {
        debug!(keyframe = %current, num_culled = erased.len(), "culled redundant keyframes");
    }
    erased
}
