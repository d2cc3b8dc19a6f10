//! Keyframe insertion policy and creation.

use tracing::debug;

use crate::map::{Frame, Keyframe, KeyframeId, Landmark, MapDatabase};

/// Minimum tracked landmarks for a new keyframe.
const MIN_NUM_TRACKED: usize = 100;
/// Insert when tracking fewer than this fraction of the reference keyframe's
/// landmarks.
const REF_TRACK_RATIO: f64 = 0.9;
/// Landmark observation count used when measuring the reference keyframe's
/// coverage.
const MIN_OBS_PER_LANDMARK: usize = 3;

/// Decides when tracking should promote the current frame.
#[derive(Debug, Clone)]
pub struct KeyframeInserter {
    /// Force insertion after this many frames (≈ 1 s of input).
    pub max_interval_frames: u64,
    /// Never insert before this many frames unless forced.
    pub min_interval_frames: u64,
}

impl KeyframeInserter {
    pub fn new(fps: f64) -> Self {
        Self {
            max_interval_frames: fps.round().max(1.0) as u64,
            min_interval_frames: 0,
        }
    }

    /// The insertion predicate.
    pub fn new_keyframe_is_needed(
        &self,
        map: &MapDatabase,
        frame: &Frame,
        num_tracked: usize,
        last_keyframe_frame_id: u64,
        mapper_is_idle: bool,
    ) -> bool {
        let Some(ref_kf) = frame.ref_keyframe else {
            return false;
        };
        let frames_since_last = frame.id.saturating_sub(last_keyframe_frame_id);

        let interval_ok = frames_since_last >= self.max_interval_frames
            || (frames_since_last >= self.min_interval_frames && mapper_is_idle);
        if !interval_ok {
            return false;
        }

        if num_tracked < MIN_NUM_TRACKED {
            return false;
        }

        let ref_tracked = map.num_tracked_landmarks(ref_kf, MIN_OBS_PER_LANDMARK).max(1);
        let weakly_tracked = (num_tracked as f64) < REF_TRACK_RATIO * ref_tracked as f64;
        weakly_tracked || frames_since_last >= self.max_interval_frames
    }

    /// Promote the frame: create the keyframe, register the frame's landmark
    /// associations, and (for depth-carrying setups) seed landmarks for
    /// well-measured unmatched keypoints.
    pub fn create_keyframe(&self, map: &mut MapDatabase, frame: &Frame) -> KeyframeId {
        let kf_id = map.next_keyframe_id();
        let keyframe = Keyframe::from_frame(kf_id, frame);
        map.add_keyframe(keyframe);

        for (keypoint_idx, lm_slot) in frame.landmarks.iter().enumerate() {
            let Some(raw_id) = *lm_slot else {
                continue;
            };
            if frame.outliers[keypoint_idx] {
                continue;
            }
            if let Some(lm_id) = map.resolve_landmark(raw_id) {
                map.associate(kf_id, keypoint_idx, lm_id);
                map.update_landmark_geometry(lm_id);
            }
        }

        if frame.camera.setup.has_depth() {
            self.seed_depth_landmarks(map, frame, kf_id);
        }

        debug!(keyframe = %kf_id, frame = frame.id, "keyframe created");
        kf_id
    }

    /// Create landmarks from reliable depths at unmatched keypoints.
    fn seed_depth_landmarks(&self, map: &mut MapDatabase, frame: &Frame, kf_id: KeyframeId) {
        let max_depth = frame.camera.max_reliable_depth();
        let mut num_seeded = 0;
        for keypoint_idx in 0..frame.num_keypoints() {
            let already_matched = map
                .keyframe(kf_id)
                .map(|kf| kf.landmark_at(keypoint_idx).is_some())
                .unwrap_or(true);
            if already_matched {
                continue;
            }
            let Some(depth) = frame.depths[keypoint_idx] else {
                continue;
            };
            if depth <= 0.0 || (max_depth > 0.0 && depth > max_depth) {
                continue;
            }
            let Some(position) = frame.unproject_keypoint(keypoint_idx) else {
                continue;
            };
            let lm_id = map.next_landmark_id();
            let mut landmark = Landmark::new(
                lm_id,
                position,
                frame.descriptors[keypoint_idx],
                kf_id,
            );
            landmark.first_keyframe = kf_id;
            map.add_landmark(landmark);
            map.associate(kf_id, keypoint_idx, lm_id);
            map.update_landmark_geometry(lm_id);
            num_seeded += 1;
        }
        if num_seeded > 0 {
            debug!(keyframe = %kf_id, num_seeded, "seeded depth landmarks");
        }
    }
}

impl Default for KeyframeInserter {
    fn default() -> Self {
        Self::new(30.0)
    }
}
