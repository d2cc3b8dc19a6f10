//! Main tracker: the per-frame pose estimation state machine.
//!
//! `Initializing → Tracking` once the map bootstrap succeeds (two-view for
//! monocular, single-frame for stereo/RGB-D). `Tracking → Lost` when pose
//! optimization retains too few inliers. `Lost → Tracking` when BoW
//! relocalization recovers the pose.
//!
//! Inside `Tracking`, each frame runs: motion-model → BoW → robust matching
//! fallbacks for the initial pose, pose-only optimization, local-map
//! projection matching with a second optimization, and the keyframe
//! insertion decision.

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::config::{SetupType, TrackingConfig};
use crate::geometry::SE3;
use crate::initialize::{bootstrap_from_depth, initialize_two_view, MonocularInitConfig};
use crate::map::{Frame, Keyframe, KeyframeId, Landmark, MapDatabase};
use crate::matcher::{
    bow_match, projection, robust, passes_ratio_test, HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST,
};
use crate::optimize::{
    apply_ba_results, collect_global_ba, optimize_pose, solve_global_ba, PoseObservation,
    PoseProblem, PoseResult,
};
use crate::system::SharedContext;

use super::keyframe_inserter::KeyframeInserter;
use super::local_map::build_local_map;
use super::relocalizer::relocalize;
use super::TrackingState;

/// Minimum matches to attempt pose optimization.
const MIN_NUM_MATCHES: usize = 20;
/// Motion-model projection margin, doubled on retry.
const MOTION_MODEL_MARGIN: f64 = 7.0;
/// Local-map projection margin.
const LOCAL_MAP_MARGIN: f64 = 5.0;
/// Tracking-time BoW ratio (relocalization uses its own configured value).
const TRACKING_BOW_RATIO: f64 = 0.75;
/// Tracking-time robust-fallback ratio.
const TRACKING_ROBUST_RATIO: f64 = 0.8;

/// Per-frame result handed back through the public API.
#[derive(Debug, Clone)]
pub struct TrackingOutcome {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// Estimated world→camera pose; `None` while initializing or lost.
    pub pose_cw: Option<SE3>,
    pub num_tracked: usize,
}

pub struct Tracker {
    config: TrackingConfig,
    mono_init_config: MonocularInitConfig,
    inserter: KeyframeInserter,
    state: TrackingState,

    last_frame: Option<Frame>,
    /// Monocular two-view reference.
    init_frame: Option<Frame>,
    /// Constant-velocity model: `T_{current,last}`.
    velocity: Option<SE3>,
    ref_keyframe: Option<KeyframeId>,
    last_keyframe_frame_id: u64,

    kf_sender: Sender<KeyframeId>,
}

impl Tracker {
    pub fn new(config: TrackingConfig, fps: f64, kf_sender: Sender<KeyframeId>) -> Self {
        Self {
            config,
            mono_init_config: MonocularInitConfig::default(),
            inserter: KeyframeInserter::new(fps),
            state: TrackingState::Initializing,
            last_frame: None,
            init_frame: None,
            velocity: None,
            ref_keyframe: None,
            last_keyframe_frame_id: 0,
            kf_sender,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Enter `Lost` so the next frame relocalizes against the current map
    /// (used after loading a saved map).
    pub fn begin_relocalization(&mut self) {
        self.state = TrackingState::Lost;
    }

    /// Drop all per-session state; the caller clears the database.
    pub fn reset(&mut self) {
        self.state = TrackingState::Initializing;
        self.last_frame = None;
        self.init_frame = None;
        self.velocity = None;
        self.ref_keyframe = None;
        self.last_keyframe_frame_id = 0;
    }

    /// Process one frame. Runs on the caller's thread.
    pub fn process_frame(&mut self, mut frame: Frame, shared: &SharedContext) -> TrackingOutcome {
        match self.state {
            TrackingState::Initializing => self.initialize(&mut frame, shared),
            TrackingState::Tracking => self.track(&mut frame, shared),
            TrackingState::Lost => self.track_after_relocalization(&mut frame, shared),
        }

        let num_tracked = frame.num_tracked_landmarks();
        let is_lost = self.state != TrackingState::Tracking;
        {
            let mut map = shared.map.write();
            if map.num_keyframes() > 0 {
                map.update_frame_statistics(&frame, is_lost);
            }
        }

        let outcome = TrackingOutcome {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            state: self.state,
            pose_cw: if is_lost { None } else { frame.pose_cw.clone() },
            num_tracked,
        };
        self.last_frame = Some(frame);
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &mut Frame, shared: &SharedContext) {
        match frame.camera.setup {
            SetupType::Monocular => self.initialize_monocular(frame, shared),
            SetupType::Stereo | SetupType::RgbD => self.initialize_with_depth(frame, shared),
        }
    }

    fn initialize_with_depth(&mut self, frame: &mut Frame, shared: &SharedContext) {
        frame.set_pose(SE3::identity());
        let Some(bootstrap) = bootstrap_from_depth(frame) else {
            return;
        };

        frame.compute_bow(&shared.vocabulary);
        let kf_id = {
            let mut map = shared.map.write();
            let kf_id = map.next_keyframe_id();
            map.add_keyframe(Keyframe::from_frame(kf_id, frame));
            for (keypoint_idx, position) in &bootstrap.points {
                let lm_id = map.next_landmark_id();
                let landmark = Landmark::new(
                    lm_id,
                    *position,
                    frame.descriptors[*keypoint_idx],
                    kf_id,
                );
                map.add_landmark(landmark);
                map.associate(kf_id, *keypoint_idx, lm_id);
                map.update_landmark_geometry(lm_id);
                frame.landmarks[*keypoint_idx] = Some(lm_id);
            }
            map.update_connections(kf_id);
            kf_id
        };
        if let Some(bow) = frame.bow.as_ref() {
            shared.bow_db.lock().add(kf_id, bow);
        }

        frame.ref_keyframe = Some(kf_id);
        self.ref_keyframe = Some(kf_id);
        self.last_keyframe_frame_id = frame.id;
        self.state = TrackingState::Tracking;
        let _ = self.kf_sender.send(kf_id);
        info!(keyframe = %kf_id, points = bootstrap.points.len(), "map bootstrapped from depth");
    }

    fn initialize_monocular(&mut self, frame: &mut Frame, shared: &SharedContext) {
        const MIN_INIT_KEYPOINTS: usize = 100;
        if frame.num_keypoints() < MIN_INIT_KEYPOINTS {
            self.init_frame = None;
            return;
        }
        let Some(init_frame) = self.init_frame.clone() else {
            let mut reference = frame.clone();
            reference.set_pose(SE3::identity());
            self.init_frame = Some(reference);
            return;
        };

        let matched =
            robust::match_frames_robust(&init_frame, frame, TRACKING_ROBUST_RATIO, frame.id);
        let Some(init) = initialize_two_view(
            &init_frame,
            frame,
            &matched.matches,
            &self.mono_init_config,
            frame.id,
        ) else {
            // Keep waiting with the same reference until it grows stale.
            if frame.id.saturating_sub(init_frame.id) > 30 {
                self.init_frame = None;
            }
            return;
        };

        frame.set_pose(init.pose_2_cw.clone());
        let mut ref_frame = init_frame;
        ref_frame.compute_bow(&shared.vocabulary);
        frame.compute_bow(&shared.vocabulary);

        let (kf_1, kf_2) = {
            let mut map = shared.map.write();
            let kf_1 = map.next_keyframe_id();
            map.add_keyframe(Keyframe::from_frame(kf_1, &ref_frame));
            let kf_2 = map.next_keyframe_id();
            map.add_keyframe(Keyframe::from_frame(kf_2, frame));

            for (ref_idx, cur_idx, position) in &init.triangulated {
                let lm_id = map.next_landmark_id();
                let landmark =
                    Landmark::new(lm_id, *position, frame.descriptors[*cur_idx], kf_2);
                map.add_landmark(landmark);
                map.associate(kf_1, *ref_idx, lm_id);
                map.associate(kf_2, *cur_idx, lm_id);
                map.update_landmark_geometry(lm_id);
                frame.landmarks[*cur_idx] = Some(lm_id);
            }
            map.update_connections(kf_1);
            map.update_connections(kf_2);

            // Polish the seed map.
            if let Some(problem) = collect_global_ba(&map) {
                if let Some(result) = solve_global_ba(&problem, &|| false) {
                    apply_ba_results(&mut map, &result);
                    if let Some(kf) = map.keyframe(kf_2) {
                        frame.set_pose(kf.pose_cw().clone());
                    }
                }
            }
            (kf_1, kf_2)
        };
        {
            let map = shared.map.read();
            let mut bow_db = shared.bow_db.lock();
            for kf_id in [kf_1, kf_2] {
                if let Some(bow) = map.keyframe(kf_id).and_then(|kf| kf.bow.as_ref()) {
                    bow_db.add(kf_id, bow);
                }
            }
        }

        frame.ref_keyframe = Some(kf_2);
        self.ref_keyframe = Some(kf_2);
        self.last_keyframe_frame_id = frame.id;
        self.init_frame = None;
        self.state = TrackingState::Tracking;
        let _ = self.kf_sender.send(kf_1);
        let _ = self.kf_sender.send(kf_2);
        info!(
            seed_landmarks = init.triangulated.len(),
            "monocular two-view bootstrap succeeded"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────

    fn track(&mut self, frame: &mut Frame, shared: &SharedContext) {
        let num_matches = self.estimate_initial_pose(frame, shared);
        if num_matches < self.config.min_num_inliers {
            warn!(frame = frame.id, num_matches, "no usable matches, track lost");
            self.state = TrackingState::Lost;
            return;
        }

        let num_inliers = {
            let map = shared.map.read();
            let (problem, keypoint_indices) = build_pose_problem(frame, &map);
            let result = optimize_pose(&problem);
            if result.diverged {
                warn!(frame = frame.id, "pose optimization diverged, keeping prior pose");
                0
            } else {
                apply_pose_result(frame, &result, &keypoint_indices);
                frame.discard_outlier_landmarks();
                result.num_inliers
            }
        };
        if num_inliers < self.config.min_num_inliers {
            self.state = TrackingState::Lost;
            return;
        }

        let num_tracked = self.track_local_map(frame, shared);
        if num_tracked < self.config.min_num_inliers {
            self.state = TrackingState::Lost;
            return;
        }

        // Constant-velocity model.
        if let (Some(last), Some(pose)) = (self.last_frame.as_ref(), frame.pose_cw.as_ref()) {
            if let Some(last_pose) = last.pose_cw.as_ref() {
                self.velocity = Some(pose.compose(&last_pose.inverse()));
            }
        }

        self.decide_new_keyframe(frame, num_tracked, shared);
    }

    /// Motion-model, then BoW, then robust fallbacks. Returns the number of
    /// landmark associations produced.
    fn estimate_initial_pose(&mut self, frame: &mut Frame, shared: &SharedContext) -> usize {
        let map = shared.map.read();

        // Motion model with margin-doubling retry.
        if let (Some(velocity), Some(last)) = (self.velocity.as_ref(), self.last_frame.as_ref()) {
            if let Some(last_pose) = last.pose_cw.as_ref() {
                frame.set_pose(velocity.compose(last_pose));
                let mut n = projection::match_current_and_last_frame(
                    frame,
                    last,
                    &map,
                    MOTION_MODEL_MARGIN,
                    self.config.reloc_proj_match_lowe_ratio,
                );
                if n < MIN_NUM_MATCHES {
                    frame.landmarks.iter_mut().for_each(|slot| *slot = None);
                    n = projection::match_current_and_last_frame(
                        frame,
                        last,
                        &map,
                        MOTION_MODEL_MARGIN * 2.0,
                        self.config.reloc_proj_match_lowe_ratio,
                    );
                }
                if n >= MIN_NUM_MATCHES {
                    return n;
                }
            }
        }

        // BoW match against the reference keyframe.
        let Some(ref_kf) = self
            .ref_keyframe
            .and_then(|id| map.keyframe(id))
            .map(Clone::clone)
        else {
            return 0;
        };
        frame.landmarks.iter_mut().for_each(|slot| *slot = None);
        if frame.pose_cw.is_none() {
            let prior = self
                .last_frame
                .as_ref()
                .and_then(|f| f.pose_cw.clone())
                .unwrap_or_else(|| ref_kf.pose_cw().clone());
            frame.set_pose(prior);
        } else if let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose_cw.clone()) {
            frame.set_pose(last_pose);
        }
        frame.compute_bow(&shared.vocabulary);
        let n = bow_match::match_frame_against_keyframe(frame, &ref_kf, &map, TRACKING_BOW_RATIO);
        if n >= MIN_NUM_MATCHES {
            return n;
        }

        // Robust brute-force fallback.
        frame.landmarks.iter_mut().for_each(|slot| *slot = None);
        robust_match_against_keyframe(frame, &ref_kf, &map)
    }

    /// Project the local map into the frame and refine the pose again.
    /// Returns the final tracked-landmark count.
    fn track_local_map(&mut self, frame: &mut Frame, shared: &SharedContext) -> usize {
        let mut map = shared.map.write();

        let local = build_local_map(&map, frame);
        if let Some(ref_kf) = local.ref_keyframe {
            frame.ref_keyframe = Some(ref_kf);
            self.ref_keyframe = Some(ref_kf);
        }
        map.set_local_landmarks(local.landmarks.clone());

        projection::match_frame_and_local_landmarks(
            frame,
            &mut map,
            &local.landmarks,
            LOCAL_MAP_MARGIN,
            self.config.reloc_proj_match_lowe_ratio,
        );

        let (problem, keypoint_indices) = build_pose_problem(frame, &map);
        let result = optimize_pose(&problem);
        if result.diverged {
            warn!(frame = frame.id, "local-map pose optimization diverged");
            return 0;
        }
        apply_pose_result(frame, &result, &keypoint_indices);

        // Inlier associations count as found.
        for (slot, &keypoint_idx) in keypoint_indices.iter().enumerate() {
            if result.inliers[slot] {
                if let Some(lm_id) = frame.landmarks[keypoint_idx] {
                    if let Some(lm) = map.landmark_mut(lm_id) {
                        lm.increase_num_observed(1);
                    }
                }
            }
        }
        frame.discard_outlier_landmarks()
    }

    fn track_after_relocalization(&mut self, frame: &mut Frame, shared: &SharedContext) {
        frame.compute_bow(&shared.vocabulary);
        let relocalized = {
            let mut map = shared.map.write();
            let bow_db = shared.bow_db.lock();
            relocalize(frame, &mut map, &bow_db, &self.config)
        };
        if !relocalized {
            return;
        }

        self.ref_keyframe = frame.ref_keyframe;
        self.velocity = None;
        let num_tracked = self.track_local_map(frame, shared);
        if num_tracked >= self.config.reloc_min_num_valid_obs {
            info!(frame = frame.id, num_tracked, "relocalized");
            self.state = TrackingState::Tracking;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframe creation
    // ─────────────────────────────────────────────────────────────────────

    fn decide_new_keyframe(&mut self, frame: &mut Frame, num_tracked: usize, shared: &SharedContext) {
        if !shared.mapping_is_enabled() {
            return;
        }
        // While mapping is pausing or paused (loop correction in flight) no
        // keyframe is created, so a pause leaves the map untouched.
        if shared.mapping_lifecycle.pause_is_requested() || shared.mapping_lifecycle.is_paused() {
            return;
        }
        let needed = {
            let map = shared.map.read();
            self.inserter.new_keyframe_is_needed(
                &map,
                frame,
                num_tracked,
                self.last_keyframe_frame_id,
                shared.mapper_is_idle(),
            )
        };
        if !needed {
            return;
        }
        if !shared.mapper_is_idle() {
            shared.request_abort_local_ba();
        }

        frame.compute_bow(&shared.vocabulary);
        let kf_id = {
            let mut map = shared.map.write();
            self.inserter.create_keyframe(&mut map, frame)
        };
        if let Some(bow) = frame.bow.as_ref() {
            shared.bow_db.lock().add(kf_id, bow);
        }
        frame.ref_keyframe = Some(kf_id);
        self.ref_keyframe = Some(kf_id);
        self.last_keyframe_frame_id = frame.id;
        let _ = self.kf_sender.send(kf_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────

/// Build the pose-only problem from the frame's current associations.
/// Returns the problem and the keypoint index behind each observation.
pub(crate) fn build_pose_problem(frame: &Frame, map: &MapDatabase) -> (PoseProblem, Vec<usize>) {
    let mut observations = Vec::new();
    let mut keypoint_indices = Vec::new();

    for (keypoint_idx, lm_slot) in frame.landmarks.iter().enumerate() {
        let Some(raw_id) = *lm_slot else {
            continue;
        };
        let Some(lm) = map.resolve_landmark(raw_id).and_then(|id| map.landmark(id)) else {
            continue;
        };
        if lm.is_bad {
            continue;
        }
        let bearing = &frame.bearings[keypoint_idx];
        if bearing.z <= 1e-6 {
            continue;
        }
        let kp = &frame.keypoints[keypoint_idx];
        let disparity = frame.stereo_x_right[keypoint_idx].map(|xr| kp.x - xr);
        observations.push(PoseObservation {
            position: lm.position,
            meas_x: bearing.x / bearing.z,
            meas_y: bearing.y / bearing.z,
            disparity,
            inv_sigma_sq: frame.orb_params.inv_level_sigma_sq_at(kp.octave as usize),
        });
        keypoint_indices.push(keypoint_idx);
    }

    let problem = PoseProblem {
        initial_pose_cw: frame
            .pose_cw
            .clone()
            .unwrap_or_else(SE3::identity),
        camera: crate::optimize::CameraConstants::from_camera(&frame.camera),
        observations,
    };
    (problem, keypoint_indices)
}

/// Write an optimization result into the frame.
pub(crate) fn apply_pose_result(frame: &mut Frame, result: &PoseResult, keypoint_indices: &[usize]) {
    frame.set_pose(result.pose_cw.clone());
    for (slot, &keypoint_idx) in keypoint_indices.iter().enumerate() {
        frame.outliers[keypoint_idx] = !result.inliers[slot];
    }
}

/// Brute-force fallback: match the reference keyframe's landmark descriptors
/// against the frame without any spatial constraint.
fn robust_match_against_keyframe(frame: &mut Frame, keyframe: &Keyframe, map: &MapDatabase) -> usize {
    let mut num_matched = 0;
    let mut used = vec![false; frame.num_keypoints()];

    for (kf_idx, raw_id) in keyframe.landmark_associations() {
        let Some(lm_id) = map.resolve_landmark(raw_id) else {
            continue;
        };
        if map.landmark(lm_id).map_or(true, |lm| lm.is_bad) {
            continue;
        }
        let desc = &keyframe.descriptors[kf_idx];
        let mut best = MAX_HAMMING_DIST;
        let mut second = MAX_HAMMING_DIST;
        let mut best_idx = None;
        for (frame_idx, frame_desc) in frame.descriptors.iter().enumerate() {
            if used[frame_idx] || frame.landmarks[frame_idx].is_some() {
                continue;
            }
            let dist = desc.distance(frame_desc);
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(frame_idx);
            } else if dist < second {
                second = dist;
            }
        }
        if let Some(frame_idx) = best_idx {
            if best <= HAMMING_DIST_THR_LOW
                && passes_ratio_test(best, second, TRACKING_ROBUST_RATIO)
            {
                frame.landmarks[frame_idx] = Some(lm_id);
                used[frame_idx] = true;
                num_matched += 1;
            }
        }
    }
    debug!(num_matched, "robust fallback matching");
    num_matched
}
