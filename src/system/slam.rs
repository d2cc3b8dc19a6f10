//! System coordinator.
//!
//! Owns the tracking front-end (running on the caller's thread) and the
//! mapping and global-optimization threads, wires the keyframe queues
//! between them, and drives the pause/resume/reset/terminate handshakes.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver};
use tracing::info;

use crate::bow::Vocabulary;
use crate::camera::Camera;
use crate::config::{Config, SetupType};
use crate::error::{Error, Result};
use crate::feature::{DepthImage, FeatureExtractor, Image, OrbParams};
use crate::global_opt::GlobalOptimizationModule;
use crate::map::{io as map_io, Frame, TrajectoryEntry};
use crate::mapping::MappingModule;
use crate::matcher::stereo::match_stereo;
use crate::tracking::{Tracker, TrackingOutcome, TrackingState};

use super::shared_state::SharedContext;

/// The SLAM engine.
pub struct SlamSystem {
    camera: Arc<Camera>,
    orb_params: Arc<OrbParams>,
    shared: Arc<SharedContext>,
    tracker: Tracker,
    extractor: Box<dyn FeatureExtractor>,
    next_frame_id: u64,
    mapping_handle: Option<JoinHandle<()>>,
    global_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Build the system and spawn the mapping and global-optimization
    /// threads. Configuration errors are fatal here and nowhere else.
    pub fn new(
        config: Config,
        vocabulary: Arc<Vocabulary>,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self> {
        config.validate()?;
        let camera = Arc::new(Camera::from_config(&config.camera)?);
        let orb_params = Arc::new(OrbParams::from_config(&config.feature));
        let shared = SharedContext::new(vocabulary);

        let (kf_sender, kf_receiver) = unbounded();
        let (global_sender, global_receiver) = unbounded();

        let mapping_handle = {
            let shared = Arc::clone(&shared);
            let mapping_config = config.mapping.clone();
            let setup = config.camera.setup;
            thread::Builder::new()
                .name("mapping".into())
                .spawn(move || {
                    MappingModule::new(mapping_config, setup, global_sender)
                        .run(kf_receiver, shared)
                })
                .expect("spawn mapping thread")
        };
        let global_handle = {
            let shared = Arc::clone(&shared);
            let setup = config.camera.setup;
            thread::Builder::new()
                .name("global-optimization".into())
                .spawn(move || {
                    GlobalOptimizationModule::new(setup).run(global_receiver, shared)
                })
                .expect("spawn global optimization thread")
        };

        let tracker = Tracker::new(config.tracking.clone(), config.camera.fps, kf_sender);
        info!(setup = ?config.camera.setup, "slam system started");

        Ok(Self {
            camera,
            orb_params,
            shared,
            tracker,
            extractor,
            next_frame_id: 0,
            mapping_handle: Some(mapping_handle),
            global_handle: Some(global_handle),
        })
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn shared_context(&self) -> &Arc<SharedContext> {
        &self.shared
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame input
    // ─────────────────────────────────────────────────────────────────────

    pub fn feed_monocular_frame(
        &mut self,
        image: &Image,
        timestamp: f64,
        mask: Option<&Image>,
    ) -> Result<TrackingOutcome> {
        self.check_setup(SetupType::Monocular)?;
        image.check(self.camera.cols, self.camera.rows)?;
        let features = self.extractor.extract(image, timestamp, mask)?;
        let frame = self.make_frame(timestamp, features);
        Ok(self.tracker.process_frame(frame, &self.shared))
    }

    pub fn feed_stereo_frame(
        &mut self,
        left: &Image,
        right: &Image,
        timestamp: f64,
        mask: Option<&Image>,
    ) -> Result<TrackingOutcome> {
        self.check_setup(SetupType::Stereo)?;
        left.check(self.camera.cols, self.camera.rows)?;
        right.check(self.camera.cols, self.camera.rows)?;

        let left_features = self.extractor.extract(left, timestamp, mask)?;
        let right_features = self.extractor.extract_right(right, timestamp, mask)?;
        let stereo = match_stereo(&left_features, &right_features, &self.camera, &self.orb_params);

        let mut frame = self.make_frame(timestamp, left_features);
        frame.set_stereo_data(stereo.x_right, stereo.depths);
        Ok(self.tracker.process_frame(frame, &self.shared))
    }

    pub fn feed_rgbd_frame(
        &mut self,
        image: &Image,
        depthmap: &DepthImage,
        timestamp: f64,
        mask: Option<&Image>,
    ) -> Result<TrackingOutcome> {
        self.check_setup(SetupType::RgbD)?;
        image.check(self.camera.cols, self.camera.rows)?;
        if depthmap.is_empty() {
            return Err(Error::InputInvalid("empty depth map".into()));
        }

        let features = self.extractor.extract(image, timestamp, mask)?;
        let mut frame = self.make_frame(timestamp, features);
        let mut depths = vec![None; frame.num_keypoints()];
        let mut x_right = vec![None; frame.num_keypoints()];
        for (idx, kp) in frame.keypoints.iter().enumerate() {
            if let Some(depth) = depthmap.depth_at(kp.x, kp.y) {
                depths[idx] = Some(depth);
                x_right[idx] = self.camera.right_x_from_depth(kp.x, depth);
            }
        }
        frame.set_stereo_data(x_right, depths);
        Ok(self.tracker.process_frame(frame, &self.shared))
    }

    fn make_frame(&mut self, timestamp: f64, features: crate::feature::Features) -> Frame {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        Frame::new(
            id,
            timestamp,
            Arc::clone(&self.camera),
            Arc::clone(&self.orb_params),
            features,
        )
    }

    fn check_setup(&self, expected: SetupType) -> Result<()> {
        if self.camera.setup != expected {
            return Err(Error::InputInvalid(format!(
                "camera is configured as {:?}, got a {:?} frame",
                self.camera.setup, expected
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Pause the background stages. The returned channel fulfills once both
    /// have parked with all locks released.
    pub fn request_pause(&self) -> Receiver<()> {
        let mapping = self.shared.mapping_lifecycle.async_pause();
        let global = self.shared.global_lifecycle.async_pause();
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = mapping.recv();
            let _ = global.recv();
            let _ = tx.send(());
        });
        rx
    }

    pub fn resume(&self) {
        self.shared.mapping_lifecycle.resume();
        self.shared.global_lifecycle.resume();
    }

    /// Reset the whole system: tracker re-enters `Initializing`, the stages
    /// drain their queues, and the databases are cleared. Fulfills once no
    /// effect of any previously fed frame remains.
    pub fn request_reset(&mut self) -> Receiver<()> {
        self.tracker.reset();
        let mapping = self.shared.mapping_lifecycle.async_reset();
        let global = self.shared.global_lifecycle.async_reset();
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = mapping.recv();
            let _ = global.recv();
            shared.map.write().clear();
            shared.bow_db.lock().clear();
            shared.clear_abort_local_ba();
            info!("system reset");
            let _ = tx.send(());
        });
        rx
    }

    /// Terminate both stages and join their threads.
    pub fn request_terminate(&mut self) -> Receiver<()> {
        let mapping_done = self.shared.mapping_lifecycle.async_terminate();
        let global_done = self.shared.global_lifecycle.async_terminate();
        // Wake a possibly paused stage so it can observe the request.
        self.shared.mapping_lifecycle.resume();
        self.shared.global_lifecycle.resume();

        let mapping_handle = self.mapping_handle.take();
        let global_handle = self.global_handle.take();
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = mapping_done.recv();
            let _ = global_done.recv();
            if let Some(handle) = mapping_handle {
                let _ = handle.join();
            }
            if let Some(handle) = global_handle {
                let _ = handle.join();
            }
            let _ = tx.send(());
        });
        rx
    }

    /// Localization-only mode: track against the frozen map, never create
    /// keyframes.
    pub fn disable_mapping(&self) {
        self.shared.set_mapping_enabled(false);
    }

    pub fn enable_mapping(&self) {
        self.shared.set_mapping_enabled(true);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence / output
    // ─────────────────────────────────────────────────────────────────────

    pub fn save_map<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let doc = {
            let map = self.shared.map.read();
            map_io::to_json(&map)
        };
        std::fs::write(path, serde_json::to_string(&doc)?)?;
        Ok(())
    }

    /// Load a previously saved map. Tracking drops to `Lost` and relocalizes
    /// against the loaded map on the next frame.
    pub fn load_map<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        let loaded = map_io::from_json(&doc, &self.shared.vocabulary)?;

        {
            let mut bow_db = self.shared.bow_db.lock();
            bow_db.clear();
            for kf_id in loaded.keyframe_ids() {
                if let Some(bow) = loaded.keyframe(kf_id).and_then(|kf| kf.bow.as_ref()) {
                    bow_db.add(kf_id, bow);
                }
            }
        }
        *self.shared.map.write() = loaded;
        self.tracker.reset();
        self.tracker.begin_relocalization();
        info!("map loaded");
        Ok(())
    }

    /// The per-frame trajectory recovered through the reference keyframes.
    pub fn get_trajectory(&self) -> Vec<TrajectoryEntry> {
        self.shared.map.read().get_trajectory()
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        if self.mapping_handle.is_some() || self.global_handle.is_some() {
            let done = self.request_terminate();
            let _ = done.recv_timeout(std::time::Duration::from_secs(5));
        }
    }
}
