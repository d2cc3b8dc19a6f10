//! Mapping stage: single-threaded consumer of the keyframe queue.
//!
//! Per dequeued keyframe: store (covisibility + spanning tree), cull recent
//! landmarks, triangulate with covisible neighbors, fuse duplicates across
//! the first- and second-order neighborhood, refresh connections, run local
//! BA when the queue is shallow, cull redundant keyframes, and forward the
//! keyframe to the global-optimization queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::config::{MappingConfig, SetupType};
use crate::map::{KeyframeId, LandmarkId};
use crate::matcher::fuse;
use crate::optimize::{apply_ba_results, collect_local_ba, solve_ba};
use crate::system::lifecycle::LoopCommand;
use crate::system::SharedContext;

use super::cleaner;
use super::triangulator;

/// Dequeue timeout so lifecycle requests are observed while idle.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);
/// Fusion projection margin.
const FUSE_MARGIN: f64 = 3.0;
/// First-order neighbors considered for fusion.
const FUSE_FIRST_ORDER: usize = 10;
/// Second-order neighbors per first-order keyframe.
const FUSE_SECOND_ORDER: usize = 5;

pub struct MappingModule {
    config: MappingConfig,
    setup: SetupType,
    global_sender: Sender<KeyframeId>,
}

impl MappingModule {
    pub fn new(config: MappingConfig, setup: SetupType, global_sender: Sender<KeyframeId>) -> Self {
        Self {
            config,
            setup,
            global_sender,
        }
    }

    /// The stage loop. Suspends only at the queue dequeue, the lifecycle
    /// checks, and database-lock acquisition.
    pub fn run(&mut self, receiver: Receiver<KeyframeId>, shared: Arc<SharedContext>) {
        info!("mapping stage started");
        loop {
            match shared.mapping_lifecycle.poll() {
                LoopCommand::Terminate => break,
                LoopCommand::Reset => {
                    while receiver.try_recv().is_ok() {}
                    shared.set_mapper_idle(true);
                    shared.mapping_lifecycle.acknowledge_reset();
                    continue;
                }
                LoopCommand::Pause => {
                    shared.set_mapper_idle(true);
                    shared.mapping_lifecycle.acknowledge_pause();
                    continue;
                }
                LoopCommand::Continue => {}
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    shared.set_mapper_idle(false);
                    shared.clear_abort_local_ba();
                    self.process_keyframe(kf_id, &receiver, &shared);
                    shared.set_mapper_idle(true);
                    let _ = self.global_sender.send(kf_id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        shared.set_mapper_idle(true);
        shared.mapping_lifecycle.acknowledge_terminate();
        info!("mapping stage terminated");
    }

    fn process_keyframe(
        &mut self,
        kf_id: KeyframeId,
        receiver: &Receiver<KeyframeId>,
        shared: &Arc<SharedContext>,
    ) {
        debug!(keyframe = %kf_id, "mapping keyframe");

        // Store: covisibility weights and spanning-tree attachment. The
        // keyframe's BoW vector and landmark associations were written by
        // tracking at creation time.
        {
            let mut map = shared.map.write();
            if map.keyframe(kf_id).is_none() {
                return;
            }
            map.update_connections(kf_id);
        }

        // Cull recent landmarks.
        {
            let mut map = shared.map.write();
            cleaner::cull_landmarks(&mut map, kf_id, self.setup);
        }

        // Triangulate new landmarks with covisible neighbors.
        {
            let mut map = shared.map.write();
            triangulator::create_new_landmarks(&mut map, kf_id, &self.config);
        }

        // Fuse duplicates across the neighborhood, both directions.
        self.fuse_neighborhood(kf_id, shared);

        // Refresh connections after fusion.
        {
            let mut map = shared.map.write();
            map.update_connections(kf_id);
        }

        // Local BA when the queue is shallow and nobody asked us to skip.
        if receiver.len() <= self.config.queue_threshold && !shared.local_ba_abort_requested() {
            self.local_bundle_adjustment(kf_id, shared);
        } else {
            debug!(keyframe = %kf_id, queue = receiver.len(), "skipping local BA");
        }

        // Cull redundant keyframes among the neighbors.
        {
            let mut map = shared.map.write();
            let mut bow_db = shared.bow_db.lock();
            cleaner::cull_keyframes(&mut map, &mut bow_db, kf_id);
        }
    }

    /// True when the queue is deep enough that local BA would be skipped.
    pub fn is_skipping_local_ba(queue_len: usize, config: &MappingConfig) -> bool {
        queue_len > config.queue_threshold
    }

    fn fuse_neighborhood(&self, kf_id: KeyframeId, shared: &Arc<SharedContext>) {
        // Targets: first- and second-order covisibility neighbors.
        let (targets, own_landmarks) = {
            let mut map = shared.map.write();
            let first_order = match map.keyframe_mut(kf_id) {
                Some(kf) => kf.top_covisibilities(FUSE_FIRST_ORDER),
                None => return,
            };
            let mut targets: Vec<KeyframeId> = Vec::new();
            let mut seen: HashSet<KeyframeId> = HashSet::new();
            seen.insert(kf_id);
            for &neighbor in &first_order {
                if seen.insert(neighbor) {
                    targets.push(neighbor);
                }
                let second_order = match map.keyframe_mut(neighbor) {
                    Some(kf) => kf.top_covisibilities(FUSE_SECOND_ORDER),
                    None => continue,
                };
                for second in second_order {
                    if seen.insert(second) {
                        targets.push(second);
                    }
                }
            }
            let own: Vec<LandmarkId> = map
                .keyframe(kf_id)
                .map(|kf| kf.landmark_associations().map(|(_, lm)| lm).collect())
                .unwrap_or_default();
            (targets, own)
        };

        let mut num_fused = 0;
        let mut num_added = 0;

        // Current keyframe's landmarks into each neighbor.
        for &target in &targets {
            let mut map = shared.map.write();
            let result = fuse::replace_or_add(target, &own_landmarks, &mut map, FUSE_MARGIN);
            num_fused += result.num_fused;
            num_added += result.num_added;
        }

        // Neighbors' landmarks into the current keyframe.
        let neighbor_landmarks: Vec<LandmarkId> = {
            let map = shared.map.read();
            let mut set: HashSet<LandmarkId> = HashSet::new();
            for &target in &targets {
                if let Some(kf) = map.keyframe(target) {
                    for (_, lm) in kf.landmark_associations() {
                        set.insert(lm);
                    }
                }
            }
            let mut v: Vec<LandmarkId> = set.into_iter().collect();
            v.sort();
            v
        };
        {
            let mut map = shared.map.write();
            let result = fuse::replace_or_add(kf_id, &neighbor_landmarks, &mut map, FUSE_MARGIN);
            num_fused += result.num_fused;
            num_added += result.num_added;
        }

        if num_fused > 0 || num_added > 0 {
            debug!(keyframe = %kf_id, num_fused, num_added, "fused neighborhood landmarks");
        }
    }

    /// Three-phase local BA with the abort flag and lifecycle polled during
    /// the solve.
    fn local_bundle_adjustment(&self, kf_id: KeyframeId, shared: &Arc<SharedContext>) {
        let problem = {
            let map = shared.map.read();
            if map.num_keyframes() < 3 {
                return;
            }
            match collect_local_ba(&map, kf_id) {
                Some(problem) => problem,
                None => return,
            }
        };

        let should_abort = || {
            shared.local_ba_abort_requested()
                || shared.mapping_lifecycle.poll() != LoopCommand::Continue
        };
        let Some(result) = solve_ba(&problem, &should_abort) else {
            debug!(keyframe = %kf_id, "local BA yielded no completed iteration");
            return;
        };
        if result.aborted {
            // An aborted run is discarded wholesale; the next keyframe's BA
            // will redo the work on fresher data.
            debug!(keyframe = %kf_id, "local BA aborted, discarding result");
            return;
        }

        {
            let mut map = shared.map.write();
            apply_ba_results(&mut map, &result);
        }
        debug!(
            keyframe = %kf_id,
            iterations = result.iterations,
            initial_error = result.initial_error,
            final_error = result.final_error,
            "local BA"
        );
    }
}
