//! Global-optimization stage: single-threaded consumer of the mapping
//! queue, plus the asynchronous global-BA helper task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::config::SetupType;
use crate::map::KeyframeId;
use crate::optimize::{collect_global_ba, solve_global_ba};
use crate::system::lifecycle::LoopCommand;
use crate::system::SharedContext;

use super::corrector::{apply_global_ba, correct_loop, verify_candidate};
use super::detector::{LoopDetector, LoopDetectorConfig};

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Running asynchronous global BA, tagged by the loop keyframe.
struct RunningGba {
    tag: KeyframeId,
    abort: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct GlobalOptimizationModule {
    detector: LoopDetector,
    fix_scale: bool,
    gba: Option<RunningGba>,
}

impl GlobalOptimizationModule {
    pub fn new(setup: SetupType) -> Self {
        Self {
            detector: LoopDetector::new(LoopDetectorConfig::default()),
            // Monocular drift includes scale; stereo/RGB-D observe it.
            fix_scale: setup.has_depth(),
            gba: None,
        }
    }

    pub fn run(&mut self, receiver: Receiver<KeyframeId>, shared: Arc<SharedContext>) {
        info!("global optimization stage started");
        loop {
            match shared.global_lifecycle.poll() {
                LoopCommand::Terminate => break,
                LoopCommand::Reset => {
                    while receiver.try_recv().is_ok() {}
                    self.detector.clear();
                    self.cancel_global_ba(&shared);
                    shared.global_lifecycle.acknowledge_reset();
                    continue;
                }
                LoopCommand::Pause => {
                    shared.global_lifecycle.acknowledge_pause();
                    continue;
                }
                LoopCommand::Continue => {}
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => self.process_keyframe(kf_id, &shared),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.cancel_global_ba(&shared);
        shared.global_lifecycle.acknowledge_terminate();
        info!("global optimization stage terminated");
    }

    fn process_keyframe(&mut self, kf_id: KeyframeId, shared: &Arc<SharedContext>) {
        self.reap_finished_gba();

        let candidate = {
            let map = shared.map.read();
            let bow_db = shared.bow_db.lock();
            self.detector.detect(kf_id, &map, &bow_db)
        };
        let Some(candidate) = candidate else {
            return;
        };

        let verified = {
            let map = shared.map.read();
            verify_candidate(kf_id, candidate, &map, self.fix_scale)
        };
        let Some(verified) = verified else {
            return;
        };

        // A newer loop supersedes a running global BA.
        self.cancel_global_ba(shared);

        if correct_loop(&verified, shared, self.fix_scale) {
            self.launch_global_ba(kf_id, shared);
        }
    }

    /// Spawn the asynchronous global BA tagged with the keyframe that
    /// triggered it.
    fn launch_global_ba(&mut self, tag: KeyframeId, shared: &Arc<SharedContext>) {
        let abort = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(shared);
        let abort_flag = Arc::clone(&abort);

        shared.global_ba_running.store(true, Ordering::SeqCst);
        let handle = std::thread::spawn(move || {
            debug!(tag = %tag, "global BA started");
            let problem = {
                let map = shared.map.read();
                collect_global_ba(&map)
            };
            if let Some(problem) = problem {
                let should_abort = || abort_flag.load(Ordering::SeqCst);
                if let Some(result) = solve_global_ba(&problem, &should_abort) {
                    // A cancelled run is discarded before any writeback.
                    if !result.aborted && !should_abort() {
                        let mut map = shared.map.write();
                        apply_global_ba(&mut map, &result);
                        debug!(tag = %tag, "global BA applied");
                    } else {
                        debug!(tag = %tag, "global BA cancelled");
                    }
                }
            }
            shared.global_ba_running.store(false, Ordering::SeqCst);
        });

        self.gba = Some(RunningGba { tag, abort, handle });
    }

    fn cancel_global_ba(&mut self, shared: &Arc<SharedContext>) {
        if let Some(gba) = self.gba.take() {
            gba.abort.store(true, Ordering::SeqCst);
            let _ = gba.handle.join();
            shared.global_ba_running.store(false, Ordering::SeqCst);
            debug!(tag = %gba.tag, "global BA cancelled by newer event");
        }
    }

    /// Drop the handle of a GBA that already ran to completion.
    fn reap_finished_gba(&mut self) {
        if let Some(gba) = self.gba.take() {
            if gba.handle.is_finished() {
                let _ = gba.handle.join();
            } else {
                self.gba = Some(gba);
            }
        }
    }
}
