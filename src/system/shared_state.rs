//! State shared by the tracking, mapping and global-optimization stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bow::Vocabulary;
use crate::map::{BowDatabase, MapDatabase};

use super::lifecycle::LifecycleControl;

/// Everything the three stages share.
///
/// The map database sits behind one `RwLock` — the database-wide exclusive
/// lock of the design. The BoW index has its own mutex; lookups copy their
/// candidate lists out before the caller proceeds.
pub struct SharedContext {
    pub map: RwLock<MapDatabase>,
    pub bow_db: Mutex<BowDatabase>,
    pub vocabulary: Arc<Vocabulary>,

    /// Raised by tracking before inserting a keyframe while the mapper is
    /// busy; polled by the running local BA.
    abort_local_ba: AtomicBool,
    /// True while the mapper has no keyframe in flight.
    mapper_idle: AtomicBool,
    /// Cleared in localization-only mode: no keyframes are created.
    mapping_enabled: AtomicBool,
    /// True while an asynchronous global BA is running.
    pub global_ba_running: AtomicBool,

    pub mapping_lifecycle: LifecycleControl,
    pub global_lifecycle: LifecycleControl,
}

impl SharedContext {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(MapDatabase::new()),
            bow_db: Mutex::new(BowDatabase::new()),
            vocabulary,
            abort_local_ba: AtomicBool::new(false),
            mapper_idle: AtomicBool::new(true),
            mapping_enabled: AtomicBool::new(true),
            global_ba_running: AtomicBool::new(false),
            mapping_lifecycle: LifecycleControl::new(),
            global_lifecycle: LifecycleControl::new(),
        })
    }

    pub fn request_abort_local_ba(&self) {
        self.abort_local_ba.store(true, Ordering::SeqCst);
    }

    pub fn local_ba_abort_requested(&self) -> bool {
        self.abort_local_ba.load(Ordering::SeqCst)
    }

    pub fn clear_abort_local_ba(&self) {
        self.abort_local_ba.store(false, Ordering::SeqCst);
    }

    pub fn mapper_is_idle(&self) -> bool {
        self.mapper_idle.load(Ordering::SeqCst)
    }

    pub fn set_mapper_idle(&self, idle: bool) {
        self.mapper_idle.store(idle, Ordering::SeqCst);
    }

    pub fn mapping_is_enabled(&self) -> bool {
        self.mapping_enabled.load(Ordering::SeqCst)
    }

    pub fn set_mapping_enabled(&self, enabled: bool) {
        self.mapping_enabled.store(enabled, Ordering::SeqCst);
    }
}
