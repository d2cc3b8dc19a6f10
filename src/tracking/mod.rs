//! Tracking: per-frame pose estimation.

pub mod keyframe_inserter;
pub mod local_map;
pub mod relocalizer;
mod tracker;

pub use tracker::{Tracker, TrackingOutcome};

/// Tracking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Waiting for a successful map bootstrap.
    #[default]
    Initializing,
    /// Pose estimated against the map every frame.
    Tracking,
    /// Track lost; relocalization runs on each new frame.
    Lost,
}
