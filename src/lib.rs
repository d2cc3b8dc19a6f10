//! Sparse visual SLAM with ORB features.
//!
//! A three-stage concurrent pipeline over a shared map database:
//! - **tracking** estimates the camera pose of every input frame against a
//!   reference keyframe and the local map,
//! - **mapping** triangulates new landmarks from keyframes, culls redundant
//!   structure and runs local bundle adjustment,
//! - **global optimization** detects loop closures through a BoW index and
//!   corrects drift with Sim(3) pose-graph optimization followed by an
//!   asynchronous global bundle adjustment.
//!
//! Monocular, stereo and RGB-D inputs are supported; the map can be saved as
//! JSON and reloaded for localization-only operation.

pub mod bow;
pub mod camera;
pub mod config;
pub mod error;
pub mod feature;
pub mod geometry;
pub mod global_opt;
pub mod initialize;
pub mod map;
pub mod mapping;
pub mod matcher;
pub mod optimize;
pub mod system;
pub mod tracking;

pub use config::Config;
pub use error::{Error, Result};
pub use system::SlamSystem;
pub use tracking::{TrackingOutcome, TrackingState};
