//! Map bootstrap.
//!
//! Monocular setups need a two-view initialization (parallel homography and
//! essential-matrix hypotheses, model selection by score ratio); stereo and
//! RGB-D setups bootstrap from the depth measurements of a single frame.

pub mod monocular;
pub mod stereo;

pub use monocular::{initialize_two_view, MonocularInitConfig, TwoViewInit};
pub use stereo::bootstrap_from_depth;
