//! Error taxonomy for the SLAM engine.
//!
//! Only genuinely exceptional conditions are errors. Track loss, rejected
//! loop candidates, diverged optimizations and cancelled work are ordinary
//! outcomes and are modeled as state tags / outcome enums where they occur.

use thiserror::Error;

/// Fatal and per-frame error conditions surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (unknown camera model, bad numeric range).
    /// Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Invalid input frame (empty image, size mismatch). The frame is
    /// rejected and the pipeline state is preserved.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// A map invariant was found broken while loading a serialized map.
    /// Fatal.
    #[error("map corruption: {0}")]
    MapCorruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
