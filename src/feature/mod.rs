//! ORB feature primitives.
//!
//! Extraction itself (image pyramid, FAST, BRIEF) lives behind the
//! [`FeatureExtractor`] trait; this module owns the descriptor and keypoint
//! value types plus the scale-pyramid geometry every matcher and optimizer
//! shares.

mod descriptor;
mod extractor;
mod keypoint;

pub use descriptor::{median_descriptor, Descriptor};
pub use extractor::{DepthImage, FeatureExtractor, Features, Image};
pub use keypoint::KeyPoint;

use serde::{Deserialize, Serialize};

use crate::config::FeatureConfig;

/// Scale pyramid geometry of the ORB extractor.
///
/// Precomputes the per-level scale factors and measurement variances the
/// matchers and optimizers read on every observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbParams {
    pub max_num_keypoints: u32,
    pub scale_factor: f64,
    pub num_levels: u32,
    pub ini_fast_thr: u32,
    pub min_fast_thr: u32,
    scale_factors: Vec<f64>,
    inv_scale_factors: Vec<f64>,
    level_sigma_sq: Vec<f64>,
    inv_level_sigma_sq: Vec<f64>,
}

impl OrbParams {
    pub fn new(scale_factor: f64, num_levels: u32) -> Self {
        let n = num_levels as usize;
        let mut scale_factors = Vec::with_capacity(n);
        let mut s = 1.0;
        for _ in 0..n {
            scale_factors.push(s);
            s *= scale_factor;
        }
        let inv_scale_factors: Vec<f64> = scale_factors.iter().map(|s| 1.0 / s).collect();
        let level_sigma_sq: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma_sq: Vec<f64> = level_sigma_sq.iter().map(|s| 1.0 / s).collect();
        Self {
            max_num_keypoints: 2000,
            scale_factor,
            num_levels,
            ini_fast_thr: 20,
            min_fast_thr: 7,
            scale_factors,
            inv_scale_factors,
            level_sigma_sq,
            inv_level_sigma_sq,
        }
    }

    pub fn from_config(cfg: &FeatureConfig) -> Self {
        let mut params = Self::new(cfg.scale_factor, cfg.num_levels);
        params.max_num_keypoints = cfg.max_num_keypoints;
        params.ini_fast_thr = cfg.ini_fast_thr;
        params.min_fast_thr = cfg.min_fast_thr;
        params
    }

    #[inline]
    pub fn scale_factor_at(&self, level: usize) -> f64 {
        self.scale_factors[level.min(self.scale_factors.len() - 1)]
    }

    #[inline]
    pub fn inv_scale_factor_at(&self, level: usize) -> f64 {
        self.inv_scale_factors[level.min(self.inv_scale_factors.len() - 1)]
    }

    #[inline]
    pub fn level_sigma_sq_at(&self, level: usize) -> f64 {
        self.level_sigma_sq[level.min(self.level_sigma_sq.len() - 1)]
    }

    #[inline]
    pub fn inv_level_sigma_sq_at(&self, level: usize) -> f64 {
        self.inv_level_sigma_sq[level.min(self.inv_level_sigma_sq.len() - 1)]
    }

    /// Scale span `scale_factor^(num_levels-1)` used for landmark distance
    /// bounds.
    pub fn scale_range(&self) -> f64 {
        self.scale_factors[self.scale_factors.len() - 1]
    }

    /// Predict the pyramid level a landmark at `distance` would be detected
    /// at, given the maximum distance of its scale-invariance range.
    pub fn predict_scale_level(&self, max_distance: f64, distance: f64) -> usize {
        if distance <= 0.0 || max_distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.scale_factor.ln()).ceil();
        (level.max(0.0) as usize).min(self.num_levels as usize - 1)
    }
}

impl Default for OrbParams {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}
