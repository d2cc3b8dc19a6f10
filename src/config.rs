//! Engine configuration.
//!
//! Mirrors the flat-key YAML layout of the reference configuration files
//! (`Camera.fx`, `Feature.num_levels`, ...). All sections have defaults so a
//! config can be built programmatically; `validate()` enforces the numeric
//! ranges and is run once at system startup.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Camera setup: which inputs each frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupType {
    Monocular,
    Stereo,
    #[serde(rename = "RGBD")]
    RgbD,
}

impl SetupType {
    /// Depth is directly observable (stereo disparity or a depth channel).
    pub fn has_depth(&self) -> bool {
        !matches!(self, SetupType::Monocular)
    }
}

/// Camera model selector, matching the `Camera.model` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraModelType {
    Perspective,
    Fisheye,
    Equirectangular,
    RadialDivision,
}

/// `Camera.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(rename = "Camera.name", default)]
    pub name: String,
    #[serde(rename = "Camera.model", default = "defaults::camera_model")]
    pub model: CameraModelType,
    #[serde(rename = "Camera.setup", default = "defaults::setup")]
    pub setup: SetupType,
    #[serde(rename = "Camera.color_order", default = "defaults::color_order")]
    pub color_order: String,
    #[serde(rename = "Camera.cols")]
    pub cols: u32,
    #[serde(rename = "Camera.rows")]
    pub rows: u32,
    #[serde(rename = "Camera.fps", default = "defaults::fps")]
    pub fps: f64,
    #[serde(rename = "Camera.fx", default)]
    pub fx: f64,
    #[serde(rename = "Camera.fy", default)]
    pub fy: f64,
    #[serde(rename = "Camera.cx", default)]
    pub cx: f64,
    #[serde(rename = "Camera.cy", default)]
    pub cy: f64,
    /// fx × stereo baseline; zero for monocular.
    #[serde(rename = "Camera.focal_x_baseline", default)]
    pub focal_x_baseline: f64,
    /// Depth beyond `depth_threshold × baseline` is treated as unreliable.
    #[serde(rename = "Camera.depth_threshold", default = "defaults::depth_thr")]
    pub depth_threshold: f64,
    #[serde(rename = "Camera.k1", default)]
    pub k1: f64,
    #[serde(rename = "Camera.k2", default)]
    pub k2: f64,
    #[serde(rename = "Camera.p1", default)]
    pub p1: f64,
    #[serde(rename = "Camera.p2", default)]
    pub p2: f64,
    #[serde(rename = "Camera.k3", default)]
    pub k3: f64,
    /// Distortion parameter of the radial-division model.
    #[serde(rename = "Camera.distortion", default)]
    pub distortion: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            model: CameraModelType::Perspective,
            setup: SetupType::Monocular,
            color_order: defaults::color_order(),
            cols: 640,
            rows: 480,
            fps: defaults::fps(),
            fx: 0.0,
            fy: 0.0,
            cx: 0.0,
            cy: 0.0,
            focal_x_baseline: 0.0,
            depth_threshold: defaults::depth_thr(),
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            distortion: 0.0,
        }
    }
}

/// `Feature.*` keys (ORB extraction parameters; the extractor itself is
/// external but its pyramid geometry is shared with matchers/optimizers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(rename = "Feature.max_num_keypoints", default = "defaults::max_kp")]
    pub max_num_keypoints: u32,
    #[serde(rename = "Feature.scale_factor", default = "defaults::scale_factor")]
    pub scale_factor: f64,
    #[serde(rename = "Feature.num_levels", default = "defaults::num_levels")]
    pub num_levels: u32,
    #[serde(rename = "Feature.ini_fast_thr", default = "defaults::ini_fast")]
    pub ini_fast_thr: u32,
    #[serde(rename = "Feature.min_fast_thr", default = "defaults::min_fast")]
    pub min_fast_thr: u32,
    /// Rectangles (normalized `[x_min, x_max, y_min, y_max]`) masked out of
    /// extraction.
    #[serde(rename = "Feature.mask_rectangles", default)]
    pub mask_rectangles: Vec<[f64; 4]>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_num_keypoints: defaults::max_kp(),
            scale_factor: defaults::scale_factor(),
            num_levels: defaults::num_levels(),
            ini_fast_thr: defaults::ini_fast(),
            min_fast_thr: defaults::min_fast(),
            mask_rectangles: Vec::new(),
        }
    }
}

/// `Tracking.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(rename = "Tracking.reloc.bow_match_lowe_ratio", default = "defaults::reloc_bow_ratio")]
    pub reloc_bow_match_lowe_ratio: f64,
    #[serde(rename = "Tracking.reloc.proj_match_lowe_ratio", default = "defaults::reloc_proj_ratio")]
    pub reloc_proj_match_lowe_ratio: f64,
    #[serde(rename = "Tracking.reloc.robust_match_lowe_ratio", default = "defaults::reloc_robust_ratio")]
    pub reloc_robust_match_lowe_ratio: f64,
    #[serde(rename = "Tracking.reloc.min_num_bow_matches", default = "defaults::reloc_min_bow")]
    pub reloc_min_num_bow_matches: usize,
    #[serde(rename = "Tracking.reloc.min_num_valid_obs", default = "defaults::reloc_min_obs")]
    pub reloc_min_num_valid_obs: usize,
    /// Tracking drops to `Lost` below this many pose-optimization inliers.
    #[serde(rename = "Tracking.min_num_inliers", default = "defaults::min_inliers")]
    pub min_num_inliers: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            reloc_bow_match_lowe_ratio: defaults::reloc_bow_ratio(),
            reloc_proj_match_lowe_ratio: defaults::reloc_proj_ratio(),
            reloc_robust_match_lowe_ratio: defaults::reloc_robust_ratio(),
            reloc_min_num_bow_matches: defaults::reloc_min_bow(),
            reloc_min_num_valid_obs: defaults::reloc_min_obs(),
            min_num_inliers: defaults::min_inliers(),
        }
    }
}

/// `Mapping.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(rename = "Mapping.baseline_dist_thr_ratio", default = "defaults::baseline_ratio")]
    pub baseline_dist_thr_ratio: f64,
    #[serde(rename = "Mapping.baseline_dist_thr", default = "defaults::baseline_thr")]
    pub baseline_dist_thr: f64,
    #[serde(rename = "Mapping.use_baseline_dist_thr_ratio", default = "defaults::use_ratio")]
    pub use_baseline_dist_thr_ratio: bool,
    /// Local BA is skipped while the keyframe queue is deeper than this.
    #[serde(rename = "Mapping.queue_threshold", default = "defaults::queue_thr")]
    pub queue_threshold: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            baseline_dist_thr_ratio: defaults::baseline_ratio(),
            baseline_dist_thr: defaults::baseline_thr(),
            use_baseline_dist_thr_ratio: defaults::use_ratio(),
            queue_threshold: defaults::queue_thr(),
        }
    }
}

/// `Marker.*` keys. Marker detection itself is an external collaborator;
/// the keys are parsed so configs carrying them round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(rename = "Marker.dict", default)]
    pub dict: Option<String>,
    /// Physical marker edge length in meters.
    #[serde(rename = "Marker.size", default)]
    pub size: Option<f64>,
    #[serde(rename = "Marker.max_markers", default)]
    pub max_markers: Option<u32>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub camera: CameraConfig,
    #[serde(flatten)]
    pub feature: FeatureConfig,
    #[serde(flatten)]
    pub tracking: TrackingConfig,
    #[serde(flatten)]
    pub mapping: MappingConfig,
    #[serde(flatten)]
    pub marker: MarkerConfig,
}

impl Config {
    /// Parse from the flat-key YAML layout.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Enforce numeric ranges. Run once at startup; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        let c = &self.camera;
        if c.cols == 0 || c.rows == 0 {
            return Err(Error::ConfigInvalid(format!(
                "image size {}x{} must be non-zero",
                c.cols, c.rows
            )));
        }
        if c.fps <= 0.0 {
            return Err(Error::ConfigInvalid(format!("fps {} must be positive", c.fps)));
        }
        if c.model != CameraModelType::Equirectangular && (c.fx <= 0.0 || c.fy <= 0.0) {
            return Err(Error::ConfigInvalid(format!(
                "focal length ({}, {}) must be positive",
                c.fx, c.fy
            )));
        }
        if c.setup != SetupType::Monocular && c.focal_x_baseline <= 0.0 {
            return Err(Error::ConfigInvalid(
                "focal_x_baseline must be positive for stereo/RGBD setups".into(),
            ));
        }
        if c.setup != SetupType::Monocular && c.model == CameraModelType::Equirectangular {
            return Err(Error::ConfigInvalid(
                "equirectangular cameras support monocular setup only".into(),
            ));
        }
        let f = &self.feature;
        if f.scale_factor <= 1.0 {
            return Err(Error::ConfigInvalid(format!(
                "scale_factor {} must be greater than 1.0",
                f.scale_factor
            )));
        }
        if f.num_levels == 0 {
            return Err(Error::ConfigInvalid("num_levels must be at least 1".into()));
        }
        for r in &f.mask_rectangles {
            if r.iter().any(|v| !(0.0..=1.0).contains(v)) || r[0] >= r[1] || r[2] >= r[3] {
                return Err(Error::ConfigInvalid(format!("bad mask rectangle {:?}", r)));
            }
        }
        for (name, ratio) in [
            ("bow", self.tracking.reloc_bow_match_lowe_ratio),
            ("proj", self.tracking.reloc_proj_match_lowe_ratio),
            ("robust", self.tracking.reloc_robust_match_lowe_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::ConfigInvalid(format!(
                    "{} lowe ratio {} outside [0, 1]",
                    name, ratio
                )));
            }
        }
        if self.mapping.baseline_dist_thr_ratio <= 0.0 || self.mapping.baseline_dist_thr <= 0.0 {
            return Err(Error::ConfigInvalid("baseline thresholds must be positive".into()));
        }
        Ok(())
    }
}

mod defaults {
    use super::{CameraModelType, SetupType};

    pub fn camera_model() -> CameraModelType {
        CameraModelType::Perspective
    }
    pub fn setup() -> SetupType {
        SetupType::Monocular
    }
    pub fn color_order() -> String {
        "Gray".into()
    }
    pub fn fps() -> f64 {
        30.0
    }
    pub fn depth_thr() -> f64 {
        40.0
    }
    pub fn max_kp() -> u32 {
        2000
    }
    pub fn scale_factor() -> f64 {
        1.2
    }
    pub fn num_levels() -> u32 {
        8
    }
    pub fn ini_fast() -> u32 {
        20
    }
    pub fn min_fast() -> u32 {
        7
    }
    pub fn reloc_bow_ratio() -> f64 {
        0.75
    }
    pub fn reloc_proj_ratio() -> f64 {
        0.9
    }
    pub fn reloc_robust_ratio() -> f64 {
        0.8
    }
    pub fn reloc_min_bow() -> usize {
        20
    }
    pub fn reloc_min_obs() -> usize {
        50
    }
    pub fn min_inliers() -> usize {
        10
    }
    pub fn baseline_ratio() -> f64 {
        0.02
    }
    pub fn baseline_thr() -> f64 {
        1.0
    }
    pub fn use_ratio() -> bool {
        true
    }
    pub fn queue_thr() -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut cfg = Config::default();
        cfg.camera.fx = 500.0;
        cfg.camera.fy = 500.0;
        cfg.camera.cx = 320.0;
        cfg.camera.cy = 240.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_flat_keys() {
        let yaml = r#"
"Camera.name": "test cam"
"Camera.setup": "Stereo"
"Camera.cols": 752
"Camera.rows": 480
"Camera.fx": 458.0
"Camera.fy": 457.2
"Camera.cx": 367.2
"Camera.cy": 248.4
"Camera.focal_x_baseline": 45.8
"Feature.num_levels": 8
"Mapping.queue_threshold": 2
"#;
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.camera.setup, SetupType::Stereo);
        assert_eq!(cfg.camera.cols, 752);
        assert!((cfg.camera.focal_x_baseline - 45.8).abs() < 1e-12);
        assert_eq!(cfg.feature.num_levels, 8);
        assert_eq!(cfg.tracking.reloc_min_num_valid_obs, 50);
    }

    #[test]
    fn test_bad_scale_factor_rejected() {
        let mut cfg = Config::default();
        cfg.camera.fx = 500.0;
        cfg.camera.fy = 500.0;
        cfg.feature.scale_factor = 0.9;
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_stereo_requires_baseline() {
        let mut cfg = Config::default();
        cfg.camera.fx = 500.0;
        cfg.camera.fy = 500.0;
        cfg.camera.setup = SetupType::Stereo;
        cfg.camera.focal_x_baseline = 0.0;
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid(_))));
    }
}
