//! Shared test fixtures: a synthetic 3D world rendered through the
//! feature-extractor interface, so the full pipeline runs on the public API.
#![allow(dead_code)]

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use orb_vslam::config::{Config, SetupType};
use orb_vslam::error::Result;
use orb_vslam::feature::{Descriptor, FeatureExtractor, Features, Image, KeyPoint};
use orb_vslam::geometry::SE3;

pub const IMAGE_COLS: u32 = 640;
pub const IMAGE_ROWS: u32 = 480;
pub const FX: f64 = 500.0;
pub const CX: f64 = 320.0;
pub const CY: f64 = 240.0;
pub const BASELINE: f64 = 0.1;

/// A static point cloud with one stable descriptor per point.
pub struct SyntheticWorld {
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl SyntheticWorld {
    /// A grid of points in front of the trajectory.
    ///
    /// X spans `[x_min, x_max]`, Y spans ±0.9, depth alternates between 2.0
    /// and 3.4 so stereo depth stays inside the reliable range.
    pub fn grid(x_min: f64, x_max: f64, x_step: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(99);
        let mut points = Vec::new();
        let mut x = x_min;
        while x <= x_max {
            for row in 0..7 {
                let y = -0.9 + 0.3 * row as f64;
                let z = 2.0 + ((row + points.len()) % 4) as f64 * 0.35;
                points.push(Vector3::new(x, y, z));
            }
            x += x_step;
        }
        let descriptors = points
            .iter()
            .map(|_| {
                let mut d = Descriptor::ZERO;
                for byte in d.0.iter_mut() {
                    *byte = rng.gen();
                }
                d
            })
            .collect();
        Self { points, descriptors }
    }

    /// Project the world into a camera at `pose_cw`.
    pub fn render(&self, pose_cw: &SE3) -> Features {
        let mut features = Features::default();
        for (point, descriptor) in self.points.iter().zip(self.descriptors.iter()) {
            let p_cam = pose_cw.transform_point(point);
            if p_cam.z <= 0.2 {
                continue;
            }
            let u = FX * p_cam.x / p_cam.z + CX;
            let v = FX * p_cam.y / p_cam.z + CY;
            if u < 0.0 || u >= IMAGE_COLS as f64 || v < 0.0 || v >= IMAGE_ROWS as f64 {
                continue;
            }
            let mut kp = KeyPoint::new(u, v, 0);
            kp.angle = 0.0;
            features.keypoints.push(kp);
            features.descriptors.push(*descriptor);
        }
        features
    }
}

/// Feature "extractor" that renders the synthetic world for the camera pose
/// its trajectory assigns to the frame timestamp. An all-black image yields
/// no features (sensor blackout).
pub struct SyntheticExtractor {
    world: Arc<SyntheticWorld>,
    trajectory: Box<dyn Fn(f64) -> SE3 + Send>,
}

impl SyntheticExtractor {
    pub fn new(world: Arc<SyntheticWorld>, trajectory: impl Fn(f64) -> SE3 + Send + 'static) -> Self {
        Self {
            world,
            trajectory: Box::new(trajectory),
        }
    }
}

impl FeatureExtractor for SyntheticExtractor {
    fn extract(&mut self, image: &Image, timestamp: f64, _mask: Option<&Image>) -> Result<Features> {
        if image.data.iter().all(|&b| b == 0) {
            return Ok(Features::default());
        }
        Ok(self.world.render(&(self.trajectory)(timestamp)))
    }

    fn extract_right(
        &mut self,
        image: &Image,
        timestamp: f64,
        _mask: Option<&Image>,
    ) -> Result<Features> {
        if image.data.iter().all(|&b| b == 0) {
            return Ok(Features::default());
        }
        // Right camera: displaced by the baseline along the camera x-axis.
        let left = (self.trajectory)(timestamp);
        let offset = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(-BASELINE, 0.0, 0.0),
        );
        Ok(self.world.render(&offset.compose(&left)))
    }
}

pub fn stereo_config() -> Config {
    let mut config = Config::default();
    config.camera.name = "synthetic".into();
    config.camera.setup = SetupType::Stereo;
    config.camera.cols = IMAGE_COLS;
    config.camera.rows = IMAGE_ROWS;
    config.camera.fx = FX;
    config.camera.fy = FX;
    config.camera.cx = CX;
    config.camera.cy = CY;
    config.camera.focal_x_baseline = FX * BASELINE;
    config
}

pub fn mono_config() -> Config {
    let mut config = stereo_config();
    config.camera.setup = SetupType::Monocular;
    config.camera.focal_x_baseline = 0.0;
    config
}

pub fn gray_image() -> Image {
    Image::new(
        IMAGE_COLS,
        IMAGE_ROWS,
        vec![128; (IMAGE_COLS * IMAGE_ROWS) as usize],
    )
}

pub fn black_image() -> Image {
    Image::new(IMAGE_COLS, IMAGE_ROWS, vec![0; (IMAGE_COLS * IMAGE_ROWS) as usize])
}

/// `T_cw` for a camera whose center sits at `center` looking down +Z.
pub fn pose_at(center: Vector3<f64>) -> SE3 {
    SE3::new(nalgebra::UnitQuaternion::identity(), -center)
}
