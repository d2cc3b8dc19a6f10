//! Camera models.
//!
//! The engine consumes camera geometry through three operations: project a
//! camera-frame point to pixel coordinates, lift a pixel to a unit bearing,
//! and query the usable image bounds. The model set is closed, so it is a
//! tagged union rather than a trait object.

use std::f64::consts::PI;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::{CameraConfig, CameraModelType, SetupType};
use crate::error::{Error, Result};

/// Usable pixel-coordinate range of a camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl ImageBounds {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Intrinsics of the closed model set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CameraModel {
    /// Pinhole with radial-tangential distortion (k1, k2, p1, p2, k3).
    Perspective {
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
        k3: f64,
    },
    /// Equidistant fisheye (theta-polynomial k1..k4).
    Fisheye {
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        k3: f64,
        k4: f64,
    },
    /// Full-sphere equirectangular panorama.
    Equirectangular { cols: f64, rows: f64 },
    /// Pinhole with the one-parameter division distortion model.
    RadialDivision {
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortion: f64,
    },
}

/// A camera: model plus frame-level metadata shared by every frame it takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub name: String,
    pub setup: SetupType,
    pub model: CameraModel,
    pub cols: u32,
    pub rows: u32,
    pub fps: f64,
    /// fx × stereo baseline (zero for monocular setups).
    pub focal_x_baseline: f64,
    /// Stereo depth beyond `depth_threshold × baseline` is unreliable.
    pub depth_threshold: f64,
}

impl Camera {
    pub fn from_config(cfg: &CameraConfig) -> Result<Self> {
        let model = match cfg.model {
            CameraModelType::Perspective => CameraModel::Perspective {
                fx: cfg.fx,
                fy: cfg.fy,
                cx: cfg.cx,
                cy: cfg.cy,
                k1: cfg.k1,
                k2: cfg.k2,
                p1: cfg.p1,
                p2: cfg.p2,
                k3: cfg.k3,
            },
            // The fisheye model reads its four theta-polynomial coefficients
            // from the k1, k2, p1, p2 slots of the flat config.
            CameraModelType::Fisheye => CameraModel::Fisheye {
                fx: cfg.fx,
                fy: cfg.fy,
                cx: cfg.cx,
                cy: cfg.cy,
                k1: cfg.k1,
                k2: cfg.k2,
                k3: cfg.p1,
                k4: cfg.p2,
            },
            CameraModelType::Equirectangular => CameraModel::Equirectangular {
                cols: cfg.cols as f64,
                rows: cfg.rows as f64,
            },
            CameraModelType::RadialDivision => CameraModel::RadialDivision {
                fx: cfg.fx,
                fy: cfg.fy,
                cx: cfg.cx,
                cy: cfg.cy,
                distortion: cfg.distortion,
            },
        };
        let camera = Self {
            name: cfg.name.clone(),
            setup: cfg.setup,
            model,
            cols: cfg.cols,
            rows: cfg.rows,
            fps: cfg.fps,
            focal_x_baseline: cfg.focal_x_baseline,
            depth_threshold: cfg.depth_threshold,
        };
        if cfg.setup != SetupType::Monocular && camera.focal_length_x() <= 0.0 {
            return Err(Error::ConfigInvalid(
                "stereo/RGBD setups need a finite focal length".into(),
            ));
        }
        Ok(camera)
    }

    /// Focal length along x, or zero for the equirectangular model.
    pub fn focal_length_x(&self) -> f64 {
        match self.model {
            CameraModel::Perspective { fx, .. }
            | CameraModel::Fisheye { fx, .. }
            | CameraModel::RadialDivision { fx, .. } => fx,
            CameraModel::Equirectangular { .. } => 0.0,
        }
    }

    /// Metric stereo baseline.
    pub fn baseline(&self) -> f64 {
        let fx = self.focal_length_x();
        if fx > 0.0 {
            self.focal_x_baseline / fx
        } else {
            0.0
        }
    }

    /// Maximum reliable stereo depth.
    pub fn max_reliable_depth(&self) -> f64 {
        self.depth_threshold * self.baseline()
    }

    /// Project a camera-frame point to pixels. `None` when the point does not
    /// image (behind a directional camera).
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        match &self.model {
            CameraModel::Perspective {
                fx,
                fy,
                cx,
                cy,
                k1,
                k2,
                p1,
                p2,
                k3,
            } => {
                if p_cam.z <= 0.0 {
                    return None;
                }
                let x = p_cam.x / p_cam.z;
                let y = p_cam.y / p_cam.z;
                let r2 = x * x + y * y;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
                let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                Some(Vector2::new(fx * xd + cx, fy * yd + cy))
            }
            CameraModel::Fisheye {
                fx,
                fy,
                cx,
                cy,
                k1,
                k2,
                k3,
                k4,
            } => {
                let r = (p_cam.x * p_cam.x + p_cam.y * p_cam.y).sqrt();
                let theta = r.atan2(p_cam.z);
                if theta > PI * 0.55 {
                    // Outside the modeled field of view.
                    return None;
                }
                let t2 = theta * theta;
                let d = theta * (1.0 + k1 * t2 + k2 * t2 * t2 + k3 * t2 * t2 * t2 + k4 * t2 * t2 * t2 * t2);
                let (xu, yu) = if r > 1e-10 {
                    (d * p_cam.x / r, d * p_cam.y / r)
                } else {
                    (0.0, 0.0)
                };
                Some(Vector2::new(fx * xu + cx, fy * yu + cy))
            }
            CameraModel::Equirectangular { cols, rows } => {
                let n = p_cam.norm();
                if n < 1e-12 {
                    return None;
                }
                let lat = -(p_cam.y / n).asin();
                let lon = p_cam.x.atan2(p_cam.z);
                Some(Vector2::new(
                    cols * (0.5 + lon / (2.0 * PI)),
                    rows * (0.5 - lat / PI),
                ))
            }
            CameraModel::RadialDivision {
                fx,
                fy,
                cx,
                cy,
                distortion,
            } => {
                if p_cam.z <= 0.0 {
                    return None;
                }
                let xu = p_cam.x / p_cam.z;
                let yu = p_cam.y / p_cam.z;
                let ru2 = xu * xu + yu * yu;
                // Invert x_u = x_d / (1 + k r_d²) for the distorted radius.
                let factor = if distortion.abs() < 1e-12 || ru2 < 1e-12 {
                    1.0
                } else {
                    let disc = 1.0 - 4.0 * distortion * ru2;
                    if disc < 0.0 {
                        return None;
                    }
                    2.0 / (1.0 + disc.sqrt())
                };
                Some(Vector2::new(fx * factor * xu + cx, fy * factor * yu + cy))
            }
        }
    }

    /// Lift a pixel to a unit bearing in the camera frame.
    pub fn bearing(&self, px: &Vector2<f64>) -> Vector3<f64> {
        match &self.model {
            CameraModel::Perspective {
                fx,
                fy,
                cx,
                cy,
                k1,
                k2,
                p1,
                p2,
                k3,
            } => {
                let xd = (px.x - cx) / fx;
                let yd = (px.y - cy) / fy;
                // Fixed-point undistortion.
                let (mut x, mut y) = (xd, yd);
                for _ in 0..8 {
                    let r2 = x * x + y * y;
                    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
                    let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                    let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                    x = (xd - dx) / radial;
                    y = (yd - dy) / radial;
                }
                Vector3::new(x, y, 1.0).normalize()
            }
            CameraModel::Fisheye {
                fx,
                fy,
                cx,
                cy,
                k1,
                k2,
                k3,
                k4,
            } => {
                let xu = (px.x - cx) / fx;
                let yu = (px.y - cy) / fy;
                let d = (xu * xu + yu * yu).sqrt();
                // Newton-invert d = θ(1 + k1 θ² + ...).
                let mut theta = d;
                for _ in 0..10 {
                    let t2 = theta * theta;
                    let f = theta
                        * (1.0 + k1 * t2 + k2 * t2 * t2 + k3 * t2 * t2 * t2 + k4 * t2 * t2 * t2 * t2)
                        - d;
                    let df = 1.0
                        + 3.0 * k1 * t2
                        + 5.0 * k2 * t2 * t2
                        + 7.0 * k3 * t2 * t2 * t2
                        + 9.0 * k4 * t2 * t2 * t2 * t2;
                    if df.abs() < 1e-12 {
                        break;
                    }
                    theta -= f / df;
                }
                if d < 1e-10 {
                    return Vector3::new(0.0, 0.0, 1.0);
                }
                let (s, c) = theta.sin_cos();
                Vector3::new(s * xu / d, s * yu / d, c).normalize()
            }
            CameraModel::Equirectangular { cols, rows } => {
                let lon = (px.x / cols - 0.5) * 2.0 * PI;
                let lat = -(px.y / rows - 0.5) * PI;
                Vector3::new(lat.cos() * lon.sin(), -lat.sin(), lat.cos() * lon.cos())
            }
            CameraModel::RadialDivision {
                fx,
                fy,
                cx,
                cy,
                distortion,
            } => {
                let xd = (px.x - cx) / fx;
                let yd = (px.y - cy) / fy;
                let rd2 = xd * xd + yd * yd;
                let inv = 1.0 + distortion * rd2;
                Vector3::new(xd / inv, yd / inv, 1.0).normalize()
            }
        }
    }

    /// Usable pixel bounds.
    ///
    /// The distortion models keep the full sensor rectangle usable after
    /// bearing lifting, so the bounds are the image rectangle; the
    /// equirectangular model wraps horizontally but the engine treats the
    /// stored rectangle as authoritative.
    pub fn image_bounds(&self) -> ImageBounds {
        ImageBounds {
            min_x: 0.0,
            max_x: self.cols as f64,
            min_y: 0.0,
            max_y: self.rows as f64,
        }
    }

    /// Depth of a stereo observation from its disparity against the virtual
    /// right camera x-coordinate.
    pub fn depth_from_right_x(&self, x_left: f64, x_right: f64) -> Option<f64> {
        let disparity = x_left - x_right;
        if disparity <= 0.0 {
            return None;
        }
        Some(self.focal_x_baseline / disparity)
    }

    /// The virtual right-image x-coordinate a world depth would produce.
    pub fn right_x_from_depth(&self, x_left: f64, depth: f64) -> Option<f64> {
        if depth <= 0.0 {
            return None;
        }
        Some(x_left - self.focal_x_baseline / depth)
    }
}
