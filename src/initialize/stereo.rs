//! Single-frame bootstrap for stereo and RGB-D setups.
//!
//! Depth is directly measured, so the first frame with enough valid depths
//! becomes the first keyframe and every measured keypoint seeds a landmark
//! at metric scale.

use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::SE3;
use crate::map::Frame;

/// Minimum valid-depth keypoints required to bootstrap.
pub const MIN_NUM_DEPTHS: usize = 50;

/// Seed points recovered from one depth-carrying frame.
#[derive(Debug, Clone)]
pub struct DepthBootstrap {
    /// `(keypoint index, world point)` pairs.
    pub points: Vec<(usize, Vector3<f64>)>,
}

/// Bootstrap from a frame's stereo/RGB-D depths. The frame pose is set to
/// the identity by the caller before unprojection.
pub fn bootstrap_from_depth(frame: &Frame) -> Option<DepthBootstrap> {
    debug_assert!(frame.pose_cw.as_ref().is_some(), "pose must be set");
    let max_depth = frame.camera.max_reliable_depth();

    let mut points = Vec::new();
    for idx in 0..frame.num_keypoints() {
        let Some(depth) = frame.depths[idx] else {
            continue;
        };
        if depth <= 0.0 || (max_depth > 0.0 && depth > max_depth) {
            continue;
        }
        if let Some(point) = frame.unproject_keypoint(idx) {
            points.push((idx, point));
        }
    }

    if points.len() < MIN_NUM_DEPTHS {
        debug!(valid = points.len(), "not enough depths to bootstrap");
        return None;
    }
    Some(DepthBootstrap { points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::KeyPoint;
    use crate::map::frame::test_support::frame_with_keypoints;

    fn depth_frame(num: usize, depth: f64) -> Frame {
        let keypoints: Vec<KeyPoint> = (0..num)
            .map(|i| KeyPoint::new(100.0 + (i % 30) as f64 * 15.0, 50.0 + (i / 30) as f64 * 20.0, 0))
            .collect();
        let mut frame = frame_with_keypoints(0, keypoints);
        frame.set_pose(SE3::identity());
        let depths = vec![Some(depth); num];
        frame.set_stereo_data(vec![None; num], depths);
        frame
    }

    #[test]
    fn test_bootstrap_creates_metric_points() {
        let frame = depth_frame(80, 3.0);
        let bootstrap = bootstrap_from_depth(&frame).unwrap();
        assert_eq!(bootstrap.points.len(), 80);
        for (_, p) in &bootstrap.points {
            assert!((p.z - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bootstrap_needs_enough_depths() {
        let frame = depth_frame(30, 3.0);
        assert!(bootstrap_from_depth(&frame).is_none());
    }

    #[test]
    fn test_depths_beyond_threshold_ignored() {
        // Max reliable depth for the test camera is 40 × 0.1 m = 4 m.
        let frame = depth_frame(80, 10.0);
        assert!(bootstrap_from_depth(&frame).is_none());
    }
}
