//! Left-right stereo matching on rectified pairs.
//!
//! For each left keypoint, candidates in the right image are restricted to a
//! row band scaled by the detection level; the best Hamming match inside the
//! valid disparity range yields the virtual right x-coordinate and depth.

use crate::camera::Camera;
use crate::feature::{Features, OrbParams};

use super::{HAMMING_DIST_THR_HIGH, MAX_HAMMING_DIST};

/// Stereo measurements aligned to the left keypoints.
#[derive(Debug, Clone)]
pub struct StereoMatches {
    pub x_right: Vec<Option<f64>>,
    pub depths: Vec<Option<f64>>,
}

/// Match left and right features of a rectified stereo pair.
pub fn match_stereo(
    left: &Features,
    right: &Features,
    camera: &Camera,
    orb_params: &OrbParams,
) -> StereoMatches {
    let n = left.keypoints.len();
    let mut x_right = vec![None; n];
    let mut depths = vec![None; n];

    if right.keypoints.is_empty() || camera.focal_x_baseline <= 0.0 {
        return StereoMatches { x_right, depths };
    }

    // Bucket right keypoints by row for the band search.
    let rows = camera.rows as usize;
    let mut row_buckets: Vec<Vec<usize>> = vec![Vec::new(); rows];
    for (idx, kp) in right.keypoints.iter().enumerate() {
        let band = 2.0 * orb_params.scale_factor_at(kp.octave as usize);
        let min_row = (kp.y - band).floor().max(0.0) as usize;
        let max_row = (kp.y + band).ceil().min(rows as f64 - 1.0) as usize;
        for row in min_row..=max_row {
            row_buckets[row].push(idx);
        }
    }

    // Depth is valid down to the baseline distance.
    let min_disparity = 0.0;
    let max_disparity = camera.focal_x_baseline / camera.baseline().max(1e-6);

    for (left_idx, left_kp) in left.keypoints.iter().enumerate() {
        let row = left_kp.y.round();
        if row < 0.0 || row >= rows as f64 {
            continue;
        }
        let candidates = &row_buckets[row as usize];

        let left_desc = &left.descriptors[left_idx];
        let mut best = MAX_HAMMING_DIST;
        let mut best_right = None;
        for &right_idx in candidates {
            let right_kp = &right.keypoints[right_idx];
            let octave_diff =
                (right_kp.octave as i64 - left_kp.octave as i64).unsigned_abs();
            if octave_diff > 1 {
                continue;
            }
            let disparity = left_kp.x - right_kp.x;
            if disparity <= min_disparity || disparity > max_disparity {
                continue;
            }
            let dist = left_desc.distance(&right.descriptors[right_idx]);
            if dist < best {
                best = dist;
                best_right = Some(right_idx);
            }
        }

        if let Some(right_idx) = best_right {
            if best <= HAMMING_DIST_THR_HIGH {
                let xr = right.keypoints[right_idx].x;
                if let Some(depth) = camera.depth_from_right_x(left_kp.x, xr) {
                    x_right[left_idx] = Some(xr);
                    depths[left_idx] = Some(depth);
                }
            }
        }
    }

    StereoMatches { x_right, depths }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetupType;
    use crate::feature::{Descriptor, KeyPoint};
    use crate::map::frame::test_support::test_camera;

    fn desc(tag: u8) -> Descriptor {
        let mut d = Descriptor::ZERO;
        d.0[0] = tag;
        d.0[5] = tag.wrapping_add(100);
        d
    }

    #[test]
    fn test_stereo_match_recovers_depth() {
        let camera = test_camera(SetupType::Stereo);
        let orb = OrbParams::default();

        // Depth 2 m at fx·b = 50 → disparity 25 px.
        let left = Features {
            keypoints: vec![KeyPoint::new(320.0, 240.0, 0)],
            descriptors: vec![desc(1)],
        };
        let right = Features {
            keypoints: vec![KeyPoint::new(295.0, 240.3, 0), KeyPoint::new(100.0, 240.0, 0)],
            descriptors: vec![desc(1), desc(200)],
        };

        let matches = match_stereo(&left, &right, &camera, &orb);
        assert_eq!(matches.x_right[0], Some(295.0));
        let depth = matches.depths[0].unwrap();
        assert!((depth - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_disparity_rejected() {
        let camera = test_camera(SetupType::Stereo);
        let orb = OrbParams::default();
        let left = Features {
            keypoints: vec![KeyPoint::new(100.0, 50.0, 0)],
            descriptors: vec![desc(3)],
        };
        // Right keypoint to the right of the left one: impossible geometry.
        let right = Features {
            keypoints: vec![KeyPoint::new(150.0, 50.0, 0)],
            descriptors: vec![desc(3)],
        };
        let matches = match_stereo(&left, &right, &camera, &orb);
        assert_eq!(matches.depths[0], None);
    }

    #[test]
    fn test_row_band_respected() {
        let camera = test_camera(SetupType::Stereo);
        let orb = OrbParams::default();
        let left = Features {
            keypoints: vec![KeyPoint::new(320.0, 100.0, 0)],
            descriptors: vec![desc(5)],
        };
        // Same descriptor but 30 rows away.
        let right = Features {
            keypoints: vec![KeyPoint::new(300.0, 130.0, 0)],
            descriptors: vec![desc(5)],
        };
        let matches = match_stereo(&left, &right, &camera, &orb);
        assert_eq!(matches.depths[0], None);
    }
}
