//! Frame: transient per-input observation set.

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use crate::bow::{BowVector, FeatureVector, Vocabulary};
use crate::camera::Camera;
use crate::feature::{Descriptor, Features, KeyPoint, OrbParams};
use crate::geometry::SE3;

use super::grid::FeatureGrid;
use super::types::{KeyframeId, LandmarkId};

/// A single input frame with extracted features and (once estimated) a pose.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically assigned frame id.
    pub id: u64,
    pub timestamp: f64,
    pub camera: Arc<Camera>,
    pub orb_params: Arc<OrbParams>,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Unit bearings in the camera frame, aligned to keypoints.
    pub bearings: Vec<Vector3<f64>>,
    /// Virtual right-image x coordinate per keypoint (stereo/RGB-D only).
    pub stereo_x_right: Vec<Option<f64>>,
    /// Depth per keypoint (stereo/RGB-D only).
    pub depths: Vec<Option<f64>>,

    /// World→camera pose, set once estimated.
    pub pose_cw: Option<SE3>,

    /// Landmark association per keypoint.
    pub landmarks: Vec<Option<LandmarkId>>,
    /// Outlier flag per keypoint (from pose optimization).
    pub outliers: Vec<bool>,

    /// Reference keyframe used to track this frame.
    pub ref_keyframe: Option<KeyframeId>,

    pub grid: FeatureGrid,

    /// Lazily computed BoW representation.
    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        camera: Arc<Camera>,
        orb_params: Arc<OrbParams>,
        features: Features,
    ) -> Self {
        let n = features.keypoints.len();
        let bearings = features
            .keypoints
            .iter()
            .map(|kp| camera.bearing(&Vector2::new(kp.x, kp.y)))
            .collect();
        let grid = FeatureGrid::build(&features.keypoints, camera.image_bounds());
        Self {
            id,
            timestamp,
            camera,
            orb_params,
            keypoints: features.keypoints,
            descriptors: features.descriptors,
            bearings,
            stereo_x_right: vec![None; n],
            depths: vec![None; n],
            pose_cw: None,
            landmarks: vec![None; n],
            outliers: vec![false; n],
            ref_keyframe: None,
            grid,
            bow: None,
            feature_vec: None,
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    pub fn set_pose(&mut self, pose_cw: SE3) {
        self.pose_cw = Some(pose_cw);
    }

    /// Camera center in world coordinates; `None` before the pose is known.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(|p| p.camera_center())
    }

    /// Attach stereo measurements (aligned to keypoints).
    pub fn set_stereo_data(&mut self, x_right: Vec<Option<f64>>, depths: Vec<Option<f64>>) {
        debug_assert_eq!(x_right.len(), self.keypoints.len());
        debug_assert_eq!(depths.len(), self.keypoints.len());
        self.stereo_x_right = x_right;
        self.depths = depths;
    }

    /// Compute and cache the BoW representation.
    pub fn compute_bow(&mut self, vocabulary: &Vocabulary) {
        if self.bow.is_some() {
            return;
        }
        let (bow, feature_vec) = vocabulary.transform(&self.descriptors, 4);
        self.bow = Some(bow);
        self.feature_vec = Some(feature_vec);
    }

    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        radius: f64,
        min_octave: Option<u32>,
        max_octave: Option<u32>,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints, x, y, radius, min_octave, max_octave)
    }

    /// Back-project keypoint `idx` to a world point using its measured depth.
    pub fn unproject_keypoint(&self, idx: usize) -> Option<Vector3<f64>> {
        let depth = (*self.depths.get(idx)?)?;
        if depth <= 0.0 {
            return None;
        }
        let pose_cw = self.pose_cw.as_ref()?;
        let bearing = &self.bearings[idx];
        if bearing.z.abs() < 1e-10 {
            return None;
        }
        let p_cam = bearing * (depth / bearing.z);
        Some(pose_cw.inverse().transform_point(&p_cam))
    }

    /// Count keypoints currently associated to a landmark and not flagged as
    /// outliers.
    pub fn num_tracked_landmarks(&self) -> usize {
        self.landmarks
            .iter()
            .zip(self.outliers.iter())
            .filter(|(lm, outlier)| lm.is_some() && !**outlier)
            .count()
    }

    /// Drop outlier associations, returning how many tracked landmarks remain.
    pub fn discard_outlier_landmarks(&mut self) -> usize {
        for (lm, outlier) in self.landmarks.iter_mut().zip(self.outliers.iter_mut()) {
            if *outlier {
                *lm = None;
                *outlier = false;
            }
        }
        self.num_tracked_landmarks()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bearings_aligned_to_keypoints() {
        let frame = frame_with_keypoints(0, vec![KeyPoint::new(320.0, 240.0, 0)]);
        // Principal point maps to the optical axis.
        assert_relative_eq!(frame.bearings[0], Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_unproject_with_depth() {
        let mut frame = frame_with_keypoints(0, vec![KeyPoint::new(420.0, 240.0, 0)]);
        frame.set_pose(SE3::identity());
        frame.set_stereo_data(vec![None], vec![Some(2.0)]);
        let p = frame.unproject_keypoint(0).unwrap();
        assert_relative_eq!(p.z, 2.0, epsilon = 1e-9);
        // 100 px off-center at fx=500 and depth 2 → x = 0.4.
        assert_relative_eq!(p.x, 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_discard_outliers() {
        let mut frame = frame_with_keypoints(0, vec![KeyPoint::new(1.0, 1.0, 0); 3]);
        frame.landmarks = vec![Some(LandmarkId(0)), Some(LandmarkId(1)), None];
        frame.outliers = vec![false, true, false];
        assert_eq!(frame.num_tracked_landmarks(), 1);
        assert_eq!(frame.discard_outlier_landmarks(), 1);
        assert_eq!(frame.landmarks[1], None);
    }
}
