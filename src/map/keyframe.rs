//! Keyframe: a frame promoted to durable map membership.
//!
//! Keyframes are the vertices of the covisibility graph and the spanning
//! tree. The adjacency (weights, parent/children, loop edges) is stored on
//! the keyframe; all recomputation that needs landmark data goes through the
//! map database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::bow::{BowVector, FeatureVector, Vocabulary};
use crate::camera::Camera;
use crate::feature::{Descriptor, KeyPoint, OrbParams};
use crate::geometry::SE3;

use super::frame::Frame;
use super::grid::FeatureGrid;
use super::types::{KeyframeId, LandmarkId};

/// Minimum shared-landmark count for an explicit covisibility edge.
pub const COVISIBILITY_WEIGHT_THR: u32 = 15;

#[derive(Debug, Clone)]
pub struct Keyframe {
    pub id: KeyframeId,
    /// Frame this keyframe was promoted from.
    pub src_frame_id: u64,
    pub timestamp: f64,
    pub camera: Arc<Camera>,
    pub orb_params: Arc<OrbParams>,

    pose_cw: SE3,
    pose_wc: SE3,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub bearings: Vec<Vector3<f64>>,
    pub stereo_x_right: Vec<Option<f64>>,
    pub depths: Vec<Option<f64>>,

    /// Landmark association per keypoint (injective over live landmarks).
    pub landmarks: Vec<Option<LandmarkId>>,

    pub grid: FeatureGrid,

    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,

    // Covisibility graph adjacency.
    covisibility_weights: HashMap<KeyframeId, u32>,
    ordered_covisibles: Vec<(KeyframeId, u32)>,
    covisibility_dirty: bool,

    // Spanning tree.
    pub parent: Option<KeyframeId>,
    pub children: HashSet<KeyframeId>,

    /// Loop-edge partners; never used for covisibility retrieval.
    pub loop_edges: HashSet<KeyframeId>,

    /// Pinned by the loop closer / global BA; erasure is deferred.
    pub not_to_be_erased: bool,
    /// Erasure was requested while pinned.
    pub to_be_erased: bool,
    /// Tombstone.
    pub is_bad: bool,
}

impl Keyframe {
    /// Promote a frame. The frame must carry a pose.
    pub fn from_frame(id: KeyframeId, frame: &Frame) -> Self {
        let pose_cw = frame
            .pose_cw
            .clone()
            .expect("cannot promote a frame without a pose");
        let pose_wc = pose_cw.inverse();
        Self {
            id,
            src_frame_id: frame.id,
            timestamp: frame.timestamp,
            camera: Arc::clone(&frame.camera),
            orb_params: Arc::clone(&frame.orb_params),
            pose_cw,
            pose_wc,
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            bearings: frame.bearings.clone(),
            stereo_x_right: frame.stereo_x_right.clone(),
            depths: frame.depths.clone(),
            landmarks: frame.landmarks.clone(),
            grid: frame.grid.clone(),
            bow: frame.bow.clone(),
            feature_vec: frame.feature_vec.clone(),
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            loop_edges: HashSet::new(),
            not_to_be_erased: false,
            to_be_erased: false,
            is_bad: false,
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────

    pub fn pose_cw(&self) -> &SE3 {
        &self.pose_cw
    }

    /// Inverse pose (camera→world), kept in sync with `pose_cw`.
    pub fn pose_wc(&self) -> &SE3 {
        &self.pose_wc
    }

    pub fn set_pose_cw(&mut self, pose_cw: SE3) {
        self.pose_wc = pose_cw.inverse();
        self.pose_cw = pose_cw;
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_wc.translation
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark associations
    // ─────────────────────────────────────────────────────────────────────

    pub fn landmark_at(&self, keypoint_idx: usize) -> Option<LandmarkId> {
        self.landmarks.get(keypoint_idx).copied().flatten()
    }

    pub fn set_landmark(&mut self, keypoint_idx: usize, lm: LandmarkId) -> Option<LandmarkId> {
        let slot = self.landmarks.get_mut(keypoint_idx)?;
        slot.replace(lm)
    }

    pub fn erase_landmark_at(&mut self, keypoint_idx: usize) -> Option<LandmarkId> {
        self.landmarks.get_mut(keypoint_idx)?.take()
    }

    /// Remove every association to `lm`.
    pub fn erase_landmark(&mut self, lm: LandmarkId) {
        for slot in self.landmarks.iter_mut() {
            if *slot == Some(lm) {
                *slot = None;
            }
        }
    }

    pub fn landmark_associations(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.landmarks
            .iter()
            .enumerate()
            .filter_map(|(idx, lm)| lm.map(|id| (idx, id)))
    }

    pub fn num_associated_landmarks(&self) -> usize {
        self.landmarks.iter().filter(|lm| lm.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // BoW
    // ─────────────────────────────────────────────────────────────────────

    pub fn compute_bow(&mut self, vocabulary: &Vocabulary) {
        if self.bow.is_some() {
            return;
        }
        let (bow, feature_vec) = vocabulary.transform(&self.descriptors, 4);
        self.bow = Some(bow);
        self.feature_vec = Some(feature_vec);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_connection(&mut self, kf: KeyframeId, weight: u32) {
        if kf == self.id {
            return;
        }
        self.covisibility_weights.insert(kf, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_connection(&mut self, kf: KeyframeId) {
        if self.covisibility_weights.remove(&kf).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn replace_connections(&mut self, weights: HashMap<KeyframeId, u32>) {
        self.covisibility_weights = weights;
        self.covisibility_dirty = true;
    }

    pub fn connection_weight(&self, kf: KeyframeId) -> u32 {
        self.covisibility_weights.get(&kf).copied().unwrap_or(0)
    }

    pub fn connections(&self) -> &HashMap<KeyframeId, u32> {
        &self.covisibility_weights
    }

    /// Covisible keyframes ordered by decreasing weight, limited to `n`.
    pub fn top_covisibilities(&mut self, n: usize) -> Vec<KeyframeId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Covisible keyframes with weight ≥ `min_weight`, ordered by weight.
    pub fn covisibilities_with_min_weight(&mut self, min_weight: u32) -> Vec<KeyframeId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Read-only ordered variant; sorts on each call.
    pub fn top_covisibilities_readonly(&self, n: usize) -> Vec<KeyframeId> {
        let mut pairs: Vec<(KeyframeId, u32)> = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pairs.into_iter().take(n).map(|(id, _)| id).collect()
    }

    fn ensure_ordered(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        // Ties broken by id for determinism.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spanning tree / loop edges
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent: KeyframeId) {
        self.parent = Some(parent);
    }

    pub fn add_child(&mut self, child: KeyframeId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyframeId) {
        self.children.remove(&child);
    }

    pub fn add_loop_edge(&mut self, partner: KeyframeId) {
        self.loop_edges.insert(partner);
        // A keyframe participating in a loop is never erased.
        self.not_to_be_erased = true;
    }

    pub fn has_loop_edges(&self) -> bool {
        !self.loop_edges.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spatial queries
    // ─────────────────────────────────────────────────────────────────────

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
        let bearing = &self.bearings[idx];
        if bearing.z.abs() < 1e-10 {
            return None;
        }
        let p_cam = bearing * (depth / bearing.z);
        Some(self.pose_wc.transform_point(&p_cam))
    }
}

impl std::fmt::Display for Keyframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} keypoints, {} landmarks, {} covisibles)",
            self.id,
            self.num_keypoints(),
            self.num_associated_landmarks(),
            self.covisibility_weights.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_keypoints;

    fn keyframe(id: u64) -> Keyframe {
        let mut frame = frame_with_keypoints(id, vec![KeyPoint::new(100.0, 100.0, 0); 10]);
        frame.set_pose(SE3::identity());
        Keyframe::from_frame(KeyframeId(id), &frame)
    }

    #[test]
    fn test_landmark_association() {
        let mut kf = keyframe(1);
        assert_eq!(kf.set_landmark(3, LandmarkId(7)), None);
        assert_eq!(kf.landmark_at(3), Some(LandmarkId(7)));
        assert_eq!(kf.num_associated_landmarks(), 1);

        let prev = kf.set_landmark(3, LandmarkId(9));
        assert_eq!(prev, Some(LandmarkId(7)));

        kf.erase_landmark(LandmarkId(9));
        assert_eq!(kf.landmark_at(3), None);
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut kf = keyframe(1);
        kf.add_connection(KeyframeId(2), 50);
        kf.add_connection(KeyframeId(3), 100);
        kf.add_connection(KeyframeId(4), 25);

        assert_eq!(
            kf.top_covisibilities(2),
            vec![KeyframeId(3), KeyframeId(2)]
        );
        assert_eq!(
            kf.covisibilities_with_min_weight(30),
            vec![KeyframeId(3), KeyframeId(2)]
        );
        assert_eq!(kf.connection_weight(KeyframeId(5)), 0);
    }

    #[test]
    fn test_no_self_connection() {
        let mut kf = keyframe(1);
        kf.add_connection(KeyframeId(1), 99);
        assert_eq!(kf.connection_weight(KeyframeId(1)), 0);
    }

    #[test]
    fn test_loop_edge_pins_keyframe() {
        let mut kf = keyframe(1);
        assert!(!kf.not_to_be_erased);
        kf.add_loop_edge(KeyframeId(12));
        assert!(kf.not_to_be_erased);
        assert!(kf.has_loop_edges());
    }

    #[test]
    fn test_set_pose_updates_inverse() {
        let mut kf = keyframe(1);
        let pose = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(1.0, 2.0, 3.0),
        );
        kf.set_pose_cw(pose.clone());
        let roundtrip = kf.pose_cw().compose(kf.pose_wc());
        assert!((roundtrip.to_matrix() - nalgebra::Matrix4::identity()).norm() < 1e-12);
        assert!((kf.camera_center() - pose.camera_center()).norm() < 1e-12);
    }
}
