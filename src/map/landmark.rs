//! Landmark: a persistent 3D point with multi-view observations.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::feature::Descriptor;

use super::types::{KeyframeId, LandmarkId};

/// A 3D landmark.
///
/// Observations map keyframes to the keypoint index observing this landmark
/// in that keyframe; the inverse association lives in the keyframe and the
/// two are kept consistent by the map database.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Mean viewing direction (unit vector, world frame).
    pub mean_normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_valid_distance: f64,
    pub max_valid_distance: f64,

    /// Representative descriptor (median Hamming among observations).
    pub descriptor: Descriptor,

    /// keyframe → keypoint index. Ordered for deterministic iteration.
    pub observations: BTreeMap<KeyframeId, usize>,

    /// Keyframe this landmark's geometry is referenced to.
    pub ref_keyframe: KeyframeId,

    /// Keyframe at whose insertion this landmark was created; anchors the
    /// recent-landmark grace window.
    pub first_keyframe: KeyframeId,

    /// Frames in which the landmark fell inside the frustum.
    pub num_observable: u32,

    /// Frames in which the landmark was actually matched.
    pub num_observed: u32,

    /// Tombstone.
    pub is_bad: bool,

    /// Successor after fusion; stale frame references are forwarded here.
    pub replaced: Option<LandmarkId>,
}

impl Landmark {
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_keyframe: KeyframeId,
    ) -> Self {
        Self {
            id,
            position,
            mean_normal: Vector3::zeros(),
            min_valid_distance: 0.0,
            max_valid_distance: f64::INFINITY,
            descriptor,
            observations: BTreeMap::new(),
            ref_keyframe,
            first_keyframe: ref_keyframe,
            num_observable: 1,
            num_observed: 1,
            is_bad: false,
            replaced: None,
        }
    }

    pub fn add_observation(&mut self, keyframe: KeyframeId, keypoint_idx: usize) {
        self.observations.insert(keyframe, keypoint_idx);
    }

    /// Returns true when the observation existed.
    pub fn erase_observation(&mut self, keyframe: KeyframeId) -> bool {
        let existed = self.observations.remove(&keyframe).is_some();
        if existed && self.ref_keyframe == keyframe {
            if let Some((&kf, _)) = self.observations.iter().next() {
                self.ref_keyframe = kf;
            }
        }
        existed
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_in(&self, keyframe: KeyframeId) -> bool {
        self.observations.contains_key(&keyframe)
    }

    pub fn keypoint_index_in(&self, keyframe: KeyframeId) -> Option<usize> {
        self.observations.get(&keyframe).copied()
    }

    pub fn increase_num_observable(&mut self, n: u32) {
        self.num_observable += n;
    }

    pub fn increase_num_observed(&mut self, n: u32) {
        self.num_observed += n;
    }

    /// `n_found / n_visible`. New landmarks start at 1/1.
    pub fn observed_ratio(&self) -> f64 {
        if self.num_observable == 0 {
            1.0
        } else {
            self.num_observed as f64 / self.num_observable as f64
        }
    }

    /// Viewing distance within the scale-invariance range, with the standard
    /// slack used when predicting visibility.
    pub fn is_inside_scale_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_valid_distance && distance <= 1.2 * self.max_valid_distance
    }

    /// Recompute the mean viewing direction and distance bounds from observer
    /// camera centers. `ref_center` is the reference keyframe's center and
    /// `scale_range`/`ref_scale` come from the reference observation's
    /// pyramid geometry.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        ref_center: &Vector3<f64>,
        ref_scale_factor: f64,
        scale_range: f64,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut count = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let norm = dir.norm();
            if norm > 1e-10 {
                normal_sum += dir / norm;
                count += 1;
            }
        }
        if count > 0 && normal_sum.norm() > 1e-10 {
            self.mean_normal = normal_sum / normal_sum.norm();
        }

        let ref_dist = (self.position - ref_center).norm();
        self.max_valid_distance = ref_dist * ref_scale_factor;
        self.min_valid_distance = self.max_valid_distance / scale_range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn landmark() -> Landmark {
        Landmark::new(
            LandmarkId(1),
            Vector3::new(0.0, 0.0, 5.0),
            Descriptor::ZERO,
            KeyframeId(0),
        )
    }

    #[test]
    fn test_observation_bookkeeping() {
        let mut lm = landmark();
        lm.add_observation(KeyframeId(0), 3);
        lm.add_observation(KeyframeId(1), 8);
        assert_eq!(lm.num_observations(), 2);
        assert_eq!(lm.keypoint_index_in(KeyframeId(1)), Some(8));

        assert!(lm.erase_observation(KeyframeId(0)));
        // Reference keyframe forwarded to a surviving observer.
        assert_eq!(lm.ref_keyframe, KeyframeId(1));
        assert!(!lm.erase_observation(KeyframeId(0)));
    }

    #[test]
    fn test_observed_ratio() {
        let mut lm = landmark();
        assert_relative_eq!(lm.observed_ratio(), 1.0, epsilon = 1e-12);
        lm.increase_num_observable(9);
        lm.increase_num_observed(1);
        assert_relative_eq!(lm.observed_ratio(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_update_normal_and_depth() {
        let mut lm = landmark();
        let centers = [Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let scale_range = 1.2f64.powi(7);
        lm.update_normal_and_depth(centers.iter(), &centers[0], 1.0, scale_range);

        assert_relative_eq!(lm.mean_normal.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(lm.max_valid_distance, 5.0, epsilon = 1e-12);
        assert_relative_eq!(lm.min_valid_distance, 5.0 / scale_range, epsilon = 1e-12);
        assert!(lm.is_inside_scale_range(3.0));
        assert!(!lm.is_inside_scale_range(50.0));
    }
}
