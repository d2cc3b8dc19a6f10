//! Map database: owning arenas for keyframes and landmarks.
//!
//! All cross-references between entities are ids; dereferencing goes through
//! this database, which the system wraps in a single `RwLock` (the
//! database-wide exclusive lock of the design). Erasure is soft: tombstone,
//! prune references, then release storage.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::feature::median_descriptor;
use crate::geometry::SE3;

use super::frame::Frame;
use super::keyframe::{Keyframe, COVISIBILITY_WEIGHT_THR};
use super::landmark::Landmark;
use super::statistics::FrameStatistics;
use super::types::{KeyframeId, LandmarkId};

/// One entry of the recovered trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    pub frame_id: u64,
    pub timestamp: f64,
    /// `None` for frames tracked as lost.
    pub pose_cw: Option<SE3>,
}

/// The shared map.
#[derive(Debug, Default)]
pub struct MapDatabase {
    keyframes: HashMap<KeyframeId, Keyframe>,
    landmarks: HashMap<LandmarkId, Landmark>,
    /// Forwarding table for fused-away landmarks.
    replaced_landmarks: HashMap<LandmarkId, LandmarkId>,

    origin_keyframe: Option<KeyframeId>,
    last_inserted_keyframe: Option<KeyframeId>,
    local_landmarks: Vec<LandmarkId>,

    next_keyframe_id: u64,
    next_landmark_id: u64,

    pub frame_statistics: FrameStatistics,
}

impl MapDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Id generation
    // ─────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&mut self) -> KeyframeId {
        let id = KeyframeId(self.next_keyframe_id);
        self.next_keyframe_id += 1;
        id
    }

    pub fn next_landmark_id(&mut self) -> LandmarkId {
        let id = LandmarkId(self.next_landmark_id);
        self.next_landmark_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────
    // Insertion / access
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_keyframe(&mut self, keyframe: Keyframe) {
        if keyframe.id.0 >= self.next_keyframe_id {
            self.next_keyframe_id = keyframe.id.0 + 1;
        }
        if self.origin_keyframe.is_none() {
            self.origin_keyframe = Some(keyframe.id);
        }
        self.last_inserted_keyframe = Some(keyframe.id);
        self.keyframes.insert(keyframe.id, keyframe);
    }

    pub fn add_landmark(&mut self, landmark: Landmark) {
        if landmark.id.0 >= self.next_landmark_id {
            self.next_landmark_id = landmark.id.0 + 1;
        }
        self.landmarks.insert(landmark.id, landmark);
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(&id)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    /// Follow the fusion-forwarding chain to the live successor of `id`.
    pub fn resolve_landmark(&self, mut id: LandmarkId) -> Option<LandmarkId> {
        for _ in 0..32 {
            if self.landmarks.contains_key(&id) {
                return Some(id);
            }
            match self.replaced_landmarks.get(&id) {
                Some(&next) => id = next,
                None => return None,
            }
        }
        None
    }

    pub fn origin_keyframe(&self) -> Option<KeyframeId> {
        self.origin_keyframe
    }

    pub fn last_inserted_keyframe(&self) -> Option<KeyframeId> {
        self.last_inserted_keyframe
    }

    /// All keyframe ids in increasing order (deterministic iteration).
    pub fn keyframe_ids(&self) -> Vec<KeyframeId> {
        let mut ids: Vec<KeyframeId> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn landmark_ids(&self) -> Vec<LandmarkId> {
        let mut ids: Vec<LandmarkId> = self.landmarks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.values()
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────

    /// Create the bidirectional keyframe↔landmark association.
    pub fn associate(&mut self, kf_id: KeyframeId, keypoint_idx: usize, lm_id: LandmarkId) -> bool {
        if !self.landmarks.contains_key(&lm_id) {
            return false;
        }
        match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                kf.set_landmark(keypoint_idx, lm_id);
            }
            None => return false,
        }
        self.landmarks
            .get_mut(&lm_id)
            .expect("checked above")
            .add_observation(kf_id, keypoint_idx);
        true
    }

    /// Remove the association at a keypoint, both directions.
    pub fn disassociate(&mut self, kf_id: KeyframeId, keypoint_idx: usize) -> Option<LandmarkId> {
        let lm_id = self.keyframes.get_mut(&kf_id)?.erase_landmark_at(keypoint_idx)?;
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.erase_observation(kf_id);
        }
        Some(lm_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute all covisibility weights of `kf_id` from shared landmarks
    /// and rewrite the adjacency symmetrically.
    ///
    /// Edges require weight ≥ 15; if no partner qualifies, a single link to
    /// the best partner is kept (stored symmetrically — see DESIGN.md). The
    /// first time a non-origin keyframe gains connections it is attached to
    /// the spanning tree under its best covisibility partner.
    ///
    /// Idempotent: recomputing without landmark changes leaves the graph
    /// unchanged.
    pub fn update_connections(&mut self, kf_id: KeyframeId) {
        let (shared, old_neighbors): (HashMap<KeyframeId, u32>, Vec<KeyframeId>) = {
            let kf = match self.keyframes.get(&kf_id) {
                Some(kf) => kf,
                None => return,
            };
            let mut shared: HashMap<KeyframeId, u32> = HashMap::new();
            for (_, lm_id) in kf.landmark_associations() {
                if let Some(lm) = self.landmarks.get(&lm_id) {
                    if lm.is_bad {
                        continue;
                    }
                    for (&other, _) in lm.observations.iter() {
                        if other != kf_id {
                            *shared.entry(other).or_insert(0) += 1;
                        }
                    }
                }
            }
            (shared, kf.connections().keys().copied().collect())
        };

        // Keep partners meeting the threshold; otherwise the single best.
        let mut new_weights: HashMap<KeyframeId, u32> = shared
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_WEIGHT_THR)
            .map(|(&id, &w)| (id, w))
            .collect();
        if new_weights.is_empty() {
            if let Some((&best_id, &best_w)) = shared
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            {
                new_weights.insert(best_id, best_w);
            }
        }

        // Symmetric writes: stale edges first, then current ones.
        for old in old_neighbors {
            if !new_weights.contains_key(&old) {
                if let Some(peer) = self.keyframes.get_mut(&old) {
                    peer.erase_connection(kf_id);
                }
            }
        }
        for (&peer_id, &w) in &new_weights {
            if let Some(peer) = self.keyframes.get_mut(&peer_id) {
                peer.add_connection(kf_id, w);
            }
        }

        // Spanning-tree attachment on first connection.
        let needs_parent = {
            let kf = self.keyframes.get(&kf_id).expect("checked above");
            kf.parent.is_none() && Some(kf_id) != self.origin_keyframe
        };
        let best_partner = new_weights
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&id, _)| id);

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.replace_connections(new_weights);
        }

        if needs_parent {
            if let Some(parent) = best_partner {
                self.set_spanning_tree_parent(kf_id, parent);
            }
        }
    }

    /// Attach `child` under `parent` in the spanning tree.
    pub fn set_spanning_tree_parent(&mut self, child: KeyframeId, parent: KeyframeId) {
        if child == parent {
            return;
        }
        let old_parent = match self.keyframes.get_mut(&child) {
            Some(kf) => {
                let old = kf.parent;
                kf.set_parent(parent);
                old
            }
            None => return,
        };
        if let Some(old) = old_parent {
            if let Some(kf) = self.keyframes.get_mut(&old) {
                kf.erase_child(child);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&parent) {
            kf.add_child(child);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Erasure
    // ─────────────────────────────────────────────────────────────────────

    /// Soft-erase a keyframe.
    ///
    /// The origin keyframe is never erased. A keyframe pinned by the loop
    /// closer gets its `to_be_erased` flag set and survives until unpinned.
    /// Otherwise the keyframe is tombstoned, every reference (observations,
    /// covisibility, spanning tree, frame statistics) is pruned, children are
    /// re-parented to the surviving vertex with maximum covisibility to
    /// their existing tree ancestors, and storage is released.
    ///
    /// Returns the removed keyframe so the caller can prune the BoW index
    /// with its word vector.
    pub fn erase_keyframe(&mut self, kf_id: KeyframeId) -> Option<Keyframe> {
        if Some(kf_id) == self.origin_keyframe {
            return None;
        }
        {
            let kf = self.keyframes.get_mut(&kf_id)?;
            if kf.not_to_be_erased {
                kf.to_be_erased = true;
                return None;
            }
            kf.is_bad = true;
        }

        let (associations, neighbors, parent, children, pose_cw) = {
            let kf = self.keyframes.get(&kf_id).expect("tombstoned above");
            (
                kf.landmark_associations().collect::<Vec<_>>(),
                kf.connections().keys().copied().collect::<Vec<_>>(),
                kf.parent,
                kf.children.iter().copied().collect::<Vec<_>>(),
                kf.pose_cw().clone(),
            )
        };

        // Observations.
        let mut landmarks_to_refresh = Vec::new();
        for (_, lm_id) in associations {
            if let Some(lm) = self.landmarks.get_mut(&lm_id) {
                lm.erase_observation(kf_id);
                if lm.observations.is_empty() {
                    lm.is_bad = true;
                } else {
                    landmarks_to_refresh.push(lm_id);
                }
            }
        }
        let orphaned: Vec<LandmarkId> = self
            .landmarks
            .iter()
            .filter(|(_, lm)| lm.is_bad && lm.observations.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for lm_id in orphaned {
            self.landmarks.remove(&lm_id);
        }
        for lm_id in landmarks_to_refresh {
            self.update_landmark_geometry(lm_id);
        }

        // Covisibility.
        for neighbor in neighbors {
            if let Some(peer) = self.keyframes.get_mut(&neighbor) {
                peer.erase_connection(kf_id);
            }
        }

        // Loop edges (a pinned keyframe never reaches this point, but a
        // partner may have been erased from the other side).
        let partners: Vec<KeyframeId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.loop_edges.iter().copied().collect())
            .unwrap_or_default();
        for partner in partners {
            if let Some(peer) = self.keyframes.get_mut(&partner) {
                peer.loop_edges.remove(&kf_id);
            }
        }

        self.reparent_children(kf_id, parent, children);

        // Trajectory records referencing this keyframe move to its parent
        // (or the origin).
        let new_ref = parent.or(self.origin_keyframe);
        if let Some(new_ref) = new_ref {
            if let Some(new_kf) = self.keyframes.get(&new_ref) {
                let new_pose = new_kf.pose_cw().clone();
                self.frame_statistics
                    .replace_reference(kf_id, new_ref, &pose_cw, &new_pose);
            }
        }

        if let Some(parent) = parent {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
            }
        }

        if self.last_inserted_keyframe == Some(kf_id) {
            self.last_inserted_keyframe = self.keyframes.keys().copied().max();
        }

        debug!(keyframe = %kf_id, "erased keyframe");
        self.keyframes.remove(&kf_id)
    }

    /// Re-parent the children of an erased keyframe.
    ///
    /// Greedy assignment: repeatedly pick the (child, candidate) pair with
    /// the highest covisibility weight where the candidate is already a tree
    /// ancestor-side vertex, attach the child there, and make it a candidate
    /// for the remaining children. Leftovers fall back to the erased
    /// keyframe's parent.
    fn reparent_children(
        &mut self,
        erased: KeyframeId,
        parent: Option<KeyframeId>,
        children: Vec<KeyframeId>,
    ) {
        let mut candidates: Vec<KeyframeId> = parent.into_iter().collect();
        let mut remaining: Vec<KeyframeId> = children
            .into_iter()
            .filter(|c| *c != erased && self.keyframes.contains_key(c))
            .collect();

        while !remaining.is_empty() && !candidates.is_empty() {
            let mut best: Option<(usize, KeyframeId, u32)> = None;
            for (pos, &child) in remaining.iter().enumerate() {
                let child_kf = match self.keyframes.get(&child) {
                    Some(kf) => kf,
                    None => continue,
                };
                for &candidate in &candidates {
                    let w = child_kf.connection_weight(candidate);
                    if w > 0 && best.map_or(true, |(_, _, bw)| w > bw) {
                        best = Some((pos, candidate, w));
                    }
                }
            }
            match best {
                Some((pos, candidate, _)) => {
                    let child = remaining.remove(pos);
                    self.set_spanning_tree_parent(child, candidate);
                    candidates.push(child);
                }
                None => break,
            }
        }

        if let Some(fallback) = parent.or(self.origin_keyframe) {
            for child in remaining {
                self.set_spanning_tree_parent(child, fallback);
            }
        }
    }

    /// Soft-erase a landmark: tombstone, prune from observing keyframes,
    /// release storage.
    pub fn erase_landmark(&mut self, lm_id: LandmarkId) {
        let observations: Vec<(KeyframeId, usize)> = match self.landmarks.get_mut(&lm_id) {
            Some(lm) => {
                lm.is_bad = true;
                lm.observations.iter().map(|(&k, &i)| (k, i)).collect()
            }
            None => return,
        };
        for (kf_id, keypoint_idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.landmark_at(keypoint_idx) == Some(lm_id) {
                    kf.erase_landmark_at(keypoint_idx);
                }
            }
        }
        self.landmarks.remove(&lm_id);
        self.local_landmarks.retain(|&id| id != lm_id);
    }

    /// Merge `old` into `new`: keep `new`, transfer `old`'s observations and
    /// counters, leave a forwarding record, release `old`.
    pub fn replace_landmark(&mut self, old_id: LandmarkId, new_id: LandmarkId) {
        if old_id == new_id || !self.landmarks.contains_key(&new_id) {
            return;
        }
        let (observations, observable, observed) = match self.landmarks.get_mut(&old_id) {
            Some(old) => {
                old.is_bad = true;
                (
                    old.observations.iter().map(|(&k, &i)| (k, i)).collect::<Vec<_>>(),
                    old.num_observable,
                    old.num_observed,
                )
            }
            None => return,
        };

        for (kf_id, keypoint_idx) in observations {
            let already_observed = self
                .landmarks
                .get(&new_id)
                .map(|lm| lm.is_observed_in(kf_id))
                .unwrap_or(false);
            if already_observed {
                // The keyframe keeps its existing observation of `new`;
                // the duplicate slot is cleared.
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.landmark_at(keypoint_idx) == Some(old_id) {
                        kf.erase_landmark_at(keypoint_idx);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_landmark(keypoint_idx, new_id);
                }
                if let Some(new_lm) = self.landmarks.get_mut(&new_id) {
                    new_lm.add_observation(kf_id, keypoint_idx);
                }
            }
        }
        if let Some(new_lm) = self.landmarks.get_mut(&new_id) {
            new_lm.increase_num_observable(observable);
            new_lm.increase_num_observed(observed);
        }

        self.landmarks.remove(&old_id);
        self.local_landmarks.retain(|&id| id != old_id);
        self.replaced_landmarks.insert(old_id, new_id);
        self.update_landmark_geometry(new_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Derived landmark attributes
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute a landmark's representative descriptor, mean viewing
    /// direction and scale-invariance bounds from its current observations.
    pub fn update_landmark_geometry(&mut self, lm_id: LandmarkId) {
        let (descriptors, centers, ref_data) = {
            let lm = match self.landmarks.get(&lm_id) {
                Some(lm) => lm,
                None => return,
            };
            let mut descriptors = Vec::new();
            let mut centers = Vec::new();
            for (&kf_id, &idx) in lm.observations.iter() {
                if let Some(kf) = self.keyframes.get(&kf_id) {
                    if kf.is_bad {
                        continue;
                    }
                    if let Some(desc) = kf.descriptors.get(idx) {
                        descriptors.push(*desc);
                    }
                    centers.push(kf.camera_center());
                }
            }
            let ref_data = self
                .keyframes
                .get(&lm.ref_keyframe)
                .and_then(|kf| {
                    lm.keypoint_index_in(lm.ref_keyframe).map(|idx| {
                        let octave = kf.keypoints.get(idx).map(|kp| kp.octave).unwrap_or(0);
                        (
                            kf.camera_center(),
                            kf.orb_params.scale_factor_at(octave as usize),
                            kf.orb_params.scale_range(),
                        )
                    })
                });
            (descriptors, centers, ref_data)
        };

        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            if let Some(desc) = median_descriptor(&descriptors) {
                lm.descriptor = desc;
            }
            if let Some((ref_center, ref_scale, scale_range)) = ref_data {
                lm.update_normal_and_depth(centers.iter(), &ref_center, ref_scale, scale_range);
            }
        }
    }

    /// Median depth of a keyframe's associated landmarks in its own frame.
    pub fn median_depth(&self, kf_id: KeyframeId) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let mut depths: Vec<f64> = kf
            .landmark_associations()
            .filter_map(|(_, lm_id)| self.landmarks.get(&lm_id))
            .filter(|lm| !lm.is_bad)
            .map(|lm| kf.pose_cw().transform_point(&lm.position).z)
            .filter(|z| *z > 0.0)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(depths[depths.len() / 2])
    }

    /// Landmarks of `kf_id` observed by at least `min_obs` keyframes.
    pub fn num_tracked_landmarks(&self, kf_id: KeyframeId, min_obs: usize) -> usize {
        let kf = match self.keyframes.get(&kf_id) {
            Some(kf) => kf,
            None => return 0,
        };
        kf.landmark_associations()
            .filter_map(|(_, lm_id)| self.landmarks.get(&lm_id))
            .filter(|lm| !lm.is_bad && lm.num_observations() >= min_obs)
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local landmarks / queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_local_landmarks(&mut self, landmarks: Vec<LandmarkId>) {
        self.local_landmarks = landmarks;
    }

    pub fn local_landmarks(&self) -> Vec<LandmarkId> {
        self.local_landmarks
            .iter()
            .copied()
            .filter(|id| self.landmarks.contains_key(id))
            .collect()
    }

    /// Keyframes whose camera center lies within `distance_threshold` of the
    /// given pose's center and whose optical axis deviates by less than
    /// `angle_threshold` radians.
    pub fn get_close_keyframes(
        &self,
        pose_cw: &SE3,
        distance_threshold: f64,
        angle_threshold: f64,
    ) -> Vec<KeyframeId> {
        let center = pose_cw.camera_center();
        let axis = pose_cw.rotation.inverse() * Vector3::z();
        let mut out: Vec<KeyframeId> = self
            .keyframes
            .values()
            .filter(|kf| {
                let dist = (kf.camera_center() - center).norm();
                if dist > distance_threshold {
                    return false;
                }
                let kf_axis = kf.pose_cw().rotation.inverse() * Vector3::z();
                axis.dot(&kf_axis).clamp(-1.0, 1.0).acos() < angle_threshold
            })
            .map(|kf| kf.id)
            .collect();
        out.sort();
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame statistics / trajectory
    // ─────────────────────────────────────────────────────────────────────

    pub fn update_frame_statistics(&mut self, frame: &Frame, is_lost: bool) {
        if is_lost {
            self.frame_statistics.update_lost(frame.id, frame.timestamp);
            return;
        }
        let (ref_kf, pose) = match (frame.ref_keyframe, frame.pose_cw.as_ref()) {
            (Some(r), Some(p)) => (r, p),
            _ => {
                self.frame_statistics.update_lost(frame.id, frame.timestamp);
                return;
            }
        };
        if let Some(ref_pose) = self.keyframes.get(&ref_kf).map(|kf| kf.pose_cw().clone()) {
            self.frame_statistics
                .update(frame.id, frame.timestamp, ref_kf, &ref_pose, pose);
        }
    }

    /// Recover the full frame trajectory through the reference keyframes.
    pub fn get_trajectory(&self) -> Vec<TrajectoryEntry> {
        self.frame_statistics
            .records()
            .iter()
            .map(|(&frame_id, record)| {
                let pose_cw = if record.is_lost {
                    None
                } else {
                    self.keyframes
                        .get(&record.ref_keyframe)
                        .map(|kf| record.rel_pose_cr.compose(kf.pose_cw()))
                };
                TrajectoryEntry {
                    frame_id,
                    timestamp: record.timestamp,
                    pose_cw,
                }
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset
    // ─────────────────────────────────────────────────────────────────────

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.landmarks.clear();
        self.replaced_landmarks.clear();
        self.origin_keyframe = None;
        self.last_inserted_keyframe = None;
        self.local_landmarks.clear();
        self.next_keyframe_id = 0;
        self.next_landmark_id = 0;
        self.frame_statistics.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::feature::{Descriptor, KeyPoint};
    use crate::map::frame::test_support::frame_with_keypoints;

    /// Insert a keyframe with `n` keypoints at an identity pose.
    pub fn insert_keyframe(db: &mut MapDatabase, n: usize) -> KeyframeId {
        let id = db.next_keyframe_id();
        let mut frame = frame_with_keypoints(id.0, vec![KeyPoint::new(100.0, 100.0, 0); n]);
        frame.set_pose(SE3::identity());
        db.add_keyframe(Keyframe::from_frame(id, &frame));
        id
    }

    /// Create a landmark observed by the given (keyframe, keypoint) pairs.
    pub fn insert_landmark(
        db: &mut MapDatabase,
        position: Vector3<f64>,
        observations: &[(KeyframeId, usize)],
    ) -> LandmarkId {
        let id = db.next_landmark_id();
        let ref_kf = observations.first().map(|(kf, _)| *kf).unwrap_or(KeyframeId(0));
        db.add_landmark(Landmark::new(id, position, Descriptor::ZERO, ref_kf));
        for &(kf, idx) in observations {
            db.associate(kf, idx, id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_bidirectional_association() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 10);
        let kf2 = insert_keyframe(&mut db, 10);
        let lm = insert_landmark(&mut db, Vector3::new(0.0, 0.0, 5.0), &[(kf1, 0), (kf2, 3)]);

        assert_eq!(db.landmark(lm).unwrap().keypoint_index_in(kf1), Some(0));
        assert_eq!(db.keyframe(kf2).unwrap().landmark_at(3), Some(lm));

        db.disassociate(kf1, 0);
        assert!(!db.landmark(lm).unwrap().is_observed_in(kf1));
        assert_eq!(db.keyframe(kf1).unwrap().landmark_at(0), None);
    }

    #[test]
    fn test_update_connections_weights_and_fallback() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 40);
        let kf2 = insert_keyframe(&mut db, 40);
        let kf3 = insert_keyframe(&mut db, 40);

        // 20 shared landmarks kf1↔kf2 (over threshold), 3 shared kf1↔kf3.
        for i in 0..20 {
            insert_landmark(&mut db, Vector3::new(0.0, 0.0, 4.0), &[(kf1, i), (kf2, i)]);
        }
        for i in 20..23 {
            insert_landmark(&mut db, Vector3::new(0.0, 0.0, 4.0), &[(kf1, i), (kf3, i)]);
        }

        db.update_connections(kf1);
        let kf1_ref = db.keyframe(kf1).unwrap();
        assert_eq!(kf1_ref.connection_weight(kf2), 20);
        // Below threshold and a stronger partner exists: no edge.
        assert_eq!(kf1_ref.connection_weight(kf3), 0);
        // Symmetric write.
        assert_eq!(db.keyframe(kf2).unwrap().connection_weight(kf1), 20);

        // kf3 only shares 3 landmarks; fallback keeps the single best link,
        // symmetrically.
        db.update_connections(kf3);
        assert_eq!(db.keyframe(kf3).unwrap().connection_weight(kf1), 3);
        assert_eq!(db.keyframe(kf1).unwrap().connection_weight(kf3), 3);
    }

    #[test]
    fn test_update_connections_idempotent() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 40);
        let kf2 = insert_keyframe(&mut db, 40);
        for i in 0..18 {
            insert_landmark(&mut db, Vector3::new(0.0, 0.0, 4.0), &[(kf1, i), (kf2, i)]);
        }
        db.update_connections(kf1);
        let before: Vec<_> = db.keyframe(kf1).unwrap().top_covisibilities_readonly(10);
        let parent_before = db.keyframe(kf1).unwrap().parent;
        db.update_connections(kf1);
        assert_eq!(db.keyframe(kf1).unwrap().top_covisibilities_readonly(10), before);
        assert_eq!(db.keyframe(kf1).unwrap().parent, parent_before);
    }

    #[test]
    fn test_spanning_tree_parent_assignment() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 40);
        let kf2 = insert_keyframe(&mut db, 40);
        for i in 0..16 {
            insert_landmark(&mut db, Vector3::new(0.0, 0.0, 4.0), &[(kf1, i), (kf2, i)]);
        }
        db.update_connections(kf2);
        assert_eq!(db.keyframe(kf2).unwrap().parent, Some(kf1));
        assert!(db.keyframe(kf1).unwrap().children.contains(&kf2));
        // Origin never gets a parent.
        db.update_connections(kf1);
        assert_eq!(db.keyframe(kf1).unwrap().parent, None);
    }

    #[test]
    fn test_erase_keyframe_prunes_references() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 40);
        let kf2 = insert_keyframe(&mut db, 40);
        let kf3 = insert_keyframe(&mut db, 40);
        for i in 0..20 {
            insert_landmark(
                &mut db,
                Vector3::new(0.0, 0.0, 4.0),
                &[(kf1, i), (kf2, i), (kf3, i)],
            );
        }
        db.update_connections(kf1);
        db.update_connections(kf2);
        db.update_connections(kf3);
        // Chain the tree kf1 → kf2 → kf3 so the erase exercises reparenting.
        db.set_spanning_tree_parent(kf3, kf2);
        assert_eq!(db.keyframe(kf3).unwrap().parent, Some(kf2));

        let erased = db.erase_keyframe(kf2).unwrap();
        assert_eq!(erased.id, kf2);
        assert_eq!(db.num_keyframes(), 2);

        // No surviving landmark observes kf2, nobody's parent is kf2.
        for lm in db.landmarks() {
            assert!(!lm.is_observed_in(kf2));
        }
        for kf in db.keyframes() {
            assert_ne!(kf.parent, Some(kf2));
            assert_eq!(kf.connection_weight(kf2), 0);
        }
        // kf3 re-parented to the surviving covisible vertex.
        assert_eq!(db.keyframe(kf3).unwrap().parent, Some(kf1));
    }

    #[test]
    fn test_origin_keyframe_never_erased() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 10);
        assert!(db.erase_keyframe(kf1).is_none());
        assert_eq!(db.num_keyframes(), 1);
    }

    #[test]
    fn test_pinned_keyframe_defers_erasure() {
        let mut db = MapDatabase::new();
        let _kf1 = insert_keyframe(&mut db, 10);
        let kf2 = insert_keyframe(&mut db, 10);
        db.keyframe_mut(kf2).unwrap().not_to_be_erased = true;

        assert!(db.erase_keyframe(kf2).is_none());
        assert!(db.keyframe(kf2).unwrap().to_be_erased);

        db.keyframe_mut(kf2).unwrap().not_to_be_erased = false;
        assert!(db.erase_keyframe(kf2).is_some());
    }

    #[test]
    fn test_erase_landmark() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 10);
        let lm = insert_landmark(&mut db, Vector3::new(0.0, 0.0, 5.0), &[(kf1, 2)]);
        db.erase_landmark(lm);
        assert_eq!(db.num_landmarks(), 0);
        assert_eq!(db.keyframe(kf1).unwrap().landmark_at(2), None);
    }

    #[test]
    fn test_replace_landmark_transfers_observations() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 10);
        let kf2 = insert_keyframe(&mut db, 10);
        let keep = insert_landmark(&mut db, Vector3::new(0.0, 0.0, 5.0), &[(kf1, 0)]);
        let lose = insert_landmark(&mut db, Vector3::new(0.0, 0.0, 5.1), &[(kf1, 1), (kf2, 4)]);

        db.replace_landmark(lose, keep);
        assert!(db.landmark(lose).is_none());
        let kept = db.landmark(keep).unwrap();
        // kf2's observation transferred; kf1 already observed `keep`, so the
        // duplicate slot was cleared.
        assert!(kept.is_observed_in(kf2));
        assert_eq!(db.keyframe(kf1).unwrap().landmark_at(1), None);
        assert_eq!(db.keyframe(kf2).unwrap().landmark_at(4), Some(keep));
        // Forwarding chain resolves.
        assert_eq!(db.resolve_landmark(lose), Some(keep));
    }

    #[test]
    fn test_covisibility_matches_shared_landmarks_after_erase() {
        // Weights must track the actual shared-landmark count across erases.
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 40);
        let kf2 = insert_keyframe(&mut db, 40);
        let mut lms = Vec::new();
        for i in 0..17 {
            lms.push(insert_landmark(
                &mut db,
                Vector3::new(0.0, 0.0, 4.0),
                &[(kf1, i), (kf2, i)],
            ));
        }
        db.update_connections(kf1);
        assert_eq!(db.keyframe(kf1).unwrap().connection_weight(kf2), 17);

        db.erase_landmark(lms[0]);
        db.update_connections(kf1);
        assert_eq!(db.keyframe(kf1).unwrap().connection_weight(kf2), 16);
        assert_eq!(db.keyframe(kf2).unwrap().connection_weight(kf1), 16);
    }

    #[test]
    fn test_clear() {
        let mut db = MapDatabase::new();
        let kf1 = insert_keyframe(&mut db, 10);
        insert_landmark(&mut db, Vector3::new(0.0, 0.0, 5.0), &[(kf1, 0)]);
        db.clear();
        assert_eq!(db.num_keyframes(), 0);
        assert_eq!(db.num_landmarks(), 0);
        assert_eq!(db.origin_keyframe(), None);
        // Ids restart.
        assert_eq!(db.next_keyframe_id(), KeyframeId(0));
    }
}
