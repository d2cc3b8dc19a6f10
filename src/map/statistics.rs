//! Frame statistics: per-frame trajectory records.
//!
//! Each tracked frame stores its pose relative to a reference keyframe, so
//! the recovered trajectory reflects keyframe pose updates from BA and loop
//! closure without revisiting frames.

use std::collections::BTreeMap;

use crate::geometry::SE3;

use super::types::KeyframeId;

/// One record per processed frame.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub ref_keyframe: KeyframeId,
    /// `T_cr`: frame pose relative to the reference keyframe
    /// (`T_cw = T_cr * T_rw`).
    pub rel_pose_cr: SE3,
    pub is_lost: bool,
}

/// Trajectory bookkeeping over all frames, keyed by frame id.
#[derive(Debug, Clone, Default)]
pub struct FrameStatistics {
    records: BTreeMap<u64, FrameRecord>,
    num_lost: usize,
}

impl FrameStatistics {
    /// Record a tracked frame.
    pub fn update(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        ref_keyframe: KeyframeId,
        ref_pose_cw: &SE3,
        frame_pose_cw: &SE3,
    ) {
        let rel_pose_cr = frame_pose_cw.compose(&ref_pose_cw.inverse());
        self.records.insert(
            frame_id,
            FrameRecord {
                timestamp,
                ref_keyframe,
                rel_pose_cr,
                is_lost: false,
            },
        );
    }

    /// Record a lost frame (no pose).
    pub fn update_lost(&mut self, frame_id: u64, timestamp: f64) {
        self.num_lost += 1;
        self.records.insert(
            frame_id,
            FrameRecord {
                timestamp,
                ref_keyframe: KeyframeId(0),
                rel_pose_cr: SE3::identity(),
                is_lost: true,
            },
        );
    }

    /// Forward records referencing an erased keyframe to a surviving one.
    ///
    /// `old_pose_cw` is the erased keyframe's last pose; relative poses are
    /// rebased so the absolute pose is unchanged.
    pub fn replace_reference(
        &mut self,
        old: KeyframeId,
        new: KeyframeId,
        old_pose_cw: &SE3,
        new_pose_cw: &SE3,
    ) {
        let rebase = old_pose_cw.compose(&new_pose_cw.inverse());
        for record in self.records.values_mut() {
            if record.ref_keyframe == old {
                record.ref_keyframe = new;
                record.rel_pose_cr = record.rel_pose_cr.compose(&rebase);
            }
        }
    }

    pub fn records(&self) -> &BTreeMap<u64, FrameRecord> {
        &self.records
    }

    pub fn num_lost_frames(&self) -> usize {
        self.num_lost
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.num_lost = 0;
    }
}
