//! Loop-candidate detection.
//!
//! Candidates come from the BoW index: the score floor is the worst score
//! between the query and its own covisibility neighbors (a place the camera
//! demonstrably revisits must look at least as similar as the current
//! neighborhood does). A candidate region must then survive three
//! consecutive queries before it is handed to geometric verification.

use std::collections::HashSet;

use tracing::debug;

use crate::bow;
use crate::map::{BowDatabase, KeyframeId, MapDatabase};

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Consecutive detections required for a candidate region.
    pub min_continuity: usize,
    /// Keyframes younger than this id gap are never loop candidates.
    pub min_keyframe_gap: u64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_continuity: 3,
            min_keyframe_gap: 10,
        }
    }
}

/// Candidate regions carried between queries for the continuity check.
#[derive(Debug, Default)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    /// Previously seen candidate regions with their continuity counts.
    continuous_regions: Vec<(HashSet<KeyframeId>, usize)>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            continuous_regions: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.continuous_regions.clear();
    }

    /// Detect a validated loop candidate for `kf_id`, if any.
    pub fn detect(
        &mut self,
        kf_id: KeyframeId,
        map: &MapDatabase,
        bow_db: &BowDatabase,
    ) -> Option<KeyframeId> {
        let kf = map.keyframe(kf_id)?;
        let query_bow = kf.bow.as_ref()?.clone();

        // Exclusion set: the query and its direct covisibility neighborhood.
        let mut excluded: HashSet<KeyframeId> = HashSet::new();
        excluded.insert(kf_id);
        let neighbors = kf.top_covisibilities_readonly(usize::MAX);
        excluded.extend(neighbors.iter().copied());

        // Score floor from the covisibility neighborhood.
        let mut min_score = 1.0f64;
        let mut num_scored = 0;
        for &neighbor in &neighbors {
            if let Some(neighbor_bow) = map.keyframe(neighbor).and_then(|kf| kf.bow.as_ref()) {
                min_score = min_score.min(bow::score(&query_bow, neighbor_bow));
                num_scored += 1;
            }
        }
        if num_scored == 0 {
            self.continuous_regions.clear();
            return None;
        }

        let candidates: Vec<KeyframeId> = bow_db
            .acquire_loop_candidates(&query_bow, &excluded, min_score, map)
            .into_iter()
            .filter(|candidate| kf_id.0.saturating_sub(candidate.0) >= self.config.min_keyframe_gap)
            .collect();
        if candidates.is_empty() {
            self.continuous_regions.clear();
            return None;
        }
        debug!(keyframe = %kf_id, candidates = candidates.len(), min_score, "loop candidates");

        // Continuity: a candidate's region (itself + covisibles) must overlap
        // a region seen in the previous query, three times in a row.
        let mut next_regions: Vec<(HashSet<KeyframeId>, usize)> = Vec::new();
        let mut validated: Option<KeyframeId> = None;

        for &candidate in &candidates {
            let mut region: HashSet<KeyframeId> = HashSet::new();
            region.insert(candidate);
            if let Some(kf) = map.keyframe(candidate) {
                region.extend(kf.top_covisibilities_readonly(10));
            }

            let mut continuity = 1;
            for (previous_region, previous_count) in &self.continuous_regions {
                if !region.is_disjoint(previous_region) {
                    continuity = continuity.max(previous_count + 1);
                }
            }
            if continuity >= self.config.min_continuity && validated.is_none() {
                validated = Some(candidate);
            }
            next_regions.push((region, continuity));
        }

        self.continuous_regions = next_regions;
        if validated.is_some() {
            // Start over so the same loop does not re-fire immediately.
            self.continuous_regions.clear();
        }
        validated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bow::BowVector;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use nalgebra::Vector3;

    fn bow_of(words: &[(u32, f64)]) -> BowVector {
        words.iter().copied().collect()
    }

    /// A map where keyframes 0..=2 form one region and keyframe 20 revisits
    /// it: same words, no covisibility link.
    fn revisit_map() -> (MapDatabase, BowDatabase, KeyframeId, KeyframeId) {
        let mut map = MapDatabase::new();
        let mut bow_db = BowDatabase::new();

        let old: Vec<KeyframeId> = (0..3).map(|_| insert_keyframe(&mut map, 40)).collect();
        for i in 0..20 {
            insert_landmark(
                &mut map,
                Vector3::new(0.0, 0.0, 3.0),
                &[(old[0], i), (old[1], i), (old[2], i)],
            );
        }
        for &kf in &old {
            map.update_connections(kf);
        }
        // Fill the id gap so the candidate is temporally distant.
        let mut current = old[0];
        for _ in 0..18 {
            current = insert_keyframe(&mut map, 40);
        }
        // The current keyframe shares landmarks with its immediate
        // predecessor only.
        let prev = KeyframeId(current.0 - 1);
        for i in 0..20 {
            insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(prev, i), (current, i)]);
        }
        map.update_connections(prev);
        map.update_connections(current);

        let place_words = bow_of(&[(1, 0.4), (2, 0.3), (3, 0.3)]);
        for &kf in &old {
            map.keyframe_mut(kf).unwrap().bow = Some(place_words.clone());
            bow_db.add(kf, &place_words);
        }
        // Current and its neighbor see the same place.
        for kf in [prev, current] {
            map.keyframe_mut(kf).unwrap().bow = Some(place_words.clone());
            bow_db.add(kf, &place_words);
        }
        (map, bow_db, current, old[0])
    }

    #[test]
    fn test_loop_requires_three_consecutive_detections() {
        let (map, bow_db, current, loop_kf) = revisit_map();
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());

        // Two detections: still building continuity.
        assert!(detector.detect(current, &map, &bow_db).is_none());
        assert!(detector.detect(current, &map, &bow_db).is_none());
        // Third consecutive detection validates the candidate region.
        let validated = detector.detect(current, &map, &bow_db);
        assert!(validated.is_some());
        // The validated candidate comes from the revisited region.
        let region: Vec<KeyframeId> = (0..3).map(|i| KeyframeId(loop_kf.0 + i)).collect();
        assert!(region.contains(&validated.unwrap()));
    }

    #[test]
    fn test_interrupted_continuity_resets() {
        let (map, bow_db, current, _) = revisit_map();
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        assert!(detector.detect(current, &map, &bow_db).is_none());
        detector.clear();
        assert!(detector.detect(current, &map, &bow_db).is_none());
        assert!(detector.detect(current, &map, &bow_db).is_none());
        // Continuity was interrupted, so three more rounds are needed.
        assert!(detector.detect(current, &map, &bow_db).is_some());
    }
}
