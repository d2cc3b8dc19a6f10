//! BoW inverted index over keyframes.
//!
//! Maps visual words to the keyframes whose BoW vector contains them.
//! Retrieval prefilters by shared-word count, scores the survivors, then
//! clusters them over the covisibility graph so one strong region does not
//! flood the candidate list.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::bow::{self, BowVector, WordId};

use super::database::MapDatabase;
use super::types::KeyframeId;

/// Candidates must share more than this fraction of the best candidate's
/// common-word count with the query.
const MIN_COMMON_WORD_RATIO: f64 = 0.8;

/// Clusters must accumulate at least this fraction of the best cluster score.
const CLUSTER_SCORE_RATIO: f64 = 0.8;

/// Covisibility neighbors considered per cluster.
const CLUSTER_NEIGHBORS: usize = 10;

/// Inverted file: word → posting list of keyframes.
#[derive(Debug, Default)]
pub struct BowDatabase {
    inverted_file: HashMap<WordId, Vec<KeyframeId>>,
}

impl BowDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kf_id: KeyframeId, bow: &BowVector) {
        for &word in bow.keys() {
            self.inverted_file.entry(word).or_default().push(kf_id);
        }
    }

    pub fn erase(&mut self, kf_id: KeyframeId, bow: &BowVector) {
        for word in bow.keys() {
            if let Some(postings) = self.inverted_file.get_mut(word) {
                postings.retain(|&id| id != kf_id);
                if postings.is_empty() {
                    self.inverted_file.remove(word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
    }

    /// Loop-closure candidates for `query_bow`.
    ///
    /// Keyframes in `excluded` (the query's direct covisibility neighborhood
    /// plus itself) never appear; surviving candidates must score at least
    /// `min_score` against the query.
    pub fn acquire_loop_candidates(
        &self,
        query_bow: &BowVector,
        excluded: &HashSet<KeyframeId>,
        min_score: f64,
        map: &MapDatabase,
    ) -> Vec<KeyframeId> {
        self.acquire_candidates(query_bow, excluded, min_score, map)
    }

    /// Relocalization candidates: same retrieval with no exclusion set and no
    /// score floor.
    pub fn acquire_relocalization_candidates(
        &self,
        query_bow: &BowVector,
        map: &MapDatabase,
    ) -> Vec<KeyframeId> {
        self.acquire_candidates(query_bow, &HashSet::new(), 0.0, map)
    }

    fn acquire_candidates(
        &self,
        query_bow: &BowVector,
        excluded: &HashSet<KeyframeId>,
        min_score: f64,
        map: &MapDatabase,
    ) -> Vec<KeyframeId> {
        // Pass 1: shared-word counts over the posting lists.
        let mut num_common_words: HashMap<KeyframeId, usize> = HashMap::new();
        for word in query_bow.keys() {
            if let Some(postings) = self.inverted_file.get(word) {
                for &kf_id in postings {
                    if excluded.contains(&kf_id) {
                        continue;
                    }
                    *num_common_words.entry(kf_id).or_insert(0) += 1;
                }
            }
        }
        if num_common_words.is_empty() {
            return Vec::new();
        }

        // Pass 2: score candidates sharing enough words.
        let max_common = *num_common_words.values().max().expect("non-empty");
        let min_common = (MIN_COMMON_WORD_RATIO * max_common as f64) as usize;

        let mut scores: HashMap<KeyframeId, f64> = HashMap::new();
        for (&kf_id, &common) in &num_common_words {
            if common <= min_common {
                continue;
            }
            let kf = match map.keyframe(kf_id) {
                Some(kf) if !kf.is_bad => kf,
                _ => continue,
            };
            let Some(kf_bow) = kf.bow.as_ref() else {
                continue;
            };
            let score = bow::score(query_bow, kf_bow);
            if score >= min_score {
                scores.insert(kf_id, score);
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // Pass 3: accumulate scores over covisibility clusters.
        let mut clusters: Vec<(KeyframeId, f64)> = Vec::new();
        let mut best_accumulated = 0.0f64;
        for (&kf_id, &score) in &scores {
            let neighbors = map
                .keyframe(kf_id)
                .map(|kf| kf.top_covisibilities_readonly(CLUSTER_NEIGHBORS))
                .unwrap_or_default();

            let mut accumulated = score;
            let mut best_member = kf_id;
            let mut best_member_score = score;
            for neighbor in neighbors {
                if let Some(&neighbor_score) = scores.get(&neighbor) {
                    accumulated += neighbor_score;
                    if neighbor_score > best_member_score {
                        best_member = neighbor;
                        best_member_score = neighbor_score;
                    }
                }
            }
            best_accumulated = best_accumulated.max(accumulated);
            clusters.push((best_member, accumulated));
        }

        // Pass 4: keep clusters close to the best one; report each best
        // member once.
        let threshold = CLUSTER_SCORE_RATIO * best_accumulated;
        let mut seen = HashSet::new();
        let mut out: Vec<KeyframeId> = clusters
            .into_iter()
            .filter(|(_, accumulated)| *accumulated > threshold)
            .filter_map(|(member, _)| seen.insert(member).then_some(member))
            .collect();
        out.sort();
        debug!(candidates = out.len(), "bow retrieval");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use nalgebra::Vector3;

    fn bow_of(words: &[(u32, f64)]) -> BowVector {
        let mut v = BowVector::new();
        for &(w, weight) in words {
            v.insert(w, weight);
        }
        v
    }

    /// Build a map with three keyframes carrying BoW vectors, the first two
    /// covisible.
    fn setup() -> (MapDatabase, BowDatabase, Vec<KeyframeId>) {
        let mut map = MapDatabase::new();
        let mut bow_db = BowDatabase::new();

        let kfs: Vec<KeyframeId> = (0..3).map(|_| insert_keyframe(&mut map, 40)).collect();
        for i in 0..20 {
            insert_landmark(
                &mut map,
                Vector3::new(0.0, 0.0, 3.0),
                &[(kfs[0], i), (kfs[1], i)],
            );
        }
        map.update_connections(kfs[0]);
        map.update_connections(kfs[1]);

        let bows = [
            bow_of(&[(1, 0.5), (2, 0.5)]),
            bow_of(&[(1, 0.4), (2, 0.4), (3, 0.2)]),
            bow_of(&[(9, 1.0)]),
        ];
        for (kf_id, bow) in kfs.iter().zip(bows.iter()) {
            map.keyframe_mut(*kf_id).unwrap().bow = Some(bow.clone());
            bow_db.add(*kf_id, bow);
        }
        (map, bow_db, kfs)
    }

    #[test]
    fn test_relocalization_retrieval_finds_similar() {
        let (map, bow_db, kfs) = setup();
        let query = bow_of(&[(1, 0.6), (2, 0.4)]);
        let candidates = bow_db.acquire_relocalization_candidates(&query, &map);
        assert!(candidates.contains(&kfs[0]) || candidates.contains(&kfs[1]));
        assert!(!candidates.contains(&kfs[2]));
    }

    #[test]
    fn test_loop_retrieval_respects_exclusion() {
        let (map, bow_db, kfs) = setup();
        let query = bow_of(&[(1, 0.6), (2, 0.4)]);
        let excluded: HashSet<KeyframeId> = kfs.iter().copied().collect();
        let candidates = bow_db.acquire_loop_candidates(&query, &excluded, 0.0, &map);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_min_score_filters() {
        let (map, bow_db, _) = setup();
        let query = bow_of(&[(1, 0.6), (2, 0.4)]);
        let candidates = bow_db.acquire_loop_candidates(&query, &HashSet::new(), 10.0, &map);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_erase_removes_postings() {
        let (map, mut bow_db, kfs) = setup();
        let bow = map.keyframe(kfs[0]).unwrap().bow.clone().unwrap();
        bow_db.erase(kfs[0], &bow);
        let query = bow_of(&[(1, 1.0)]);
        let candidates = bow_db.acquire_relocalization_candidates(&query, &map);
        assert!(!candidates.contains(&kfs[0]));
    }
}
