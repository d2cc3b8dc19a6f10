//! Hierarchical binary vocabulary tree.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{normalize, BowVector, FeatureVector, NodeId, WordId};
use crate::error::{Error, Result};
use crate::feature::Descriptor;

/// A node of the vocabulary tree. `nodes[0]` is the root.
#[derive(Debug, Clone)]
struct Node {
    parent: NodeId,
    children: Vec<NodeId>,
    descriptor: Descriptor,
    /// IDF weight; non-zero only for leaves.
    weight: f64,
    word_id: Option<WordId>,
}

/// Vocabulary tree over 256-bit descriptors.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    nodes: Vec<Node>,
    /// word id → node id.
    words: Vec<NodeId>,
    branching: usize,
    depth: usize,
}

impl Vocabulary {
    /// Number of visual words (leaves).
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn branching_factor(&self) -> usize {
        self.branching
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Quantize one descriptor to its visual word, also reporting the node it
    /// passes through `levels_up` levels above the leaves.
    pub fn quantize(&self, descriptor: &Descriptor, levels_up: usize) -> (WordId, NodeId) {
        let target_level = self.depth.saturating_sub(levels_up);
        let mut node_id: NodeId = 0;
        let mut level = 0usize;
        let mut node_at_level: NodeId = 0;

        while !self.nodes[node_id as usize].children.is_empty() {
            let children = &self.nodes[node_id as usize].children;
            let mut best_child = children[0];
            let mut best_dist = u32::MAX;
            for &child in children {
                let d = descriptor.distance(&self.nodes[child as usize].descriptor);
                if d < best_dist {
                    best_dist = d;
                    best_child = child;
                }
            }
            node_id = best_child;
            level += 1;
            if level == target_level {
                node_at_level = node_id;
            }
        }
        if target_level == 0 || level < target_level {
            node_at_level = node_id;
        }

        let word_id = self.nodes[node_id as usize].word_id.unwrap_or(0);
        (word_id, node_at_level)
    }

    /// Transform a descriptor set into its BoW and feature vectors.
    ///
    /// `levels_up` selects the feature-vector grouping depth (4 is the usual
    /// choice for a depth-5/6 tree, giving coarse groups for lockstep
    /// matching).
    pub fn transform(
        &self,
        descriptors: &[Descriptor],
        levels_up: usize,
    ) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();

        for (idx, desc) in descriptors.iter().enumerate() {
            let (word_id, node_id) = self.quantize(desc, levels_up);
            let weight = self.nodes[self.words[word_id as usize] as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
            features.entry(node_id).or_default().push(idx);
        }

        normalize(&mut bow);
        (bow, features)
    }

    /// Build a synthetic vocabulary with uniformly random centroids.
    ///
    /// Deterministic for a given seed. All leaf weights are 1 (no IDF
    /// statistics without a training corpus); scores remain comparable
    /// because BoW vectors are L1-normalized.
    pub fn synthetic(branching: usize, depth: usize, seed: u64) -> Self {
        assert!(branching >= 2 && depth >= 1);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![Node {
            parent: u32::MAX,
            children: Vec::new(),
            descriptor: Descriptor::ZERO,
            weight: 0.0,
            word_id: None,
        }];
        let mut words = Vec::new();

        // Breadth-first expansion level by level.
        let mut frontier: Vec<NodeId> = vec![0];
        for level in 0..depth {
            let mut next = Vec::new();
            for &parent in &frontier {
                for _ in 0..branching {
                    let mut desc = Descriptor::ZERO;
                    for byte in desc.0.iter_mut() {
                        *byte = rng.gen();
                    }
                    let id = nodes.len() as NodeId;
                    let is_leaf = level + 1 == depth;
                    let word_id = if is_leaf {
                        words.push(id);
                        Some((words.len() - 1) as WordId)
                    } else {
                        None
                    };
                    nodes.push(Node {
                        parent,
                        children: Vec::new(),
                        descriptor: desc,
                        weight: if is_leaf { 1.0 } else { 0.0 },
                        word_id,
                    });
                    nodes[parent as usize].children.push(id);
                    next.push(id);
                }
            }
            frontier = next;
        }

        Self {
            nodes,
            words,
            branching,
            depth,
        }
    }

    /// Load a vocabulary in the DBoW2 text format:
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf d0 d1 ... d31 weight
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| Error::ConfigInvalid("empty vocabulary file".into()))??;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(Error::ConfigInvalid(
                "vocabulary header must be: k L [scoring weighting]".into(),
            ));
        }
        let branching: usize = header_parts[0]
            .parse()
            .map_err(|_| Error::ConfigInvalid("invalid vocabulary branching factor".into()))?;
        let depth: usize = header_parts[1]
            .parse()
            .map_err(|_| Error::ConfigInvalid("invalid vocabulary depth".into()))?;

        let mut nodes = vec![Node {
            parent: u32::MAX,
            children: Vec::new(),
            descriptor: Descriptor::ZERO,
            weight: 0.0,
            word_id: None,
        }];
        let mut words = Vec::new();

        for (line_num, line) in lines.enumerate() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            // parent is_leaf 32 descriptor bytes weight = 35 fields.
            if parts.len() < 35 {
                continue;
            }
            let parse = |s: &str, what: &str| -> Result<f64> {
                s.parse().map_err(|_| {
                    Error::ConfigInvalid(format!("invalid {} at vocabulary line {}", what, line_num + 2))
                })
            };
            let parent = parse(parts[0], "parent id")? as NodeId;
            let is_leaf = parse(parts[1], "leaf flag")? != 0.0;
            let mut descriptor = Descriptor::ZERO;
            for (i, byte) in descriptor.0.iter_mut().enumerate() {
                *byte = parse(parts[2 + i], "descriptor byte")? as u8;
            }
            let weight = parse(parts[34], "weight")?;

            let id = nodes.len() as NodeId;
            if parent as usize >= nodes.len() {
                return Err(Error::ConfigInvalid(format!(
                    "vocabulary line {} references unknown parent {}",
                    line_num + 2,
                    parent
                )));
            }
            let word_id = if is_leaf {
                words.push(id);
                Some((words.len() - 1) as WordId)
            } else {
                None
            };
            nodes.push(Node {
                parent,
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
            nodes[parent as usize].children.push(id);
        }

        if words.is_empty() {
            return Err(Error::ConfigInvalid("vocabulary has no leaf words".into()));
        }

        Ok(Self {
            nodes,
            words,
            branching,
            depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn random_descriptor(rng: &mut StdRng) -> Descriptor {
        let mut d = Descriptor::ZERO;
        for byte in d.0.iter_mut() {
            *byte = rng.gen();
        }
        d
    }

    #[test]
    fn test_synthetic_structure() {
        let vocab = Vocabulary::synthetic(3, 3, 42);
        assert_eq!(vocab.num_words(), 27);
        assert_eq!(vocab.branching_factor(), 3);
    }

    #[test]
    fn test_quantize_is_deterministic() {
        let vocab = Vocabulary::synthetic(4, 3, 7);
        let mut rng = StdRng::seed_from_u64(1);
        let d = random_descriptor(&mut rng);
        let (w1, n1) = vocab.quantize(&d, 1);
        let (w2, n2) = vocab.quantize(&d, 1);
        assert_eq!(w1, w2);
        assert_eq!(n1, n2);
        assert!((w1 as usize) < vocab.num_words());
    }

    #[test]
    fn test_transform_normalized_and_grouped() {
        let vocab = Vocabulary::synthetic(4, 3, 7);
        let mut rng = StdRng::seed_from_u64(2);
        let descs: Vec<Descriptor> = (0..50).map(|_| random_descriptor(&mut rng)).collect();
        let (bow, features) = vocab.transform(&descs, 2);

        assert_relative_eq!(bow.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        let total: usize = features.values().map(|v| v.len()).sum();
        assert_eq!(total, 50);

        // Identical descriptor sets give identical vectors (self-score 1).
        let (bow2, _) = vocab.transform(&descs, 2);
        assert_relative_eq!(crate::bow::score(&bow, &bow2), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_similar_sets_score_higher_than_disjoint() {
        let vocab = Vocabulary::synthetic(5, 3, 3);
        let mut rng = StdRng::seed_from_u64(9);
        let base: Vec<Descriptor> = (0..40).map(|_| random_descriptor(&mut rng)).collect();
        let other: Vec<Descriptor> = (0..40).map(|_| random_descriptor(&mut rng)).collect();

        // Perturb a few bits of the base set.
        let mut perturbed = base.clone();
        for d in perturbed.iter_mut() {
            d.set_bit(0, !d.bit(0));
        }

        let (bow_base, _) = vocab.transform(&base, 1);
        let (bow_pert, _) = vocab.transform(&perturbed, 1);
        let (bow_other, _) = vocab.transform(&other, 1);

        let s_similar = crate::bow::score(&bow_base, &bow_pert);
        let s_random = crate::bow::score(&bow_base, &bow_other);
        assert!(s_similar > s_random);
    }
}
