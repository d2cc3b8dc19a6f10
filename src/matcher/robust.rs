//! Robust matching without a pose prior.
//!
//! Brute-force descriptor matching with the ratio test, then geometric
//! verification of the surviving pairs against an essential matrix estimated
//! by 8-point RANSAC over the bearing vectors.

use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::feature::Descriptor;
use crate::geometry::epipolar::{sampson_error_sq, solve_essential_8pt};
use crate::map::Frame;

use super::{passes_ratio_test, AngleChecker, HAMMING_DIST_THR_LOW, MAX_HAMMING_DIST};

/// RANSAC iterations for the essential-matrix verification.
const RANSAC_ITERATIONS: usize = 200;

/// χ² threshold at 95% for 1 DoF (squared Sampson distance test).
const CHI_SQ_THR: f64 = 3.84;

/// Result of a robust match.
#[derive(Debug, Clone, Default)]
pub struct RobustMatchResult {
    /// (index in frame 1, index in frame 2) pairs surviving all filters.
    pub matches: Vec<(usize, usize)>,
}

/// Match two frames with no relative-pose prior.
pub fn match_frames_robust(
    frame_1: &Frame,
    frame_2: &Frame,
    lowe_ratio: f64,
    seed: u64,
) -> RobustMatchResult {
    let putative = brute_force_matches(
        &frame_1.descriptors,
        &frame_2.descriptors,
        lowe_ratio,
        |i, j| (frame_1.keypoints[i].angle, frame_2.keypoints[j].angle),
    );
    if putative.len() < 8 {
        return RobustMatchResult::default();
    }

    // Pixel noise mapped into the normalized image plane.
    let focal = frame_1.camera.focal_length_x();
    let sigma = if focal > 0.0 { 1.0 / focal } else { 1e-3 };
    let threshold = CHI_SQ_THR * sigma * sigma;

    let matches = epipolar_ransac(
        &frame_1.bearings,
        &frame_2.bearings,
        &putative,
        threshold,
        seed,
    );
    RobustMatchResult { matches }
}

/// Exhaustive descriptor matching with mutual-best pruning, the ratio test
/// and the orientation filter.
fn brute_force_matches(
    descs_1: &[Descriptor],
    descs_2: &[Descriptor],
    lowe_ratio: f64,
    angles: impl Fn(usize, usize) -> (f64, f64),
) -> Vec<(usize, usize)> {
    let mut best_for_2: Vec<(u32, usize)> = vec![(MAX_HAMMING_DIST, usize::MAX); descs_2.len()];
    let mut candidate: Vec<Option<(usize, u32)>> = vec![None; descs_1.len()];

    for (i, d1) in descs_1.iter().enumerate() {
        let mut best = MAX_HAMMING_DIST;
        let mut second = MAX_HAMMING_DIST;
        let mut best_j = None;
        for (j, d2) in descs_2.iter().enumerate() {
            let dist = d1.distance(d2);
            if dist < best {
                second = best;
                best = dist;
                best_j = Some(j);
            } else if dist < second {
                second = dist;
            }
        }
        if let Some(j) = best_j {
            if best <= HAMMING_DIST_THR_LOW && passes_ratio_test(best, second, lowe_ratio) {
                candidate[i] = Some((j, best));
                if best < best_for_2[j].0 {
                    best_for_2[j] = (best, i);
                }
            }
        }
    }

    // Mutual best: feature j keeps only its closest partner.
    let mut checker = AngleChecker::new();
    let mut matches = Vec::new();
    for (i, c) in candidate.iter().enumerate() {
        if let Some((j, _)) = c {
            if best_for_2[*j].1 == i {
                let (a1, a2) = angles(i, *j);
                checker.append(matches.len(), a1, a2);
                matches.push((i, *j));
            }
        }
    }

    let invalid: std::collections::HashSet<usize> =
        checker.invalid_matches().into_iter().collect();
    matches
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !invalid.contains(idx))
        .map(|(_, m)| m)
        .collect()
}

/// 8-point RANSAC over bearing pairs; returns the inlier subset of
/// `putative` under the best model.
fn epipolar_ransac(
    bearings_1: &[Vector3<f64>],
    bearings_2: &[Vector3<f64>],
    putative: &[(usize, usize)],
    threshold: f64,
    seed: u64,
) -> Vec<(usize, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..putative.len()).collect();
    let mut best_inliers: Vec<(usize, usize)> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        indices.shuffle(&mut rng);
        let sample: Vec<(usize, usize)> = indices[..8].iter().map(|&k| putative[k]).collect();
        let Some(e) = solve_essential_8pt(bearings_1, bearings_2, &sample) else {
            continue;
        };
        let inliers = count_inliers(&e, bearings_1, bearings_2, putative, threshold);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    // Final refit on all inliers.
    if best_inliers.len() >= 8 {
        if let Some(e) = solve_essential_8pt(bearings_1, bearings_2, &best_inliers) {
            let refined = count_inliers(&e, bearings_1, bearings_2, putative, threshold);
            if refined.len() >= best_inliers.len() {
                best_inliers = refined;
            }
        }
    }
    best_inliers
}

fn count_inliers(
    e: &Matrix3<f64>,
    bearings_1: &[Vector3<f64>],
    bearings_2: &[Vector3<f64>],
    putative: &[(usize, usize)],
    threshold: f64,
) -> Vec<(usize, usize)> {
    putative
        .iter()
        .copied()
        .filter(|&(i, j)| sampson_error_sq(e, &bearings_1[i], &bearings_2[j]) < threshold)
        .collect()
}
