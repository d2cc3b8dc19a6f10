//! Sim(3) estimation from 3D-3D correspondences.
//!
//! Horn's closed-form absolute-orientation solution on minimal 3-point
//! samples inside a RANSAC loop with adaptive iteration count, followed by a
//! refit on all inliers. Scale is fixed to 1 for stereo/RGB-D setups where
//! depth is observable.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::Sim3;

#[derive(Debug, Clone)]
pub struct Sim3SolverConfig {
    pub max_iterations: usize,
    /// Point-to-point inlier threshold (meters).
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub fix_scale: bool,
    /// Success probability driving the adaptive iteration count.
    pub probability: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            inlier_threshold: 0.1,
            min_inliers: 20,
            fix_scale: true,
            probability: 0.99,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sim3Estimate {
    /// `points_2 ≈ sim3 · points_1`.
    pub sim3: Sim3,
    pub inliers: Vec<usize>,
    pub num_inliers: usize,
}

/// RANSAC + Horn. `None` when no model reaches the inlier floor.
pub fn estimate_sim3_ransac(
    points_1: &[Vector3<f64>],
    points_2: &[Vector3<f64>],
    config: &Sim3SolverConfig,
    seed: u64,
) -> Option<Sim3Estimate> {
    let n = points_1.len();
    if n < 3 || n != points_2.len() || n < config.min_inliers {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<Sim3Estimate> = None;
    let mut max_iterations = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iterations {
        iteration += 1;
        let sample = sample_three(&mut rng, n);
        let sample_1: Vec<Vector3<f64>> = sample.iter().map(|&i| points_1[i]).collect();
        let sample_2: Vec<Vector3<f64>> = sample.iter().map(|&i| points_2[i]).collect();

        let Some(model) = solve_horn(&sample_1, &sample_2, config.fix_scale) else {
            continue;
        };
        let inliers = find_inliers(points_1, points_2, &model, config.inlier_threshold);

        if best.as_ref().map_or(true, |b| inliers.len() > b.num_inliers) {
            let num_inliers = inliers.len();
            best = Some(Sim3Estimate {
                sim3: model,
                inliers,
                num_inliers,
            });
            if num_inliers >= config.min_inliers {
                let ratio = num_inliers as f64 / n as f64;
                max_iterations =
                    max_iterations.min(iteration + adaptive_iterations(ratio, config.probability));
            }
        }
    }

    // Refit on all inliers.
    let mut best = best?;
    if best.num_inliers >= config.min_inliers {
        let inlier_1: Vec<Vector3<f64>> = best.inliers.iter().map(|&i| points_1[i]).collect();
        let inlier_2: Vec<Vector3<f64>> = best.inliers.iter().map(|&i| points_2[i]).collect();
        if let Some(refined) = solve_horn(&inlier_1, &inlier_2, config.fix_scale) {
            let inliers = find_inliers(points_1, points_2, &refined, config.inlier_threshold);
            if inliers.len() >= best.num_inliers {
                best = Sim3Estimate {
                    sim3: refined,
                    num_inliers: inliers.len(),
                    inliers,
                };
            }
        }
    }

    (best.num_inliers >= config.min_inliers).then_some(best)
}

/// Horn's closed-form absolute orientation.
pub fn solve_horn(
    points_1: &[Vector3<f64>],
    points_2: &[Vector3<f64>],
    fix_scale: bool,
) -> Option<Sim3> {
    let n = points_1.len();
    if n < 3 {
        return None;
    }

    let centroid_1: Vector3<f64> = points_1.iter().sum::<Vector3<f64>>() / n as f64;
    let centroid_2: Vector3<f64> = points_2.iter().sum::<Vector3<f64>>() / n as f64;
    let centered_1: Vec<Vector3<f64>> = points_1.iter().map(|p| p - centroid_1).collect();
    let centered_2: Vec<Vector3<f64>> = points_2.iter().map(|p| p - centroid_2).collect();

    let scale = if fix_scale {
        1.0
    } else {
        let sum_1: f64 = centered_1.iter().map(|p| p.norm_squared()).sum();
        let sum_2: f64 = centered_2.iter().map(|p| p.norm_squared()).sum();
        if sum_1 < 1e-12 {
            return None;
        }
        (sum_2 / sum_1).sqrt()
    };

    // Rotation from the SVD of the cross-covariance.
    let mut cross = Matrix3::zeros();
    for (p1, p2) in centered_1.iter().zip(centered_2.iter()) {
        cross += p1 * p2.transpose();
    }
    let svd = cross.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for r in 0..3 {
            v[(r, 2)] = -v[(r, 2)];
        }
        rotation = v * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    let translation = centroid_2 - scale * (rotation * centroid_1);

    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

fn find_inliers(
    points_1: &[Vector3<f64>],
    points_2: &[Vector3<f64>],
    model: &Sim3,
    threshold: f64,
) -> Vec<usize> {
    let threshold_sq = threshold * threshold;
    points_1
        .iter()
        .zip(points_2.iter())
        .enumerate()
        .filter(|(_, (p1, p2))| (model.transform_point(p1) - *p2).norm_squared() < threshold_sq)
        .map(|(i, _)| i)
        .collect()
}

fn sample_three(rng: &mut StdRng, n: usize) -> [usize; 3] {
    let mut sample = [rng.gen_range(0..n), 0, 0];
    loop {
        sample[1] = rng.gen_range(0..n);
        if sample[1] != sample[0] {
            break;
        }
    }
    loop {
        sample[2] = rng.gen_range(0..n);
        if sample[2] != sample[0] && sample[2] != sample[1] {
            break;
        }
    }
    sample
}

fn adaptive_iterations(inlier_ratio: f64, probability: f64) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w3 = inlier_ratio.powi(3);
    let denom = (1.0 - w3).ln();
    if denom.abs() < 1e-12 {
        return 1;
    }
    (((1.0 - probability).ln() / denom).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn cloud(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                Vector3::new(
                    (i % 7) as f64 * 0.5 - 1.5,
                    ((i * 3) % 5) as f64 * 0.4 - 0.8,
                    2.0 + (i % 4) as f64 * 0.7,
                )
            })
            .collect()
    }

    #[test]
    fn test_horn_recovers_similarity() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.2, 1.0, -0.3)),
                0.6,
            ),
            translation: Vector3::new(1.0, -0.5, 2.0),
            scale: 1.8,
        };
        let p1 = cloud(12);
        let p2: Vec<Vector3<f64>> = p1.iter().map(|p| truth.transform_point(p)).collect();

        let est = solve_horn(&p1, &p2, false).unwrap();
        assert_relative_eq!(est.scale, truth.scale, epsilon = 1e-10);
        assert_relative_eq!(est.translation, truth.translation, epsilon = 1e-9);
        for (a, b) in p1.iter().zip(p2.iter()) {
            assert_relative_eq!(est.transform_point(a), *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_ransac_with_outliers() {
        let truth = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.3, 0.1, -0.2),
            scale: 1.0,
        };
        let p1 = cloud(40);
        let mut p2: Vec<Vector3<f64>> = p1.iter().map(|p| truth.transform_point(p)).collect();
        // Corrupt a quarter of the correspondences.
        for p in p2.iter_mut().take(10) {
            *p += Vector3::new(2.0, -1.0, 1.5);
        }

        let config = Sim3SolverConfig {
            min_inliers: 20,
            ..Default::default()
        };
        let est = estimate_sim3_ransac(&p1, &p2, &config, 7).unwrap();
        assert_eq!(est.num_inliers, 30);
        assert_relative_eq!(est.sim3.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_insufficient_inliers_rejected() {
        let p1 = cloud(25);
        // Unrelated targets.
        let p2: Vec<Vector3<f64>> = cloud(25)
            .into_iter()
            .enumerate()
            .map(|(i, p)| p * ((i % 5) as f64 + 0.5))
            .collect();
        let config = Sim3SolverConfig {
            min_inliers: 20,
            ..Default::default()
        };
        assert!(estimate_sim3_ransac(&p1, &p2, &config, 3).is_none());
    }
}
