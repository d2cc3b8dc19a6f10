//! Sim(3) refinement.
//!
//! Polishes a RANSAC-estimated similarity transform over all matched point
//! pairs with a Huber kernel, then reclassifies inliers. Residuals are 3D
//! alignment errors `S·p₁ − p₂`.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::geometry::Sim3;

use super::huber_weight;

/// Pure-data refinement problem.
#[derive(Debug, Clone)]
pub struct Sim3RefineProblem {
    pub initial: Sim3,
    /// Matched pairs `(p1, p2)` with `p2 ≈ S · p1`.
    pub pairs: Vec<(Vector3<f64>, Vector3<f64>)>,
    /// Inlier threshold on the 3D alignment error (meters).
    pub inlier_threshold: f64,
    /// Keep scale at 1 (stereo/RGB-D).
    pub fix_scale: bool,
}

#[derive(Debug, Clone)]
pub struct Sim3RefineResult {
    pub sim3: Sim3,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

const MAX_ITERATIONS: usize = 20;

pub fn optimize_sim3(problem: &Sim3RefineProblem) -> Sim3RefineResult {
    let n = problem.pairs.len();
    let mut estimate = problem.initial.clone();
    let mut inliers = classify(&estimate, problem);

    if n < 3 {
        let num_inliers = inliers.iter().filter(|&&i| i).count();
        return Sim3RefineResult {
            sim3: estimate,
            inliers,
            num_inliers,
        };
    }

    let num_params = if problem.fix_scale { 6 } else { 7 };
    let delta_sq = problem.inlier_threshold * problem.inlier_threshold;
    let mut lambda = 1e-4;
    let mut current_cost = robust_cost(&estimate, problem, &inliers, delta_sq);

    for _ in 0..MAX_ITERATIONS {
        // Numerical Jacobian over the tangent (central differences).
        let active: Vec<usize> = (0..n).filter(|&i| inliers[i]).collect();
        if active.len() < 3 {
            break;
        }
        let mut jacobian = DMatrix::zeros(active.len() * 3, num_params);
        let mut residuals = DVector::zeros(active.len() * 3);

        for (row_block, &pair_idx) in active.iter().enumerate() {
            let (p1, p2) = &problem.pairs[pair_idx];
            let chi_sq = (estimate.transform_point(p1) - p2).norm_squared();
            let weight = huber_weight(chi_sq, delta_sq).sqrt();

            let e = estimate.transform_point(p1) - p2;
            for r in 0..3 {
                residuals[row_block * 3 + r] = weight * e[r];
            }

            let eps = 1e-7;
            for param in 0..num_params {
                let mut tangent_plus = [0.0; 7];
                let mut tangent_minus = [0.0; 7];
                tangent_plus[param] = eps;
                tangent_minus[param] = -eps;
                let est_plus = Sim3::exp(&tangent_plus).compose(&estimate);
                let est_minus = Sim3::exp(&tangent_minus).compose(&estimate);
                let e_plus = est_plus.transform_point(p1) - p2;
                let e_minus = est_minus.transform_point(p1) - p2;
                for r in 0..3 {
                    jacobian[(row_block * 3 + r, param)] =
                        weight * (e_plus[r] - e_minus[r]) / (2.0 * eps);
                }
            }
        }

        let jtj = jacobian.transpose() * &jacobian;
        let jtr = jacobian.transpose() * &residuals;

        let mut accepted = false;
        for _ in 0..5 {
            let mut damped = jtj.clone();
            for i in 0..num_params {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-9);
            }
            let Some(step) = damped.lu().solve(&(-&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            if step.norm() < 1e-12 {
                break;
            }
            let mut tangent = [0.0; 7];
            for p in 0..num_params {
                tangent[p] = step[p];
            }
            let candidate = Sim3::exp(&tangent).compose(&estimate);
            let cost = robust_cost(&candidate, problem, &inliers, delta_sq);
            if cost < current_cost {
                estimate = candidate;
                current_cost = cost;
                lambda = (lambda * 0.5).max(1e-10);
                accepted = true;
                break;
            }
            lambda *= 10.0;
        }
        if !accepted {
            break;
        }
        inliers = classify(&estimate, problem);
    }

    if problem.fix_scale {
        estimate.scale = 1.0;
    }
    inliers = classify(&estimate, problem);
    let num_inliers = inliers.iter().filter(|&&i| i).count();
    Sim3RefineResult {
        sim3: estimate,
        inliers,
        num_inliers,
    }
}

fn classify(estimate: &Sim3, problem: &Sim3RefineProblem) -> Vec<bool> {
    let thr_sq = problem.inlier_threshold * problem.inlier_threshold;
    problem
        .pairs
        .iter()
        .map(|(p1, p2)| (estimate.transform_point(p1) - p2).norm_squared() < thr_sq)
        .collect()
}

fn robust_cost(estimate: &Sim3, problem: &Sim3RefineProblem, inliers: &[bool], delta_sq: f64) -> f64 {
    problem
        .pairs
        .iter()
        .zip(inliers.iter())
        .filter(|(_, &inlier)| inlier)
        .map(|((p1, p2), _)| {
            let chi_sq = (estimate.transform_point(p1) - p2).norm_squared();
            if chi_sq <= delta_sq {
                chi_sq
            } else {
                2.0 * (delta_sq * chi_sq).sqrt() - delta_sq
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Unit, UnitQuaternion};

    fn true_sim3() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.1, 1.0, 0.2)),
                0.3,
            ),
            translation: Vector3::new(0.5, -0.2, 1.0),
            scale: 1.3,
        }
    }

    fn pairs(s: &Sim3, outliers: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        let mut out: Vec<(Vector3<f64>, Vector3<f64>)> = (0..30)
            .map(|i| {
                let p = Vector3::new(
                    (i % 5) as f64 * 0.4 - 1.0,
                    (i / 5) as f64 * 0.3 - 0.8,
                    2.0 + (i % 3) as f64,
                );
                (p, s.transform_point(&p))
            })
            .collect();
        for i in 0..outliers {
            out[i].1 += Vector3::new(1.0, -2.0, 0.5);
        }
        out
    }

    #[test]
    fn test_refine_from_perturbed_initial() {
        let truth = true_sim3();
        let initial = Sim3 {
            rotation: truth.rotation
                * UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::x()), 0.02),
            translation: truth.translation + Vector3::new(0.05, 0.0, -0.03),
            scale: truth.scale * 1.02,
        };
        let problem = Sim3RefineProblem {
            initial,
            pairs: pairs(&truth, 0),
            inlier_threshold: 0.1,
            fix_scale: false,
        };
        let result = optimize_sim3(&problem);
        assert_eq!(result.num_inliers, 30);
        assert_relative_eq!(result.sim3.scale, truth.scale, epsilon = 1e-5);
        assert!((result.sim3.translation - truth.translation).norm() < 1e-4);
    }

    #[test]
    fn test_outliers_excluded() {
        let truth = true_sim3();
        let problem = Sim3RefineProblem {
            initial: truth.clone(),
            pairs: pairs(&truth, 5),
            inlier_threshold: 0.1,
            fix_scale: false,
        };
        let result = optimize_sim3(&problem);
        assert_eq!(result.num_inliers, 25);
        for flag in &result.inliers[..5] {
            assert!(!flag);
        }
    }

    #[test]
    fn test_fixed_scale_stays_unit() {
        let mut truth = true_sim3();
        truth.scale = 1.0;
        let problem = Sim3RefineProblem {
            initial: Sim3 {
                translation: truth.translation + Vector3::new(0.02, 0.0, 0.0),
                ..truth.clone()
            },
            pairs: pairs(&truth, 0),
            inlier_threshold: 0.1,
            fix_scale: true,
        };
        let result = optimize_sim3(&problem);
        assert_relative_eq!(result.sim3.scale, 1.0, epsilon = 1e-12);
        assert!(result.num_inliers >= 28);
    }
}
