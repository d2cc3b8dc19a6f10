//! Sim(3) pose-graph optimization.
//!
//! Optimizes keyframe poses over the essential graph — spanning tree, strong
//! covisibility (weight ≥ 100) and loop edges — after a loop has been
//! verified. Vertices are Sim(3) world→camera poses (scale 1 away from the
//! corrected neighborhood); edge measurements are the relative poses at
//! collect time, except the loop constraint which comes from the Sim(3)
//! solver. The origin keyframe is fixed.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::geometry::Sim3;
use crate::map::{KeyframeId, MapDatabase};

/// Covisibility weight for an essential-graph edge.
const ESSENTIAL_COVISIBILITY_WEIGHT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    SpanningTree,
    Covisibility,
    Loop,
    LoopConstraint,
}

#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub from: KeyframeId,
    pub to: KeyframeId,
    /// Relative measurement `S_to ∘ S_from⁻¹`.
    pub measurement: Sim3,
    pub information: f64,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct PoseGraphProblem {
    pub vertices: Vec<KeyframeId>,
    /// Initial Sim(3) pose per vertex (corrected where a correction exists).
    pub initial: HashMap<KeyframeId, Sim3>,
    pub edges: Vec<PoseGraphEdge>,
    pub fixed: KeyframeId,
    pub fix_scale: bool,
}

#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    pub optimized: HashMap<KeyframeId, Sim3>,
    /// Vertex poses at collect time, for landmark correction.
    pub initial: HashMap<KeyframeId, Sim3>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: build the essential graph.
///
/// `corrected` carries the Sim(3) poses of the loop-corrected neighborhood;
/// those vertices start from their corrected pose while measurements use the
/// map's (pre-correction) poses, so the optimization distributes the loop
/// correction over the rest of the graph. The explicit loop constraint
/// `current → loop` is added with high information.
pub fn collect_pose_graph(
    map: &MapDatabase,
    loop_kf: KeyframeId,
    current_kf: KeyframeId,
    corrected: &HashMap<KeyframeId, Sim3>,
    fix_scale: bool,
) -> Option<PoseGraphProblem> {
    let fixed = map.origin_keyframe()?;
    let vertices = map.keyframe_ids();
    if vertices.len() < 2 {
        return None;
    }

    let map_pose =
        |id: KeyframeId| -> Option<Sim3> { map.keyframe(id).map(|kf| Sim3::from_se3(kf.pose_cw())) };

    let mut initial = HashMap::new();
    for &id in &vertices {
        let pose = corrected.get(&id).cloned().or_else(|| map_pose(id))?;
        initial.insert(id, pose);
    }

    let mut edges = Vec::new();
    let mut seen: HashSet<(KeyframeId, KeyframeId)> = HashSet::new();
    let mut push_edge = |from: KeyframeId, to: KeyframeId, information: f64, kind: EdgeKind| {
        let key = if from < to { (from, to) } else { (to, from) };
        if !seen.insert(key) {
            return;
        }
        if let (Some(pose_from), Some(pose_to)) = (map_pose(from), map_pose(to)) {
            edges.push(PoseGraphEdge {
                from,
                to,
                measurement: pose_to.compose(&pose_from.inverse()),
                information,
                kind,
            });
        }
    };

    for &id in &vertices {
        let kf = map.keyframe(id)?;
        if let Some(parent) = kf.parent {
            push_edge(parent, id, 1.0, EdgeKind::SpanningTree);
        }
        for &partner in &kf.loop_edges {
            push_edge(id, partner, 1.0, EdgeKind::Loop);
        }
        for (&other, &weight) in kf.connections() {
            if weight >= ESSENTIAL_COVISIBILITY_WEIGHT {
                push_edge(id, other, weight as f64 / 100.0, EdgeKind::Covisibility);
            }
        }
    }

    // The freshly verified loop constraint: measurement from the corrected
    // current pose, not the drifted map pose.
    let loop_pose = map_pose(loop_kf)?;
    let corrected_current = corrected
        .get(&current_kf)
        .cloned()
        .or_else(|| map_pose(current_kf))?;
    edges.push(PoseGraphEdge {
        from: loop_kf,
        to: current_kf,
        measurement: corrected_current.compose(&loop_pose.inverse()),
        information: 100.0,
        kind: EdgeKind::LoopConstraint,
    });

    Some(PoseGraphProblem {
        vertices,
        initial,
        edges,
        fixed,
        fix_scale,
    })
}

/// PHASE 2: damped Gauss-Newton over the Sim(3) tangents with numerical
/// Jacobians (central differences).
pub fn solve_pose_graph(
    problem: &PoseGraphProblem,
    max_iterations: usize,
    should_abort: &dyn Fn() -> bool,
) -> Option<PoseGraphResult> {
    let params_per_pose = if problem.fix_scale { 6 } else { 7 };
    let free: Vec<KeyframeId> = problem
        .vertices
        .iter()
        .copied()
        .filter(|&id| id != problem.fixed)
        .collect();
    if free.is_empty() {
        return None;
    }
    let param_offset: HashMap<KeyframeId, usize> = free
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i * params_per_pose))
        .collect();
    let num_params = free.len() * params_per_pose;

    let mut poses: HashMap<KeyframeId, Sim3> = problem.initial.clone();
    let initial_error = graph_error(problem, &poses);

    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut current_error = initial_error;

    for _ in 0..max_iterations {
        if should_abort() {
            break;
        }

        let (residuals, jacobian) =
            linearize(problem, &poses, &param_offset, params_per_pose, num_params);
        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < 1e-9 {
            break;
        }
        let jtj = jacobian.transpose() * &jacobian;

        let mut accepted = false;
        for _ in 0..6 {
            let mut damped = jtj.clone();
            for i in 0..num_params {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-9);
            }
            let Some(step) = damped.lu().solve(&(-&gradient)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = apply_step(&poses, &free, &step, params_per_pose);
            let error = graph_error(problem, &candidate);
            if error < current_error {
                poses = candidate;
                current_error = error;
                lambda = (lambda * 0.3).max(1e-12);
                accepted = true;
                break;
            }
            lambda *= 10.0;
        }
        if !accepted {
            break;
        }
        iterations += 1;
    }

    debug!(
        iterations,
        initial_error,
        final_error = current_error,
        "pose graph optimized"
    );
    Some(PoseGraphResult {
        optimized: poses,
        initial: problem.initial.clone(),
        iterations,
        initial_error,
        final_error: current_error,
    })
}

/// PHASE 3: write optimized poses back and drag each landmark along its
/// reference keyframe's correction.
pub fn apply_pose_graph_results(map: &mut MapDatabase, result: &PoseGraphResult) -> usize {
    let mut updated = 0;

    // Landmarks first: their correction needs the pre-update reference pose.
    let landmark_ids = map.landmark_ids();
    for lm_id in landmark_ids {
        let Some(lm) = map.landmark(lm_id) else {
            continue;
        };
        if lm.is_bad {
            continue;
        }
        let reference = lm.ref_keyframe;
        let (Some(initial), Some(optimized)) =
            (result.initial.get(&reference), result.optimized.get(&reference))
        else {
            continue;
        };
        let corrected = optimized
            .inverse()
            .transform_point(&initial.transform_point(&lm.position));
        if let Some(lm) = map.landmark_mut(lm_id) {
            lm.position = corrected;
        }
    }

    for (kf_id, sim3) in &result.optimized {
        if let Some(kf) = map.keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.set_pose_cw(sim3.to_se3());
                updated += 1;
            }
        }
    }

    let landmark_ids = map.landmark_ids();
    for lm_id in landmark_ids {
        map.update_landmark_geometry(lm_id);
    }
    updated
}

fn pose_of<'a>(
    poses: &'a HashMap<KeyframeId, Sim3>,
    id: KeyframeId,
) -> &'a Sim3 {
    poses.get(&id).expect("all graph vertices have poses")
}

fn edge_error_vec(edge: &PoseGraphEdge, poses: &HashMap<KeyframeId, Sim3>) -> [f64; 7] {
    let predicted = pose_of(poses, edge.to).compose(&pose_of(poses, edge.from).inverse());
    edge.measurement.inverse().compose(&predicted).log()
}

/// Edge error with one vertex replaced by a perturbed pose.
fn edge_error_perturbed(
    edge: &PoseGraphEdge,
    poses: &HashMap<KeyframeId, Sim3>,
    vertex: KeyframeId,
    perturbed: &Sim3,
) -> [f64; 7] {
    let pose_from = if edge.from == vertex {
        perturbed
    } else {
        pose_of(poses, edge.from)
    };
    let pose_to = if edge.to == vertex {
        perturbed
    } else {
        pose_of(poses, edge.to)
    };
    let predicted = pose_to.compose(&pose_from.inverse());
    edge.measurement.inverse().compose(&predicted).log()
}

fn graph_error(problem: &PoseGraphProblem, poses: &HashMap<KeyframeId, Sim3>) -> f64 {
    let dims = if problem.fix_scale { 6 } else { 7 };
    problem
        .edges
        .iter()
        .map(|edge| {
            let e = edge_error_vec(edge, poses);
            edge.information * e.iter().take(dims).map(|v| v * v).sum::<f64>()
        })
        .sum()
}

fn linearize(
    problem: &PoseGraphProblem,
    poses: &HashMap<KeyframeId, Sim3>,
    param_offset: &HashMap<KeyframeId, usize>,
    params_per_pose: usize,
    num_params: usize,
) -> (DVector<f64>, DMatrix<f64>) {
    let num_residuals = problem.edges.len() * params_per_pose;
    let mut residuals = DVector::zeros(num_residuals);
    let mut jacobian = DMatrix::zeros(num_residuals, num_params);
    let eps = 1e-6;

    for (edge_idx, edge) in problem.edges.iter().enumerate() {
        let weight = edge.information.sqrt();
        let row = edge_idx * params_per_pose;
        let e0 = edge_error_vec(edge, poses);
        for r in 0..params_per_pose {
            residuals[row + r] = weight * e0[r];
        }

        for vertex in [edge.from, edge.to] {
            let Some(&col) = param_offset.get(&vertex) else {
                continue;
            };
            for p in 0..params_per_pose {
                let mut tangent = [0.0; 7];
                tangent[p] = eps;
                let plus = Sim3::exp(&tangent).compose(pose_of(poses, vertex));
                let e_plus = edge_error_perturbed(edge, poses, vertex, &plus);

                tangent[p] = -eps;
                let minus = Sim3::exp(&tangent).compose(pose_of(poses, vertex));
                let e_minus = edge_error_perturbed(edge, poses, vertex, &minus);

                for r in 0..params_per_pose {
                    jacobian[(row + r, col + p)] = weight * (e_plus[r] - e_minus[r]) / (2.0 * eps);
                }
            }
        }
    }
    (residuals, jacobian)
}

fn apply_step(
    poses: &HashMap<KeyframeId, Sim3>,
    free: &[KeyframeId],
    step: &DVector<f64>,
    params_per_pose: usize,
) -> HashMap<KeyframeId, Sim3> {
    let mut out = poses.clone();
    for (i, &id) in free.iter().enumerate() {
        let offset = i * params_per_pose;
        let mut tangent = [0.0; 7];
        for p in 0..params_per_pose {
            tangent[p] = step[offset + p];
        }
        out.insert(id, Sim3::exp(&tangent).compose(pose_of(poses, id)));
    }
    out
}
