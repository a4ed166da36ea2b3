//! Local bundle adjustment around the pivot keyframe.
//!
//! Runs in three phases so the solver never holds the map lock:
//! 1. COLLECT under the lock: window keyframes, their points, the fixed
//!    outside observers and all observations, copied into a `BundleProblem`.
//! 2. SOLVE without the lock through the `BundleSolver`.
//! 3. APPLY under the lock, skipping evicted keyframes and trashed points.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::map::{Frame, FrameId, MapState, Point, PointId};
use crate::optimizer::{
    BundleKeyframe, BundleObservation, BundlePoint, BundleProblem, BundleSolution, BundleSolver,
    Termination,
};
use crate::system::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOutcome {
    /// Solver converged and the estimates were updated.
    Converged,
    /// Iteration budget ran out; the improved estimates were applied.
    NotConverged,
    /// Error went up or became non-finite; nothing applied.
    Diverged,
    /// Cancelled mid-solve; nothing applied.
    Aborted,
    /// Nothing to do: no pivot, relocalizing, or too small a problem.
    Skipped,
}

impl BundleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, BundleOutcome::Converged | BundleOutcome::NotConverged)
    }
}

/// PHASE 1: COLLECT - snapshot the window around the pivot.
///
/// The pivot flag is consumed. Returns None if there is nothing worth
/// solving.
pub fn collect_problem(state: &mut MapState) -> Option<BundleProblem> {
    let pivot = state.ba_keyframe.take()?;
    let cfg = &state.config.bundle;

    let order: HashMap<FrameId, usize> = state
        .keyframes
        .iter()
        .enumerate()
        .map(|(i, k)| (k.id(), i))
        .collect();
    if !order.contains_key(&pivot.id()) {
        return None;
    }

    let mut window: Vec<Arc<Frame>> = vec![pivot.clone()];
    for id in state.graph.best_neighbors(pivot.id(), cfg.window_size.saturating_sub(1)) {
        if let Some(&i) = order.get(&id) {
            window.push(state.keyframes[i].clone());
        }
    }
    if window.len() < 2 {
        debug!("[LocalBA-LM] {} has no covisible keyframes", pivot.id());
        return None;
    }
    // Oldest first; the first one is the anchor.
    window.sort_by_key(|k| order[&k.id()]);
    let window_ids: HashSet<FrameId> = window.iter().map(|k| k.id()).collect();

    // Converged points seen by the window
    let mut points: Vec<Arc<Point>> = Vec::new();
    let mut point_index: HashMap<PointId, usize> = HashMap::new();
    for kf in &window {
        for point in kf.points() {
            if !point.is_converged() || !state.points.contains_key(&point.id()) {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(e) = point_index.entry(point.id()) {
                e.insert(points.len());
                points.push(point);
            }
        }
    }
    if points.is_empty() {
        return None;
    }

    // Outside keyframes observing those points stay fixed.
    let mut fixed: Vec<Arc<Frame>> = Vec::new();
    let mut fixed_ids: HashSet<FrameId> = HashSet::new();
    for point in &points {
        for obs in point.observations() {
            if window_ids.contains(&obs.frame_id) || fixed_ids.contains(&obs.frame_id) {
                continue;
            }
            let Some(&i) = order.get(&obs.frame_id) else {
                continue;
            };
            fixed_ids.insert(obs.frame_id);
            fixed.push(state.keyframes[i].clone());
        }
    }

    let mut problem = BundleProblem::default();
    let all = window.iter().enumerate().map(|(i, k)| (k, i == 0)).chain(fixed.iter().map(|k| (k, true)));
    for (kf, is_fixed) in all {
        let k = problem.keyframes.len();
        problem.keyframes.push(BundleKeyframe {
            id: kf.id(),
            pose_cw: kf.pose().inverse(),
            camera: *kf.camera(),
            fixed: is_fixed,
        });
        for feature in kf.features().iter() {
            if let Some(&p) = point_index.get(&feature.point.id()) {
                problem.observations.push(BundleObservation {
                    keyframe: k,
                    point: p,
                    pixel: feature.pixel,
                });
            }
        }
    }
    problem.points = points
        .iter()
        .map(|p| BundlePoint {
            id: p.id(),
            position: p.position(),
        })
        .collect();

    if problem.observations.len() < cfg.min_observations {
        debug!(
            "[LocalBA-LM] {} observations around {}, need {}",
            problem.observations.len(),
            pivot.id(),
            cfg.min_observations
        );
        return None;
    }
    Some(problem)
}

/// Classify a solver result.
pub fn classify(solution: &BundleSolution) -> BundleOutcome {
    if solution.termination == Termination::Aborted {
        return BundleOutcome::Aborted;
    }
    if !solution.final_error.is_finite() || solution.final_error > solution.initial_error {
        return BundleOutcome::Diverged;
    }
    match solution.termination {
        Termination::Converged => BundleOutcome::Converged,
        _ => BundleOutcome::NotConverged,
    }
}

/// PHASE 3: APPLY - write the solution back. Returns the number of updated
/// entities.
pub fn apply_solution(state: &MapState, solution: &BundleSolution) -> usize {
    let mut updated = 0;

    let keyframes: HashMap<FrameId, &Arc<Frame>> = state.keyframes.iter().map(|k| (k.id(), k)).collect();
    for (id, pose) in &solution.poses {
        // Skip silently if the keyframe was evicted during BA
        if let Some(kf) = keyframes.get(id) {
            kf.set_pose(*pose);
            updated += 1;
        }
    }

    for (id, position) in &solution.points {
        if let Some(point) = state.points.get(id) {
            if !point.is_trashed() && position.iter().all(|v| v.is_finite()) {
                point.set_position(*position);
                updated += 1;
            }
        }
    }

    updated
}

/// Run one local bundle adjustment around the flagged pivot keyframe.
pub fn bundle_adjustment(shared: &SharedState, solver: &dyn BundleSolver) -> BundleOutcome {
    if shared.is_relocalizing() {
        return BundleOutcome::Skipped;
    }

    let problem = {
        let mut state = shared.lock();
        collect_problem(&mut state)
    };
    let Some(problem) = problem else {
        return BundleOutcome::Skipped;
    };

    let should_stop = || shared.is_shutdown_requested();
    let Some(solution) = solver.optimize(&problem, &should_stop) else {
        return BundleOutcome::Skipped;
    };

    let outcome = classify(&solution);
    match outcome {
        BundleOutcome::Converged | BundleOutcome::NotConverged
            if solution.final_error >= solution.initial_error =>
        {
            debug!(
                "[LocalBA-LM] no improvement ({:.4} px), estimates kept",
                solution.initial_error
            );
        }
        BundleOutcome::Converged | BundleOutcome::NotConverged => {
            let state = shared.lock();
            let updated = apply_solution(&state, &solution);
            info!(
                "[LocalBA-LM] {:?} after {} iterations: {:.4} -> {:.4} px ({} keyframes, {} points, {} updated)",
                outcome,
                solution.iterations,
                solution.initial_error,
                solution.final_error,
                problem.num_optimized_keyframes(),
                problem.points.len(),
                updated
            );
        }
        BundleOutcome::Diverged => warn!(
            "[LocalBA-LM] diverged: {:.4} -> {:.4} px, estimates kept",
            solution.initial_error, solution.final_error
        ),
        BundleOutcome::Aborted => debug!("[LocalBA-LM] aborted after {} iterations", solution.iterations),
        BundleOutcome::Skipped => {}
    }
    outcome
}
