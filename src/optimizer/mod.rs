//! Bundle adjustment problem data and the solver seam.
//!
//! A `BundleProblem` is a self-contained snapshot: poses, positions and
//! observations are copied out of the map so the solver runs without any
//! lock. Entities are referenced by index; ids ride along so the results can
//! be written back.

pub mod lm;

use nalgebra::{Vector2, Vector3};

use crate::geometry::{CameraModel, SE3};
use crate::map::{FrameId, PointId};

pub use lm::LmSolver;

#[derive(Debug, Clone)]
pub struct BundleKeyframe {
    pub id: FrameId,
    /// World-to-camera pose (T_cw).
    pub pose_cw: SE3,
    pub camera: CameraModel,
    /// Fixed keyframes constrain the problem but are not optimized.
    pub fixed: bool,
}

#[derive(Debug, Clone)]
pub struct BundlePoint {
    pub id: PointId,
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct BundleObservation {
    /// Index into `BundleProblem::keyframes`.
    pub keyframe: usize,
    /// Index into `BundleProblem::points`.
    pub point: usize,
    pub pixel: Vector2<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    pub keyframes: Vec<BundleKeyframe>,
    pub points: Vec<BundlePoint>,
    pub observations: Vec<BundleObservation>,
}

impl BundleProblem {
    pub fn num_optimized_keyframes(&self) -> usize {
        self.keyframes.iter().filter(|k| !k.fixed).count()
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Gradient or step fell below tolerance.
    Converged,
    /// Ran out of iterations, or the damped system became singular.
    MaxIterations,
    /// The cancellation callback fired.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct BundleSolution {
    /// Optimized camera-to-world poses (T_wc) of the non-fixed keyframes.
    pub poses: Vec<(FrameId, SE3)>,
    pub points: Vec<(PointId, Vector3<f64>)>,
    pub iterations: usize,
    /// RMS of the robustified reprojection residuals (pixels).
    pub initial_error: f64,
    pub final_error: f64,
    pub termination: Termination,
}

/// Nonlinear least-squares backend for bundle adjustment.
pub trait BundleSolver: Send + Sync {
    /// Minimize the reprojection error of `problem`.
    ///
    /// `should_stop` is polled once per iteration. Returns None when the
    /// problem has nothing to optimize.
    fn optimize(&self, problem: &BundleProblem, should_stop: &dyn Fn() -> bool) -> Option<BundleSolution>;
}
