//! Dense Levenberg-Marquardt bundle adjustment.
//!
//! Minimizes the robustified reprojection error
//!
//! ```text
//! E = Σ_ij ρ(||u_ij - π(T_i, p_j)||²)
//! ```
//!
//! over the non-fixed poses `T_i` (world-to-camera) and all point positions
//! `p_j`, solving the damped normal equations
//!
//! ```text
//! (JᵀJ + λ diag(JᵀJ)) δ = -Jᵀr
//! ```
//!
//! each iteration. Pose increments are applied on the left:
//! `T ← exp(δ) · T`, rotation first, then translation.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, UnitQuaternion, Vector2, Vector3};

use crate::config::BundleConfig;
use crate::geometry::{CameraModel, SE3};

use super::{BundleProblem, BundleSolution, BundleSolver, Termination};

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const LAMBDA_MIN: f64 = 1e-10;
const LAMBDA_MAX: f64 = 1e10;

/// Residual assigned to points behind the camera.
const BEHIND_CAMERA_ERROR: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct LmSolver {
    pub max_iterations: usize,
    /// Convergence threshold on the relative step size.
    pub param_tolerance: f64,
    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,
    /// Huber kernel threshold (pixels).
    pub huber_threshold: f64,
}

impl LmSolver {
    pub fn new(config: &BundleConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            param_tolerance: config.param_tolerance,
            gradient_tolerance: config.gradient_tolerance,
            huber_threshold: config.huber_threshold,
        }
    }

    fn huber_weight(&self, error_norm: f64) -> f64 {
        if error_norm <= self.huber_threshold {
            1.0
        } else {
            self.huber_threshold / error_norm
        }
    }
}

impl Default for LmSolver {
    fn default() -> Self {
        Self::new(&BundleConfig::default())
    }
}

/// Current estimate: one pose per keyframe (fixed ones included) and one
/// position per point.
#[derive(Clone)]
struct Estimate {
    poses: Vec<SE3>,
    points: Vec<Vector3<f64>>,
}

impl Estimate {
    fn norm(&self) -> f64 {
        let poses: f64 = self.poses.iter().map(|p| p.translation.norm_squared()).sum();
        let points: f64 = self.points.iter().map(|p| p.norm_squared()).sum();
        (poses + points).sqrt()
    }
}

/// Column layout of the parameter vector: optimized poses first (6 each),
/// then points (3 each).
struct Layout {
    pose_col: Vec<Option<usize>>,
    point_base: usize,
    num_params: usize,
}

impl Layout {
    fn new(problem: &BundleProblem) -> Self {
        let mut next = 0;
        let pose_col = problem
            .keyframes
            .iter()
            .map(|k| {
                if k.fixed {
                    None
                } else {
                    let col = next;
                    next += 6;
                    Some(col)
                }
            })
            .collect();
        Self {
            pose_col,
            point_base: next,
            num_params: next + problem.points.len() * 3,
        }
    }

    fn point_col(&self, point: usize) -> usize {
        self.point_base + point * 3
    }
}

impl BundleSolver for LmSolver {
    fn optimize(&self, problem: &BundleProblem, should_stop: &dyn Fn() -> bool) -> Option<BundleSolution> {
        let layout = Layout::new(problem);
        let num_residuals = problem.observations.len() * 2;
        if layout.num_params == 0 || num_residuals == 0 {
            return None;
        }

        let mut estimate = Estimate {
            poses: problem.keyframes.iter().map(|k| k.pose_cw).collect(),
            points: problem.points.iter().map(|p| p.position).collect(),
        };

        let rms = |cost: f64| (cost / num_residuals as f64).sqrt();
        let initial_cost = self.cost(problem, &estimate);
        let mut cost = initial_cost;
        let mut lambda = LAMBDA_INIT;
        let mut iterations = 0;
        let mut termination = Termination::MaxIterations;

        for iter in 0..self.max_iterations {
            if should_stop() {
                termination = Termination::Aborted;
                break;
            }
            iterations = iter + 1;

            let (residuals, jacobian) = self.linearize(problem, &layout, &estimate);
            let gradient = jacobian.transpose() * &residuals;
            if gradient.norm() < self.gradient_tolerance {
                termination = Termination::Converged;
                break;
            }

            let mut damped = jacobian.transpose() * &jacobian;
            for i in 0..layout.num_params {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
            }

            let rhs = -&gradient;
            let delta = match damped.clone().cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => match damped.lu().solve(&rhs) {
                    Some(d) => d,
                    None => break,
                },
            };

            if delta.norm() < self.param_tolerance * (estimate.norm() + self.param_tolerance) {
                termination = Termination::Converged;
                break;
            }

            let trial = apply_delta(problem, &layout, &estimate, &delta);
            let trial_cost = self.cost(problem, &trial);
            if trial_cost.is_finite() && trial_cost < cost {
                estimate = trial;
                cost = trial_cost;
                lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);
            } else {
                lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
            }
        }

        let poses = problem
            .keyframes
            .iter()
            .zip(&estimate.poses)
            .filter(|(k, _)| !k.fixed)
            .map(|(k, pose_cw)| (k.id, pose_cw.inverse()))
            .collect();
        let points = problem
            .points
            .iter()
            .zip(&estimate.points)
            .map(|(p, pos)| (p.id, *pos))
            .collect();

        Some(BundleSolution {
            poses,
            points,
            iterations,
            initial_error: rms(initial_cost),
            final_error: rms(cost),
            termination,
        })
    }
}

impl LmSolver {
    /// Sum of squared Huber-weighted residuals.
    fn cost(&self, problem: &BundleProblem, estimate: &Estimate) -> f64 {
        problem
            .observations
            .iter()
            .map(|obs| {
                let kf = &problem.keyframes[obs.keyframe];
                let error = reprojection_error(
                    &kf.camera,
                    &estimate.poses[obs.keyframe],
                    &estimate.points[obs.point],
                    &obs.pixel,
                );
                let norm = error.norm();
                self.huber_weight(norm) * norm * norm
            })
            .sum()
    }

    fn linearize(
        &self,
        problem: &BundleProblem,
        layout: &Layout,
        estimate: &Estimate,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let mut residuals = DVector::zeros(problem.observations.len() * 2);
        let mut jacobian = DMatrix::zeros(problem.observations.len() * 2, layout.num_params);

        for (i, obs) in problem.observations.iter().enumerate() {
            let camera = &problem.keyframes[obs.keyframe].camera;
            let pose_cw = &estimate.poses[obs.keyframe];
            let point = &estimate.points[obs.point];

            let error = reprojection_error(camera, pose_cw, point, &obs.pixel);
            let w = self.huber_weight(error.norm()).sqrt();
            residuals[i * 2] = error.x * w;
            residuals[i * 2 + 1] = error.y * w;

            if let Some(col) = layout.pose_col[obs.keyframe] {
                let j = jacobian_pose(camera, pose_cw, point) * w;
                jacobian.fixed_view_mut::<2, 6>(i * 2, col).copy_from(&j);
            }
            let j = jacobian_point(camera, pose_cw, point) * w;
            jacobian
                .fixed_view_mut::<2, 3>(i * 2, layout.point_col(obs.point))
                .copy_from(&j);
        }

        (residuals, jacobian)
    }
}

fn apply_delta(problem: &BundleProblem, layout: &Layout, estimate: &Estimate, delta: &DVector<f64>) -> Estimate {
    let mut next = estimate.clone();
    for (k, pose) in next.poses.iter_mut().enumerate() {
        let Some(col) = layout.pose_col[k] else {
            continue;
        };
        let omega = Vector3::new(delta[col], delta[col + 1], delta[col + 2]);
        let upsilon = Vector3::new(delta[col + 3], delta[col + 4], delta[col + 5]);
        let step = SE3::new(UnitQuaternion::from_scaled_axis(omega), upsilon);
        *pose = step * *pose;
    }
    for (j, point) in next.points.iter_mut().enumerate() {
        let col = layout.point_col(j);
        *point += Vector3::new(delta[col], delta[col + 1], delta[col + 2]);
    }
    debug_assert_eq!(next.points.len(), problem.points.len());
    next
}

/// Observed minus projected pixel.
fn reprojection_error(
    camera: &CameraModel,
    pose_cw: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Vector2<f64> {
    let p_cam = pose_cw.transform_point(point);
    if p_cam.z <= 0.001 {
        return Vector2::new(BEHIND_CAMERA_ERROR, BEHIND_CAMERA_ERROR);
    }
    let u = camera.fx * p_cam.x / p_cam.z + camera.cx;
    let v = camera.fy * p_cam.y / p_cam.z + camera.cy;
    Vector2::new(observed.x - u, observed.y - v)
}

/// Jacobian of the error w.r.t. a left pose increment `[ω, υ]`.
fn jacobian_pose(camera: &CameraModel, pose_cw: &SE3, point: &Vector3<f64>) -> Matrix2x6<f64> {
    let p = pose_cw.transform_point(point);
    let (x, y, z) = (p.x, p.y, p.z);
    if z.abs() < 1e-6 {
        return Matrix2x6::zeros();
    }
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    #[rustfmt::skip]
    let j = Matrix2x6::new(
        x * y * invz2 * fx, -(1.0 + x * x * invz2) * fx, y * invz * fx, -invz * fx, 0.0, x * invz2 * fx,
        (1.0 + y * y * invz2) * fy, -x * y * invz2 * fy, -x * invz * fy, 0.0, -invz * fy, y * invz2 * fy,
    );
    j
}

/// Jacobian of the error w.r.t. the world point.
fn jacobian_point(camera: &CameraModel, pose_cw: &SE3, point: &Vector3<f64>) -> Matrix2x3<f64> {
    let p = pose_cw.transform_point(point);
    if p.z.abs() < 1e-6 {
        return Matrix2x3::zeros();
    }
    let invz = 1.0 / p.z;
    #[rustfmt::skip]
    let tmp = Matrix2x3::new(
        camera.fx, 0.0, -camera.fx * p.x * invz,
        0.0, camera.fy, -camera.fy * p.y * invz,
    );
    (-invz) * tmp * pose_cw.rotation_matrix()
}
