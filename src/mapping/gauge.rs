//! Gauge fixing of the bootstrap map on its dominant plane.
//!
//! A monocular bootstrap leaves the map in an arbitrary frame and scale.
//! This module anchors it: the dominant plane seen from the reference frame
//! becomes `z = 0`, its normal points up (towards the camera) and its inlier
//! centroid is the origin.

use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, info};

use crate::geometry::{fit_plane_ransac, PlaneRansacConfig, SE3};
use crate::map::{Frame, MapState};

/// Similarity `x ↦ s · R · (x - origin)`.
#[derive(Debug, Clone, Copy)]
pub struct GaugeTransform {
    pub rotation: UnitQuaternion<f64>,
    pub origin: Vector3<f64>,
    pub scale: f64,
}

impl GaugeTransform {
    pub fn apply_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * (p - self.origin) * self.scale
    }

    /// Transform a camera-to-world pose.
    pub fn apply_pose(&self, pose: &SE3) -> SE3 {
        SE3::new(self.rotation * pose.rotation, self.apply_point(&pose.translation))
    }
}

/// Fit the plane under `frame` and move the whole map into its gauge.
///
/// Returns false, leaving the map untouched, when too few points are seen
/// or the plane is not dominant enough.
pub fn transform_initial_map(state: &mut MapState, frame: &Frame) -> bool {
    let cfg = state.config.gauge.clone();

    let positions: Vec<Vector3<f64>> = frame
        .points()
        .iter()
        .filter(|p| p.is_converged())
        .map(|p| p.position())
        .collect();
    if positions.len() < cfg.min_points {
        debug!(
            "[Gauge] {} sees {} points, need {}",
            frame.id(),
            positions.len(),
            cfg.min_points
        );
        return false;
    }

    let center = frame.camera_center();
    let mut distances: Vec<f64> = positions.iter().map(|p| (p - center).norm()).collect();
    distances.sort_by(|a, b| a.total_cmp(b));
    let median_distance = distances[distances.len() / 2];

    let ransac = PlaneRansacConfig {
        max_iterations: cfg.ransac_iterations,
        inlier_threshold: cfg.inlier_threshold * median_distance,
        min_inliers: 3,
    };
    let Some(fit) = fit_plane_ransac(&positions, &ransac) else {
        debug!("[Gauge] no plane found in {} points", positions.len());
        return false;
    };

    let ratio = fit.inlier_ratio(positions.len());
    if ratio < cfg.min_inlier_ratio {
        debug!(
            "[Gauge] plane supported by {:.0}% of points, need {:.0}%",
            ratio * 100.0,
            cfg.min_inlier_ratio * 100.0
        );
        return false;
    }

    let plane = fit.plane.oriented_towards(&center);
    let height = plane.signed_distance(&center);
    let rotation = UnitQuaternion::rotation_between(&plane.normal, &Vector3::z()).unwrap_or_else(|| {
        // Normal points straight down
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    });
    let scale = match cfg.camera_height {
        Some(h) if height > 1e-9 => h / height,
        _ => 1.0,
    };

    // Project the centroid onto the plane so the origin lies exactly on it.
    let origin = fit.centroid - plane.normal * plane.signed_distance(&fit.centroid);
    let transform = GaugeTransform {
        rotation,
        origin,
        scale,
    };
    apply_to_map(state, &transform);
    state.initialized = true;

    info!(
        "[Gauge] fixed gauge on {} ({} inliers of {}, camera height {:.3}, scale {:.3})",
        frame.id(),
        fit.inliers.len(),
        positions.len(),
        height * scale,
        scale
    );
    true
}

fn apply_to_map(state: &MapState, transform: &GaugeTransform) {
    for kf in &state.keyframes {
        kf.set_pose(transform.apply_pose(&kf.pose()));
    }
    for frame in &state.frame_queue {
        // A queued keyframe was already moved above.
        if !frame.is_keyframe() || !state.keyframes.iter().any(|k| k.id() == frame.id()) {
            frame.set_pose(transform.apply_pose(&frame.pose()));
        }
    }
    for point in state.candidates.iter().chain(state.points.values()) {
        point.apply_transform(|p| transform.apply_point(p));
    }
}
