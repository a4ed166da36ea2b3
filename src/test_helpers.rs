//! Fixtures shared by the unit tests.

use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::geometry::{CameraModel, SE3};
use crate::map::{Descriptor, Feature, Frame, KeyPoint, MapState, Observation, Point};

/// VGA pinhole camera with a 500 px focal length.
pub fn test_camera() -> Arc<CameraModel> {
    Arc::new(CameraModel {
        fx: 500.0,
        fy: 500.0,
        cx: 320.0,
        cy: 240.0,
        width: 640,
        height: 480,
    })
}

pub fn test_frame(pose: SE3) -> Arc<Frame> {
    test_frame_with_keypoints(pose, Vec::new())
}

pub fn test_frame_with_keypoints(pose: SE3, keypoints: Vec<KeyPoint>) -> Arc<Frame> {
    Arc::new(Frame::new(0, test_camera(), pose, keypoints))
}

/// Frame at `(x, y, z)` looking down +z.
pub fn translated(x: f64, y: f64, z: f64) -> Arc<Frame> {
    test_frame(SE3::new(UnitQuaternion::identity(), Vector3::new(x, y, z)))
}

pub fn converged_point_at(position: Vector3<f64>) -> Arc<Point> {
    Arc::new(Point::converged(position, Descriptor::zero()))
}

/// Pixel of world point `p` in `frame`.
pub fn project(frame: &Frame, p: &Vector3<f64>) -> Option<Vector2<f64>> {
    let p_cam = frame.pose().inverse().transform_point(p);
    frame.camera().project(&p_cam)
}

/// Associate `point` with `frame` at its projection. Keyframes also get the
/// observation; plain frames get it when they become keyframes.
pub fn observe(frame: &Arc<Frame>, point: &Arc<Point>) {
    let pixel = project(frame, &point.position()).unwrap_or_else(Vector2::zeros);
    if frame.add_feature(Feature::new(pixel, None, point.clone())) && frame.is_keyframe() {
        point.add_observation(Observation::new(frame, pixel, None));
    }
}

/// Candidate seeded on the optical axis of `reference`, one unit deep.
pub fn candidate_seeded_by(reference: &Arc<Frame>) -> Arc<Point> {
    let camera = reference.camera();
    let pixel = Vector2::new(camera.cx, camera.cy);
    let seed = reference.pose().transform_point(&Vector3::new(0.0, 0.0, 1.0));
    Arc::new(Point::candidate(
        seed,
        Descriptor::zero(),
        Observation::new(reference, pixel, None),
    ))
}

pub struct Scene {
    pub keyframes: Vec<Arc<Frame>>,
    pub points: Vec<Arc<Point>>,
}

/// Two keyframes above a ground plane one unit below the cameras
/// (`y = 1` in camera coordinates), with `n` converged points on it.
pub fn ground_plane_scene(state: &mut MapState, n: usize) -> Scene {
    let keyframes = vec![translated(0.0, 0.0, 0.0), translated(0.3, 0.0, 0.0)];
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f64;
        let x = -1.5 + 3.0 * (t * 0.618_034).fract();
        let z = 3.0 + 5.0 * (t * 0.414_214).fract();
        let point = converged_point_at(Vector3::new(x, 1.0, z));
        for kf in &keyframes {
            observe(kf, &point);
        }
        state.add_point(point.clone());
        points.push(point);
    }
    for kf in &keyframes {
        state.add_keyframe(kf, false);
    }
    Scene { keyframes, points }
}
