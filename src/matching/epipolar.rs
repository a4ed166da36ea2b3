//! Reference matcher: epipolar search for candidates, projection search for
//! converged points.

use nalgebra::{Vector2, Vector3};

use crate::config::MatcherConfig;
use crate::geometry::{parallax_cos, triangulate_dlt, CameraModel, SE3};
use crate::map::{Frame, PointSnapshot, ReferenceSnapshot};

use super::{MatchOutcome, Matcher};

/// Samples taken along the reference ray to find its visible stretch.
const RAY_SAMPLES: usize = 16;

#[derive(Debug, Clone)]
pub struct EpipolarMatcher {
    config: MatcherConfig,
}

impl EpipolarMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Search the epipolar segment of the reference ray and triangulate.
    fn triangulate_candidate(
        &self,
        point: &PointSnapshot,
        reference: &ReferenceSnapshot,
        frame: &Frame,
        pose: &SE3,
    ) -> MatchOutcome {
        let camera = frame.camera();
        let pose_cw = pose.inverse();
        let ref_pose_cw = reference.pose.inverse();

        // Depth of the current estimate along the reference ray
        let depth = ref_pose_cw.transform_point(&point.position).z;
        if !(depth > 0.0 && depth.is_finite()) {
            return MatchOutcome::Failed;
        }

        let ray = reference.camera.normalized(&reference.pixel);
        let segment = match self.visible_segment(&ray, depth, &reference.pose, &pose_cw, camera) {
            Some(s) => s,
            None => return MatchOutcome::NotVisible,
        };

        // Best descriptor among keypoints near the segment
        let mut best: Option<(usize, u32)> = None;
        for (idx, kp) in frame.keypoints().iter().enumerate() {
            if distance_to_segment(&kp.pt, &segment.0, &segment.1) > self.config.epipolar_tolerance {
                continue;
            }
            let dist = kp.descriptor.distance(&point.descriptor);
            if dist > self.config.max_descriptor_distance {
                continue;
            }
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((idx, dist));
            }
        }
        let Some((idx, _)) = best else {
            return MatchOutcome::Failed;
        };
        let pixel = frame.keypoints()[idx].pt;

        let xn_cur = camera.normalized(&pixel);

        // Too short a baseline so far. Not a failure: a later frame may
        // still triangulate it.
        let cos = parallax_cos(&reference.pose.rotate_vector(&ray), &pose.rotate_vector(&xn_cur));
        if cos > self.config.min_parallax.cos() {
            return MatchOutcome::NotVisible;
        }

        let Some(p_world) = triangulate_dlt(&ray, &xn_cur, &reference.pose, pose) else {
            return MatchOutcome::Failed;
        };

        if !self.validate(&p_world, reference, &pixel, pose, camera) {
            return MatchOutcome::Failed;
        }

        MatchOutcome::Matched {
            position: p_world,
            pixel,
            keypoint: Some(idx),
        }
    }

    /// Projections of the nearest and furthest visible samples of the ray
    /// between the configured depth factors.
    fn visible_segment(
        &self,
        ray: &Vector3<f64>,
        depth: f64,
        ref_pose_wc: &SE3,
        pose_cw: &SE3,
        camera: &CameraModel,
    ) -> Option<(Vector2<f64>, Vector2<f64>)> {
        let near = depth * self.config.min_depth_factor;
        let far = depth * self.config.max_depth_factor;
        let step = (far / near).powf(1.0 / (RAY_SAMPLES - 1) as f64);

        let mut first = None;
        let mut last = None;
        let mut d = near;
        for _ in 0..RAY_SAMPLES {
            let p_world = ref_pose_wc.transform_point(&(ray * d));
            if let Some(uv) = camera.project(&pose_cw.transform_point(&p_world)) {
                if camera.is_in_image(&uv, self.config.border) {
                    first.get_or_insert(uv);
                    last = Some(uv);
                }
            }
            d *= step;
        }

        Some((first?, last?))
    }

    fn validate(
        &self,
        p_world: &Vector3<f64>,
        reference: &ReferenceSnapshot,
        pixel: &Vector2<f64>,
        pose: &SE3,
        camera: &CameraModel,
    ) -> bool {
        // In front of both cameras, and reprojects onto both observations
        let max_sq = self.config.max_reprojection_error.powi(2);
        let checks = [
            (reference.pose.inverse(), &reference.camera, reference.pixel),
            (pose.inverse(), camera, *pixel),
        ];
        checks.iter().all(|(pose_cw, cam, observed)| {
            cam.project(&pose_cw.transform_point(p_world))
                .is_some_and(|uv| (uv - observed).norm_squared() <= max_sq)
        })
    }

    /// Look for the point around its projection.
    fn project_converged(&self, point: &PointSnapshot, frame: &Frame, pose: &SE3) -> MatchOutcome {
        let camera = frame.camera();
        let p_cam = pose.inverse().transform_point(&point.position);
        let Some(uv) = camera.project(&p_cam) else {
            return MatchOutcome::NotVisible;
        };
        if !camera.is_in_image(&uv, self.config.border) {
            return MatchOutcome::NotVisible;
        }

        let keypoints = frame.keypoints();
        let best = frame
            .keypoints_in_area(uv.x, uv.y, self.config.search_radius)
            .into_iter()
            .map(|idx| (idx, keypoints[idx].descriptor.distance(&point.descriptor)))
            .filter(|(_, dist)| *dist <= self.config.max_descriptor_distance)
            .min_by_key(|(_, dist)| *dist);

        match best {
            Some((idx, _)) => MatchOutcome::Matched {
                position: point.position,
                pixel: keypoints[idx].pt,
                keypoint: Some(idx),
            },
            None => MatchOutcome::Failed,
        }
    }
}

impl Default for EpipolarMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

impl Matcher for EpipolarMatcher {
    fn match_or_triangulate(&self, point: &PointSnapshot, frame: &Frame, pose: &SE3) -> MatchOutcome {
        if !point.is_candidate {
            return self.project_converged(point, frame, pose);
        }
        match &point.reference {
            Some(reference) if reference.frame_id == frame.id() => MatchOutcome::NotVisible,
            Some(reference) => self.triangulate_candidate(point, reference, frame, pose),
            // Reference frame is gone, the candidate can never be triangulated.
            None => MatchOutcome::Failed,
        }
    }
}

/// Pixel distance from `p` to the segment `a`-`b`.
fn distance_to_segment(p: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq < 1e-12 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::map::{Descriptor, KeyPoint, MapState, Observation, Point};
    use crate::test_helpers::{project, test_camera, translated};
    use std::sync::Arc;

    fn descriptor(seed: u8) -> Descriptor {
        Descriptor([seed; 32])
    }

    /// Candidate seeded in `reference` towards `truth`, at the wrong depth.
    fn seeded_candidate(reference: &Arc<Frame>, truth: &Vector3<f64>) -> Arc<Point> {
        let pixel = project(reference, truth).unwrap();
        let ray = reference.camera().normalized(&pixel);
        let seed = reference.pose().transform_point(&(ray * 1.0));
        Arc::new(Point::candidate(
            seed,
            descriptor(0x0f),
            Observation::new(reference, pixel, None),
        ))
    }

    #[test]
    fn test_distance_to_segment() {
        let a = Vector2::new(0.0, 0.0);
        let b = Vector2::new(10.0, 0.0);
        assert!((distance_to_segment(&Vector2::new(5.0, 3.0), &a, &b) - 3.0).abs() < 1e-12);
        assert!((distance_to_segment(&Vector2::new(-4.0, 3.0), &a, &b) - 5.0).abs() < 1e-12);
        assert!((distance_to_segment(&Vector2::new(1.0, 1.0), &a, &a) - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_candidate_triangulated_along_epipolar_line() {
        let reference = translated(0.0, 0.0, 0.0);
        let truth = Vector3::new(0.2, -0.1, 3.0);
        let candidate = seeded_candidate(&reference, &truth);

        let current_pose = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(0.3, 0.0, 0.0));
        let pixel = project_pose(&current_pose, &truth);
        let keypoints = vec![
            KeyPoint::new(pixel + Vector2::new(0.0, 40.0), 1.0, descriptor(0x0f)), // off the line
            KeyPoint::new(pixel, 1.0, descriptor(0x0f)),
            KeyPoint::new(pixel + Vector2::new(1.0, 0.0), 1.0, descriptor(0xf0)), // wrong descriptor
        ];
        let current = Arc::new(Frame::new(1, test_camera(), current_pose, keypoints));

        let matcher = EpipolarMatcher::default();
        let outcome = matcher.match_or_triangulate(&candidate.snapshot(), &current, &current_pose);
        match outcome {
            MatchOutcome::Matched {
                position,
                keypoint,
                ..
            } => {
                assert_eq!(keypoint, Some(1));
                assert!((position - truth).norm() < 1e-6);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_without_parallax_not_visible() {
        let reference = translated(0.0, 0.0, 0.0);
        let truth = Vector3::new(0.0, 0.0, 3.0);
        let candidate = seeded_candidate(&reference, &truth);

        let pixel = project(&reference, &truth).unwrap();
        let same_center = Arc::new(Frame::new(
            1,
            test_camera(),
            SE3::identity(),
            vec![KeyPoint::new(pixel, 1.0, descriptor(0x0f))],
        ));
        let outcome = EpipolarMatcher::default().match_or_triangulate(
            &candidate.snapshot(),
            &same_center,
            &SE3::identity(),
        );
        assert_eq!(outcome, MatchOutcome::NotVisible);
    }

    #[test]
    fn test_slow_baseline_growth_keeps_failure_budget() {
        let mut state = MapState::new(MapConfig::default());
        let reference = translated(0.0, 0.0, 0.0);
        state.add_keyframe(&reference, false);
        let truth = Vector3::new(0.0, 0.0, 3.0);
        let candidate = seeded_candidate(&reference, &truth);
        state.add_candidate(candidate.clone());

        // 1 cm per frame: the 1 degree parallax is reached after ~5 cm.
        let matcher = EpipolarMatcher::default();
        let mut outcomes = Vec::new();
        for i in 1..=20 {
            let pose = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(0.01 * i as f64, 0.0, 0.0));
            let keypoints = vec![KeyPoint::new(project_pose(&pose, &truth), 1.0, descriptor(0x0f))];
            let frame = Arc::new(Frame::new(i, test_camera(), pose, keypoints));
            let outcome = matcher.match_or_triangulate(&candidate.snapshot(), &frame, &pose);
            outcomes.push(outcome);
            state.commit_candidate_results(&frame, vec![(candidate.clone(), outcome)]);
            if candidate.is_converged() {
                break;
            }
        }

        assert!(outcomes.iter().all(|o| *o != MatchOutcome::Failed));
        assert_eq!(outcomes[0], MatchOutcome::NotVisible);
        assert!(candidate.is_converged());
        assert_eq!(candidate.failures(), 0);
        assert!((candidate.position() - truth).norm() < 1e-6);
    }

    #[test]
    fn test_candidate_behind_camera_not_visible() {
        let reference = translated(0.0, 0.0, 0.0);
        let truth = Vector3::new(0.0, 0.0, 3.0);
        let candidate = seeded_candidate(&reference, &truth);

        // Looking away from the ray: rotate 180 degrees about y.
        let away = SE3::from_axis_angle(&Vector3::new(0.0, std::f64::consts::PI, 0.0), Vector3::zeros());
        let frame = Arc::new(Frame::new(1, test_camera(), away, Vec::new()));
        let outcome = EpipolarMatcher::default().match_or_triangulate(&candidate.snapshot(), &frame, &away);
        assert_eq!(outcome, MatchOutcome::NotVisible);
    }

    #[test]
    fn test_orphaned_candidate_fails() {
        let reference = translated(0.0, 0.0, 0.0);
        let candidate = seeded_candidate(&reference, &Vector3::new(0.0, 0.0, 3.0));
        drop(reference);

        let frame = translated(0.5, 0.0, 0.0);
        let outcome =
            EpipolarMatcher::default().match_or_triangulate(&candidate.snapshot(), &frame, &frame.pose());
        assert_eq!(outcome, MatchOutcome::Failed);
    }

    #[test]
    fn test_converged_projection_search() {
        let position = Vector3::new(0.1, 0.1, 2.0);
        let point = Point::converged(position, descriptor(0x3c));
        let pose = SE3::identity();
        let uv = project_pose(&pose, &position);

        let frame = Frame::new(
            0,
            test_camera(),
            pose,
            vec![
                KeyPoint::new(uv + Vector2::new(30.0, 0.0), 1.0, descriptor(0x3c)), // outside radius
                KeyPoint::new(uv + Vector2::new(3.0, -2.0), 1.0, descriptor(0x3c)),
            ],
        );
        let matcher = EpipolarMatcher::default();
        let outcome = matcher.match_or_triangulate(&point.snapshot(), &frame, &pose);
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                position,
                pixel: uv + Vector2::new(3.0, -2.0),
                keypoint: Some(1),
            }
        );

        let empty = Frame::new(0, test_camera(), pose, Vec::new());
        assert_eq!(
            matcher.match_or_triangulate(&point.snapshot(), &empty, &pose),
            MatchOutcome::Failed
        );

        let behind = Point::converged(Vector3::new(0.0, 0.0, -2.0), descriptor(0x3c));
        assert_eq!(
            matcher.match_or_triangulate(&behind.snapshot(), &empty, &pose),
            MatchOutcome::NotVisible
        );
    }

    fn project_pose(pose: &SE3, p: &Vector3<f64>) -> Vector2<f64> {
        test_camera()
            .project(&pose.inverse().transform_point(p))
            .unwrap()
    }
}
