//! Frame - a camera observation, and the Features tying it to Points.
//!
//! Frames are shared as `Arc<Frame>` between the tracking frontend that made
//! them and the map that keeps the keyframes. Detected keypoints never change
//! after construction. The pose and the feature list sit behind their own
//! `RwLock`s so either side can update them.
//!
//! Lock order: a frame lock may be held while taking a point lock, never the
//! other way round.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::geometry::{CameraModel, SE3};

use super::point::Point;
use super::types::{FrameId, PointId};

/// 256-bit binary descriptor (ORB/BRIEF layout).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    pub fn zero() -> Self {
        Self([0; 32])
    }

    /// Hamming distance between two descriptors.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A detected 2D keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    /// Pixel coordinates.
    pub pt: Vector2<f64>,
    /// Detector response (higher is stronger).
    pub response: f32,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    pub descriptor: Descriptor,
}

impl KeyPoint {
    pub fn new(pt: Vector2<f64>, response: f32, descriptor: Descriptor) -> Self {
        Self {
            pt,
            response,
            octave: 0,
            descriptor,
        }
    }
}

/// A 2D observation of a Point in one Frame.
///
/// The feature holds a strong reference to its point, so a point lives at
/// least as long as some frame still carries a feature for it.
#[derive(Clone)]
pub struct Feature {
    pub pixel: Vector2<f64>,
    /// Index into the frame's keypoints, when the observation came from one.
    pub keypoint: Option<usize>,
    pub point: Arc<Point>,
}

impl Feature {
    pub fn new(pixel: Vector2<f64>, keypoint: Option<usize>, point: Arc<Point>) -> Self {
        Self {
            pixel,
            keypoint,
            point,
        }
    }
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("pixel", &self.pixel)
            .field("keypoint", &self.keypoint)
            .field("point", &self.point.id())
            .finish()
    }
}

/// A camera observation at a timestamp.
pub struct Frame {
    id: FrameId,
    timestamp_ns: u64,
    camera: Arc<CameraModel>,
    keypoints: Vec<KeyPoint>,

    /// Camera-to-world transform (T_wc).
    pose: RwLock<SE3>,

    /// Associations with Points, at most one per point.
    features: RwLock<Vec<Feature>>,

    keyframe: AtomicBool,
}

impl Frame {
    pub fn new(
        timestamp_ns: u64,
        camera: Arc<CameraModel>,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
    ) -> Self {
        Self::with_id(FrameId::fresh(), timestamp_ns, camera, pose, keypoints)
    }

    pub fn with_id(
        id: FrameId,
        timestamp_ns: u64,
        camera: Arc<CameraModel>,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
    ) -> Self {
        Self {
            id,
            timestamp_ns,
            camera,
            keypoints,
            pose: RwLock::new(pose),
            features: RwLock::new(Vec::new()),
            keyframe: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.keypoints
    }

    pub fn pose(&self) -> SE3 {
        *self.pose.read()
    }

    pub fn set_pose(&self, pose: SE3) {
        *self.pose.write() = pose;
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.read().translation
    }

    pub fn is_keyframe(&self) -> bool {
        self.keyframe.load(Ordering::Acquire)
    }

    /// Flag the frame as a keyframe. Returns false if it already was one.
    pub(crate) fn mark_keyframe(&self) -> bool {
        !self.keyframe.swap(true, Ordering::AcqRel)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────

    pub fn features(&self) -> RwLockReadGuard<'_, Vec<Feature>> {
        self.features.read()
    }

    /// Attach a feature. Returns false if the frame already observes the point.
    pub fn add_feature(&self, feature: Feature) -> bool {
        let mut features = self.features.write();
        if features.iter().any(|f| f.point.id() == feature.point.id()) {
            return false;
        }
        features.push(feature);
        true
    }

    /// Drop the feature referencing `point_id`, releasing this frame's hold
    /// on the point.
    pub fn release_point(&self, point_id: PointId) -> bool {
        let mut features = self.features.write();
        let before = features.len();
        features.retain(|f| f.point.id() != point_id);
        features.len() != before
    }

    /// Drop every feature whose point has been trashed.
    pub fn release_trashed_points(&self) -> usize {
        let mut features = self.features.write();
        let before = features.len();
        features.retain(|f| !f.point.is_trashed());
        before - features.len()
    }

    /// Drop all features.
    pub fn release_all(&self) -> usize {
        let mut features = self.features.write();
        let n = features.len();
        features.clear();
        n
    }

    pub fn observes(&self, point_id: PointId) -> bool {
        self.features.read().iter().any(|f| f.point.id() == point_id)
    }

    /// Ids of the live (not trashed) points this frame observes.
    pub fn point_ids(&self) -> HashSet<PointId> {
        self.features
            .read()
            .iter()
            .filter(|f| !f.point.is_trashed())
            .map(|f| f.point.id())
            .collect()
    }

    pub fn points(&self) -> Vec<Arc<Point>> {
        self.features.read().iter().map(|f| f.point.clone()).collect()
    }

    /// Number of features attached to points that are not trashed.
    pub fn num_points(&self) -> usize {
        self.features
            .read()
            .iter()
            .filter(|f| !f.point.is_trashed())
            .count()
    }

    /// Median depth (camera z) of the points this frame observes.
    pub fn median_depth(&self) -> Option<f64> {
        let pose_cw = self.pose().inverse();
        let mut depths: Vec<f64> = self
            .features
            .read()
            .iter()
            .filter(|f| !f.point.is_trashed())
            .map(|f| pose_cw.transform_point(&f.point.position()).z)
            .filter(|z| *z > 0.0 && z.is_finite())
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[depths.len() / 2])
    }

    /// Indices of keypoints within `radius` pixels of `(u, v)`.
    pub fn keypoints_in_area(&self, u: f64, v: f64, radius: f64) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                let du = kp.pt.x - u;
                let dv = kp.pt.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("num_keypoints", &self.keypoints.len())
            .field("num_features", &self.features.read().len())
            .field("is_keyframe", &self.is_keyframe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{converged_point_at, test_camera};

    fn create_test_frame() -> Frame {
        let keypoints = vec![
            KeyPoint::new(Vector2::new(100.0, 100.0), 1.0, Descriptor::zero()),
            KeyPoint::new(Vector2::new(105.0, 102.0), 1.0, Descriptor::zero()),
            KeyPoint::new(Vector2::new(300.0, 200.0), 1.0, Descriptor::zero()),
        ];
        Frame::new(0, test_camera(), SE3::identity(), keypoints)
    }

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor([0xff; 32]);
        let b = Descriptor::zero();
        assert_eq!(a.distance(&b), 256);
        assert_eq!(a.distance(&a), 0);

        let mut c = [0u8; 32];
        c[3] = 0b1010_0001;
        assert_eq!(Descriptor(c).distance(&b), 3);
    }

    #[test]
    fn test_add_feature_rejects_duplicate_point() {
        let frame = create_test_frame();
        let point = converged_point_at(Vector3::new(0.0, 0.0, 2.0));

        assert!(frame.add_feature(Feature::new(Vector2::new(1.0, 1.0), None, point.clone())));
        assert!(!frame.add_feature(Feature::new(Vector2::new(2.0, 2.0), None, point.clone())));
        assert_eq!(frame.features().len(), 1);
        assert!(frame.observes(point.id()));
    }

    #[test]
    fn test_release_point_drops_reference() {
        let frame = create_test_frame();
        let point = converged_point_at(Vector3::new(0.0, 0.0, 2.0));
        frame.add_feature(Feature::new(Vector2::new(1.0, 1.0), None, point.clone()));
        assert_eq!(Arc::strong_count(&point), 2);

        assert!(frame.release_point(point.id()));
        assert_eq!(Arc::strong_count(&point), 1);
        assert!(!frame.release_point(point.id()));
    }

    #[test]
    fn test_median_depth() {
        let frame = create_test_frame();
        for z in [1.0, 2.0, 8.0] {
            let point = converged_point_at(Vector3::new(0.0, 0.0, z));
            frame.add_feature(Feature::new(Vector2::zeros(), None, point));
        }
        assert_eq!(frame.median_depth(), Some(2.0));
    }

    #[test]
    fn test_keypoints_in_area() {
        let frame = create_test_frame();
        let mut near = frame.keypoints_in_area(102.0, 101.0, 5.0);
        near.sort();
        assert_eq!(near, vec![0, 1]);
        assert!(frame.keypoints_in_area(500.0, 400.0, 10.0).is_empty());
    }

    #[test]
    fn test_mark_keyframe_once() {
        let frame = create_test_frame();
        assert!(!frame.is_keyframe());
        assert!(frame.mark_keyframe());
        assert!(!frame.mark_keyframe());
        assert!(frame.is_keyframe());
    }
}
