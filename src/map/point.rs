//! Point - a 3D landmark, either a candidate under refinement or converged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nalgebra::{Vector2, Vector3};
use parking_lot::RwLock;

use crate::geometry::{CameraModel, SE3};

use super::frame::{Descriptor, Frame};
use super::types::{FrameId, PointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    /// Seeded from one frame, still being triangulated.
    Candidate,
    /// Promoted into the active map.
    Converged,
    /// Logically deleted, waiting in the trash.
    Trashed,
}

/// A 2D sighting of a point in some frame.
///
/// The frame is held weakly; frames own points through their features,
/// never the reverse.
#[derive(Debug, Clone)]
pub struct Observation {
    pub frame_id: FrameId,
    pub frame: Weak<Frame>,
    pub pixel: Vector2<f64>,
    pub keypoint: Option<usize>,
}

impl Observation {
    pub fn new(frame: &Arc<Frame>, pixel: Vector2<f64>, keypoint: Option<usize>) -> Self {
        Self {
            frame_id: frame.id(),
            frame: Arc::downgrade(frame),
            pixel,
            keypoint,
        }
    }
}

/// Match history of a candidate.
#[derive(Debug, Clone, Default)]
pub struct CandidateTrack {
    pub successes: u32,
    pub failures: u32,
    /// Frames the candidate was successfully matched in.
    pub matches: Vec<Observation>,
    position_sum: Vector3<f64>,
}

#[derive(Debug)]
struct PointData {
    position: Vector3<f64>,
    status: PointStatus,
    descriptor: Descriptor,
    /// Seed observation of a candidate.
    reference: Option<Observation>,
    /// Keyframes holding a Feature for this point.
    observations: Vec<Observation>,
    track: CandidateTrack,
}

pub struct Point {
    id: PointId,
    inner: RwLock<PointData>,
    /// Set by the tracker while the point is matched in the current frame.
    selected: AtomicBool,
}

/// Everything a matcher needs to know about a point, copied out under the
/// map lock.
#[derive(Debug, Clone)]
pub struct PointSnapshot {
    pub id: PointId,
    pub position: Vector3<f64>,
    pub is_candidate: bool,
    pub descriptor: Descriptor,
    pub reference: Option<ReferenceSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ReferenceSnapshot {
    pub frame_id: FrameId,
    pub pixel: Vector2<f64>,
    /// Camera-to-world pose of the reference frame.
    pub pose: SE3,
    pub camera: CameraModel,
}

impl Point {
    pub fn candidate(position: Vector3<f64>, descriptor: Descriptor, reference: Observation) -> Self {
        Self::with_status(PointStatus::Candidate, position, descriptor, Some(reference))
    }

    pub fn converged(position: Vector3<f64>, descriptor: Descriptor) -> Self {
        Self::with_status(PointStatus::Converged, position, descriptor, None)
    }

    fn with_status(
        status: PointStatus,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference: Option<Observation>,
    ) -> Self {
        Self {
            id: PointId::fresh(),
            inner: RwLock::new(PointData {
                position,
                status,
                descriptor,
                reference,
                observations: Vec::new(),
                track: CandidateTrack::default(),
            }),
            selected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PointId {
        self.id
    }

    pub fn position(&self) -> Vector3<f64> {
        self.inner.read().position
    }

    pub fn set_position(&self, position: Vector3<f64>) {
        self.inner.write().position = position;
    }

    pub fn status(&self) -> PointStatus {
        self.inner.read().status
    }

    pub fn is_candidate(&self) -> bool {
        self.status() == PointStatus::Candidate
    }

    pub fn is_converged(&self) -> bool {
        self.status() == PointStatus::Converged
    }

    pub fn is_trashed(&self) -> bool {
        self.status() == PointStatus::Trashed
    }

    pub fn descriptor(&self) -> Descriptor {
        self.inner.read().descriptor
    }

    pub fn reference(&self) -> Option<Observation> {
        self.inner.read().reference.clone()
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Relaxed)
    }

    pub fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Relaxed);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframe observations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn observations(&self) -> Vec<Observation> {
        self.inner.read().observations.clone()
    }

    pub fn num_observations(&self) -> usize {
        self.inner.read().observations.len()
    }

    pub fn is_observed_by(&self, frame_id: FrameId) -> bool {
        self.inner
            .read()
            .observations
            .iter()
            .any(|o| o.frame_id == frame_id)
    }

    /// Record a keyframe observation. Returns false if the keyframe is
    /// already recorded.
    pub fn add_observation(&self, observation: Observation) -> bool {
        let mut inner = self.inner.write();
        if inner
            .observations
            .iter()
            .any(|o| o.frame_id == observation.frame_id)
        {
            return false;
        }
        inner.observations.push(observation);
        true
    }

    pub fn remove_observation(&self, frame_id: FrameId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.observations.len();
        inner.observations.retain(|o| o.frame_id != frame_id);
        inner.observations.len() != before
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Candidate lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn successes(&self) -> u32 {
        self.inner.read().track.successes
    }

    pub fn failures(&self) -> u32 {
        self.inner.read().track.failures
    }

    /// Frames the candidate was matched in, in match order.
    pub fn matches(&self) -> Vec<Observation> {
        self.inner.read().track.matches.clone()
    }

    /// Fold a successful triangulation into the running mean position.
    /// Returns the new success count.
    pub(crate) fn record_success(&self, position: Vector3<f64>, observation: Observation) -> u32 {
        let mut inner = self.inner.write();
        let track = &mut inner.track;
        track.successes += 1;
        track.position_sum += position;
        let mean = track.position_sum / f64::from(track.successes);
        track.matches.push(observation);
        inner.position = mean;
        inner.track.successes
    }

    /// Move the point by a map-wide transform. The running sum of a
    /// candidate follows, so later successes average in the new frame.
    pub(crate) fn apply_transform(&self, f: impl Fn(&Vector3<f64>) -> Vector3<f64>) {
        let mut inner = self.inner.write();
        inner.position = f(&inner.position);
        let successes = f64::from(inner.track.successes);
        inner.track.position_sum = inner.position * successes;
    }

    /// Returns the new failure count.
    pub(crate) fn record_failure(&self) -> u32 {
        let mut inner = self.inner.write();
        inner.track.failures += 1;
        inner.track.failures
    }

    pub(crate) fn promote(&self) {
        let mut inner = self.inner.write();
        debug_assert_eq!(inner.status, PointStatus::Candidate);
        inner.status = PointStatus::Converged;
    }

    /// Returns false if the point was already trashed.
    pub(crate) fn mark_trashed(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.status == PointStatus::Trashed {
            return false;
        }
        inner.status = PointStatus::Trashed;
        true
    }

    /// Copy out the matcher inputs.
    ///
    /// The point lock is released before the reference frame is touched.
    pub fn snapshot(&self) -> PointSnapshot {
        let (position, status, descriptor, reference) = {
            let inner = self.inner.read();
            (
                inner.position,
                inner.status,
                inner.descriptor,
                inner.reference.clone(),
            )
        };

        let reference = reference.and_then(|obs| {
            let frame = obs.frame.upgrade()?;
            Some(ReferenceSnapshot {
                frame_id: obs.frame_id,
                pixel: obs.pixel,
                pose: frame.pose(),
                camera: *frame.camera(),
            })
        });

        PointSnapshot {
            id: self.id,
            position,
            is_candidate: status == PointStatus::Candidate,
            descriptor,
            reference,
        }
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Point")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("position", &inner.position)
            .field("num_observations", &inner.observations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_camera, test_frame};

    #[test]
    fn test_running_mean_position() {
        let frame = test_frame(SE3::identity());
        let point = Point::candidate(
            Vector3::new(0.0, 0.0, 1.0),
            Descriptor::zero(),
            Observation::new(&frame, Vector2::new(320.0, 240.0), None),
        );

        let obs = Observation::new(&frame, Vector2::zeros(), None);
        assert_eq!(point.record_success(Vector3::new(0.0, 0.0, 2.0), obs.clone()), 1);
        assert_eq!(point.position(), Vector3::new(0.0, 0.0, 2.0));
        assert_eq!(point.record_success(Vector3::new(0.0, 0.0, 4.0), obs), 2);
        assert_eq!(point.position(), Vector3::new(0.0, 0.0, 3.0));
        assert_eq!(point.matches().len(), 2);
    }

    #[test]
    fn test_mark_trashed_once() {
        let point = Point::converged(Vector3::zeros(), Descriptor::zero());
        assert!(point.mark_trashed());
        assert!(!point.mark_trashed());
        assert!(point.is_trashed());
    }

    #[test]
    fn test_observations_are_unique_per_frame() {
        let frame = test_frame(SE3::identity());
        let point = Point::converged(Vector3::zeros(), Descriptor::zero());
        assert!(point.add_observation(Observation::new(&frame, Vector2::zeros(), None)));
        assert!(!point.add_observation(Observation::new(&frame, Vector2::zeros(), None)));
        assert!(point.is_observed_by(frame.id()));
        assert!(point.remove_observation(frame.id()));
        assert_eq!(point.num_observations(), 0);
    }

    #[test]
    fn test_snapshot_reads_reference_pose() {
        let pose = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(1.0, 2.0, 3.0));
        let frame = test_frame(pose);
        let point = Point::candidate(
            Vector3::zeros(),
            Descriptor::zero(),
            Observation::new(&frame, Vector2::new(10.0, 20.0), Some(0)),
        );

        let snap = point.snapshot();
        assert!(snap.is_candidate);
        let reference = snap.reference.unwrap();
        assert_eq!(reference.frame_id, frame.id());
        assert_eq!(reference.pose.translation, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(reference.camera, *test_camera());

        drop(frame);
        assert!(point.snapshot().reference.is_none());
    }
}
