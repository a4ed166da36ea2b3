//! Deferred reclamation of deleted points and evicted keyframes.
//!
//! A logically deleted entity is parked here until the trash holds the only
//! strong reference to it. Points are held by Features, so a trashed point
//! survives until every frame holding a Feature for it has let go.

use std::sync::Arc;

use tracing::debug;

use super::frame::Frame;
use super::point::Point;
use super::state::MapState;

#[derive(Debug, Default)]
pub struct Trash {
    pub(crate) points: Vec<Arc<Point>>,
    pub(crate) frames: Vec<Arc<Frame>>,
}

impl Trash {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.frames.is_empty()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn contains_point(&self, point: &Arc<Point>) -> bool {
        self.points.iter().any(|p| Arc::ptr_eq(p, point))
    }
}

/// Result of one `empty_trash` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrashReport {
    pub features_released: usize,
    pub frames_reclaimed: usize,
    pub points_reclaimed: usize,
    /// Entities still referenced elsewhere, kept for a later pass.
    pub frames_pending: usize,
    pub points_pending: usize,
}

impl TrashReport {
    pub fn reclaimed(&self) -> usize {
        self.frames_reclaimed + self.points_reclaimed
    }
}

impl MapState {
    /// Reclaim every trashed entity nothing else refers to.
    ///
    /// Order matters: keyframes first drop their Features of trashed points,
    /// then frames are reclaimed (their Features drop with them), and only
    /// then are point reference counts inspected.
    pub fn empty_trash(&mut self) -> TrashReport {
        if self.trash.is_empty() {
            return TrashReport::default();
        }

        let mut report = TrashReport::default();

        if !self.trash.points.is_empty() {
            for kf in &self.keyframes {
                report.features_released += kf.release_trashed_points();
            }
        }

        let before = self.trash.frames.len();
        self.trash.frames.retain(|f| Arc::strong_count(f) > 1);
        report.frames_reclaimed = before - self.trash.frames.len();

        let before = self.trash.points.len();
        self.trash.points.retain(|p| Arc::strong_count(p) > 1);
        report.points_reclaimed = before - self.trash.points.len();

        report.frames_pending = self.trash.frames.len();
        report.points_pending = self.trash.points.len();

        if report.reclaimed() > 0 || report.features_released > 0 {
            debug!(
                "[Trash] released {} features, reclaimed {} frames and {} points ({} frames, {} points pending)",
                report.features_released,
                report.frames_reclaimed,
                report.points_reclaimed,
                report.frames_pending,
                report.points_pending
            );
        }

        report
    }

    pub fn trash(&self) -> &Trash {
        &self.trash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::geometry::SE3;
    use crate::map::Feature;
    use crate::test_helpers::{converged_point_at, test_frame};
    use nalgebra::{Vector2, Vector3};

    #[test]
    fn test_point_held_by_frame_is_not_reclaimed() {
        let mut state = MapState::new(MapConfig::default());
        let point = converged_point_at(Vector3::new(0.0, 0.0, 2.0));
        state.add_point(point.clone());

        // A frontend frame (not a keyframe) still holds a Feature.
        let frame = test_frame(SE3::identity());
        frame.add_feature(Feature::new(Vector2::zeros(), None, point.clone()));

        let weak = Arc::downgrade(&point);
        assert!(state.delete_point(&point));
        drop(point);

        let report = state.empty_trash();
        assert_eq!(report.points_reclaimed, 0);
        assert_eq!(report.points_pending, 1);
        assert!(weak.upgrade().is_some());

        frame.release_point(weak.upgrade().unwrap().id());
        let report = state.empty_trash();
        assert_eq!(report.points_reclaimed, 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_keyframe_features_released_before_reclaim() {
        let mut state = MapState::new(MapConfig::default());
        let kf = test_frame(SE3::identity());
        let point = converged_point_at(Vector3::new(0.0, 0.0, 2.0));
        kf.add_feature(Feature::new(Vector2::zeros(), None, point.clone()));
        state.add_point(point.clone());
        state.add_keyframe(&kf, false);

        let weak = Arc::downgrade(&point);
        state.delete_point(&point);
        drop(point);

        let report = state.empty_trash();
        assert_eq!(report.features_released, 1);
        assert_eq!(report.points_reclaimed, 1);
        assert!(weak.upgrade().is_none());
        assert!(kf.features().is_empty());
    }

    #[test]
    fn test_empty_trash_is_idempotent() {
        let mut state = MapState::new(MapConfig::default());
        assert_eq!(state.empty_trash(), TrashReport::default());
        assert_eq!(state.empty_trash(), TrashReport::default());
        assert!(state.trash().is_empty());
    }
}
