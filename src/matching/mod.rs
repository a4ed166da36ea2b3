//! Detector and matcher seams consumed by the mapping backend.
//!
//! The backend never looks at pixels itself: seeds come from a
//! `FeatureDetector`, and every candidate update or connection search goes
//! through a `Matcher`. Both are called without the map lock held.

pub mod detector;
pub mod epipolar;

use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;
use crate::map::{Frame, KeyPoint, PointSnapshot};

pub use detector::GridDetector;
pub use epipolar::EpipolarMatcher;

/// Result of locating one point in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    /// Found. `position` is the triangulated world position for candidates,
    /// the unchanged position for converged points.
    Matched {
        position: Vector3<f64>,
        pixel: Vector2<f64>,
        keypoint: Option<usize>,
    },
    /// The point cannot be seen from this frame; nothing was learned.
    NotVisible,
    /// The point should have been found but was not, or the triangulation
    /// was rejected.
    Failed,
}

impl MatchOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Supplies seed keypoints for a new keyframe.
pub trait FeatureDetector: Send + Sync {
    /// Keypoints of `frame`, at most one per `cell_size` grid cell.
    fn detect(&self, frame: &Frame, cell_size: u32) -> Vec<KeyPoint>;
}

/// Locates a point in a frame, triangulating candidates on the way.
pub trait Matcher: Send + Sync {
    /// `pose` is the camera-to-world pose of `frame` as copied out under the
    /// map lock.
    fn match_or_triangulate(&self, point: &PointSnapshot, frame: &Frame, pose: &SE3) -> MatchOutcome;
}
