//! Map data model and the state guarded by the map mutex.

pub mod candidates;
pub mod covisibility;
pub mod frame;
pub mod keyframes;
pub mod point;
pub mod state;
pub mod trash;
pub mod types;

pub use candidates::CandidateReport;
pub use covisibility::CovisibilityGraph;
pub use frame::{Descriptor, Feature, Frame, KeyPoint};
pub use keyframes::ConnectionReport;
pub use point::{Observation, Point, PointSnapshot, PointStatus, ReferenceSnapshot};
pub use state::{MapState, MapStats, PendingKeyframe};
pub use trash::{Trash, TrashReport};
pub use types::{FrameId, PointId};
