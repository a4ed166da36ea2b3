//! Map maintenance run by the background worker.
//!
//! Each maintenance step follows the copy-out/compute/commit pattern: state
//! is snapshotted under the map lock, the expensive work runs without it,
//! and the results are committed under the lock again.

pub mod bundle;
pub mod candidate_update;
pub mod connections;
pub mod gauge;
mod worker;

pub use bundle::{bundle_adjustment, BundleOutcome};
pub use candidate_update::update_candidates;
pub use connections::check_connections;
pub use gauge::{transform_initial_map, GaugeTransform};
pub use worker::{CycleReport, MapWorker};
