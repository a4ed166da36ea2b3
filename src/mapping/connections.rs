//! Connection search for a newly inserted keyframe.
//!
//! Active points observed elsewhere are reprojected into the keyframe; the
//! matched ones become features and the keyframe's covisibility edges are
//! recomputed from the points it now shares.

use std::sync::Arc;

use tracing::debug;

use crate::map::{ConnectionReport, Frame, Point, PointSnapshot};
use crate::matching::{MatchOutcome, Matcher};
use crate::system::SharedState;

pub fn check_connections(shared: &SharedState, matcher: &dyn Matcher, frame: &Arc<Frame>) -> Option<ConnectionReport> {
    let (snapshots, pose): (Vec<(Arc<Point>, PointSnapshot)>, _) = {
        let state = shared.lock();
        let snapshots = state
            .connection_candidates(frame)
            .into_iter()
            .map(|p| {
                let snapshot = p.snapshot();
                (p, snapshot)
            })
            .collect();
        (snapshots, frame.pose())
    };

    let mut results: Vec<(Arc<Point>, MatchOutcome)> = Vec::new();
    for (point, snapshot) in snapshots {
        if shared.is_shutdown_requested() {
            debug!("[KeyFrames] connection search for {} cancelled", frame.id());
            return None;
        }
        let outcome = matcher.match_or_triangulate(&snapshot, frame, &pose);
        if outcome.is_matched() {
            results.push((point, outcome));
        }
    }

    let mut state = shared.lock();
    Some(state.commit_connections(frame, results))
}
