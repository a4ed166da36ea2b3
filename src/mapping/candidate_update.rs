//! Candidate updating against one processed frame.
//!
//! Snapshot the candidates under the lock, match them without it, then
//! commit the outcomes under the lock again. A cancellation between the
//! phases abandons the results.

use std::sync::Arc;

use tracing::debug;

use crate::map::{CandidateReport, Frame, Point, PointSnapshot};
use crate::matching::{MatchOutcome, Matcher};
use crate::system::SharedState;

pub fn update_candidates(shared: &SharedState, matcher: &dyn Matcher, frame: &Arc<Frame>) -> Option<CandidateReport> {
    let (snapshots, pose): (Vec<(Arc<Point>, PointSnapshot)>, _) = {
        let state = shared.lock();
        let snapshots = state
            .candidates()
            .iter()
            .map(|p| (p.clone(), p.snapshot()))
            .collect();
        (snapshots, frame.pose())
    };
    if snapshots.is_empty() {
        return Some(CandidateReport::default());
    }

    let mut results: Vec<(Arc<Point>, MatchOutcome)> = Vec::with_capacity(snapshots.len());
    for (point, snapshot) in snapshots {
        if shared.is_shutdown_requested() {
            debug!("[Candidates] update against {} cancelled", frame.id());
            return None;
        }
        let outcome = matcher.match_or_triangulate(&snapshot, frame, &pose);
        results.push((point, outcome));
    }

    let mut state = shared.lock();
    Some(state.commit_candidate_results(frame, results))
}
