//! Map worker - the background thread that refines the map.
//!
//! Each cycle processes at most one queued frame:
//! 1. Candidate update against the frame (unless relocalizing or halted)
//! 2. Connection search and keyframe limiting for new keyframes
//! 3. Gauge fixing of the bootstrap map
//! 4. Local bundle adjustment around the latest searched keyframe
//! 5. Trash collection

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::map::{CandidateReport, ConnectionReport, Frame, FrameId, TrashReport};
use crate::matching::Matcher;
use crate::optimizer::BundleSolver;
use crate::system::SharedState;

use super::bundle::{bundle_adjustment, BundleOutcome};
use super::candidate_update::update_candidates;
use super::connections::check_connections;
use super::gauge::transform_initial_map;

/// What one `update_map` cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub frame: Option<FrameId>,
    pub candidates: Option<CandidateReport>,
    pub connections: Vec<(FrameId, ConnectionReport)>,
    pub evicted: Vec<FrameId>,
    pub gauge_fixed: bool,
    pub bundle: Option<BundleOutcome>,
    pub trash: TrashReport,
}

pub struct MapWorker {
    shared: Arc<SharedState>,
    matcher: Arc<dyn Matcher>,
    solver: Arc<dyn BundleSolver>,
    poll_interval: Duration,
}

impl MapWorker {
    pub fn new(shared: Arc<SharedState>, matcher: Arc<dyn Matcher>, solver: Arc<dyn BundleSolver>) -> Self {
        let poll_interval = Duration::from_millis(shared.lock().config().worker.poll_interval_ms);
        Self {
            shared,
            matcher,
            solver,
            poll_interval,
        }
    }

    /// Main thread loop. Runs until shutdown is requested.
    pub fn run(&self) {
        info!("[MapWorker] started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            let (frame, has_keyframes) = {
                let mut state = self.shared.lock();
                (state.pop_frame(), state.has_pending_keyframes())
            };
            if frame.is_none() && !has_keyframes {
                // Idle until rung; the timeout bounds shutdown latency.
                self.shared.wait(self.poll_interval);
                continue;
            }

            let report = self.update_map(frame.as_ref());
            debug!(
                "[MapWorker] cycle on {:?}: {} evicted, bundle {:?}, {} reclaimed",
                report.frame,
                report.evicted.len(),
                report.bundle,
                report.trash.reclaimed()
            );
        }
        info!("[MapWorker] stopped");
    }

    /// Pop the next queued frame and run one cycle on it. Returns None if
    /// there was no work.
    pub fn step(&self) -> Option<CycleReport> {
        let (frame, has_keyframes) = {
            let mut state = self.shared.lock();
            (state.pop_frame(), state.has_pending_keyframes())
        };
        if frame.is_none() && !has_keyframes {
            return None;
        }
        Some(self.update_map(frame.as_ref()))
    }

    /// One maintenance cycle. `frame` is the frame popped from the queue.
    pub fn update_map(&self, frame: Option<&Arc<Frame>>) -> CycleReport {
        let shared = self.shared.as_ref();
        let mut report = CycleReport {
            frame: frame.map(|f| f.id()),
            ..CycleReport::default()
        };

        // Step 1: Candidate update
        if let Some(frame) = frame {
            if shared.should_update_candidates() {
                report.candidates = update_candidates(shared, self.matcher.as_ref(), frame);
            }
        }

        // Step 2: New keyframes
        let mut pending: VecDeque<_> = shared.lock().take_pending_keyframes().into();
        while let Some(kf) = pending.pop_front() {
            let searched = !shared.is_shutdown_requested()
                && (!kf.search
                    || match check_connections(shared, self.matcher.as_ref(), &kf.frame) {
                        Some(connections) => {
                            report.connections.push((kf.frame.id(), connections));
                            true
                        }
                        None => false,
                    });
            if !searched {
                // Cancelled: the rest waits for the next run.
                pending.push_front(kf);
                shared.lock().restore_pending_keyframes(pending.into());
                break;
            }
            let mut state = shared.lock();
            report.evicted.extend(state.limit_keyframes(&kf.frame));
        }

        // Step 3: Gauge fixing
        {
            let mut state = shared.lock();
            if !state.is_initialized() && state.num_keyframes() >= 2 {
                if let Some(reference) = state.last_keyframe().cloned() {
                    report.gauge_fixed = transform_initial_map(&mut state, &reference);
                }
            }
        }

        // Step 4: Local BA
        let ready = {
            let state = shared.lock();
            state.is_initialized() && state.ba_keyframe().is_some()
        };
        if ready && !shared.is_relocalizing() && !shared.is_shutdown_requested() {
            let outcome = bundle_adjustment(shared, self.solver.as_ref());
            if outcome == BundleOutcome::Diverged {
                warn!("[MapWorker] local BA diverged");
            }
            report.bundle = Some(outcome);
        }

        // Step 5: Reclamation
        report.trash = shared.lock().empty_trash();
        report
    }
}
