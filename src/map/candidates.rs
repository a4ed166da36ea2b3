//! Candidate lifecycle: seeding, match bookkeeping, promotion and deletion.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::matching::MatchOutcome;

use super::frame::{Feature, Frame, KeyPoint};
use super::point::{Observation, Point};
use super::state::MapState;

/// Tally of one `commit_candidate_results` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateReport {
    pub matched: usize,
    pub failed: usize,
    pub not_visible: usize,
    pub promoted: usize,
    pub discarded: usize,
    /// Candidates promoted or deleted while the matcher ran.
    pub skipped: usize,
}

impl MapState {
    /// Append a candidate. Returns false if the point is not a candidate.
    pub fn add_candidate(&mut self, point: Arc<Point>) -> bool {
        debug_assert!(point.is_candidate(), "add_candidate got {:?}", point.status());
        if !point.is_candidate() {
            warn!("[Candidates] ignoring non-candidate {} ({:?})", point.id(), point.status());
            return false;
        }
        self.candidates.push(point);
        true
    }

    /// Seed candidates from `frame` over a grid of `cell_size` cells.
    ///
    /// Cells already holding a Feature are skipped; every other cell gets at
    /// most one seed, its strongest keypoint. The seed sits on the
    /// keypoint's ray at the frame's median depth.
    pub fn init_candidates(&mut self, frame: &Arc<Frame>, detected: &[KeyPoint]) -> usize {
        let camera = frame.camera();
        let cell = self.config.cell_size.max(1) as f64;
        let cols = (camera.width as f64 / cell).ceil().max(1.0) as usize;
        let rows = (camera.height as f64 / cell).ceil().max(1.0) as usize;

        let cell_of = |u: f64, v: f64| -> Option<usize> {
            if u < 0.0 || v < 0.0 {
                return None;
            }
            let (c, r) = ((u / cell) as usize, (v / cell) as usize);
            (c < cols && r < rows).then_some(r * cols + c)
        };

        let mut occupied = vec![false; cols * rows];
        for feature in frame.features().iter() {
            if let Some(i) = cell_of(feature.pixel.x, feature.pixel.y) {
                occupied[i] = true;
            }
        }

        // Strongest keypoint per free cell
        let mut best: Vec<Option<usize>> = vec![None; cols * rows];
        for (idx, kp) in detected.iter().enumerate() {
            let Some(i) = cell_of(kp.pt.x, kp.pt.y) else {
                continue;
            };
            if occupied[i] {
                continue;
            }
            let current = best[i];
            match current {
                Some(j) if detected[j].response >= kp.response => {}
                _ => best[i] = Some(idx),
            }
        }

        let depth = frame
            .median_depth()
            .unwrap_or(self.config.candidates.default_depth);
        let pose = frame.pose();

        let mut seeded = 0;
        for idx in best.into_iter().flatten() {
            let kp = &detected[idx];
            // Normalized ray has z = 1, so scaling by depth lands at that depth.
            let p_cam = camera.normalized(&kp.pt) * depth;
            let keypoint = frame_keypoint_index(frame, kp);
            let point = Arc::new(Point::candidate(
                pose.transform_point(&p_cam),
                kp.descriptor,
                Observation::new(frame, kp.pt, keypoint),
            ));
            self.candidates.push(point);
            seeded += 1;
        }

        if seeded > 0 {
            self.n_initializations += 1;
        }
        debug!(
            "[Candidates] seeded {} candidates from {} (depth {:.3}, {} total)",
            seeded,
            frame.id(),
            depth,
            self.candidates.len()
        );
        seeded
    }

    /// Fold matcher outcomes for `frame` into the candidates.
    pub fn commit_candidate_results(
        &mut self,
        frame: &Arc<Frame>,
        results: Vec<(Arc<Point>, MatchOutcome)>,
    ) -> CandidateReport {
        let min_observations = self.config.candidates.min_observations;
        let max_failures = self.config.candidates.max_failures;
        let mut report = CandidateReport::default();

        for (point, outcome) in results {
            if !point.is_candidate() {
                report.skipped += 1;
                continue;
            }

            match outcome {
                MatchOutcome::Matched {
                    position,
                    pixel,
                    keypoint,
                } => {
                    report.matched += 1;
                    let successes =
                        point.record_success(position, Observation::new(frame, pixel, keypoint));
                    if successes >= min_observations {
                        self.promote_candidate(&point);
                        report.promoted += 1;
                    }
                }
                MatchOutcome::Failed => {
                    report.failed += 1;
                    if point.record_failure() >= max_failures {
                        self.discard_candidate(&point);
                        report.discarded += 1;
                    }
                }
                MatchOutcome::NotVisible => report.not_visible += 1,
            }
        }

        if report.promoted > 0 {
            info!(
                "[Candidates] promoted {} candidates ({} points in map)",
                report.promoted,
                self.points.len()
            );
        }
        debug!(
            "[Candidates] {}: {} matched, {} failed, {} not visible, {} discarded, {} skipped",
            frame.id(),
            report.matched,
            report.failed,
            report.not_visible,
            report.discarded,
            report.skipped
        );
        report
    }

    /// Move a candidate into the active map and give it Features in its
    /// reference keyframe and in every matched keyframe.
    fn promote_candidate(&mut self, point: &Arc<Point>) {
        point.promote();
        self.candidates.retain(|c| c.id() != point.id());
        self.points.insert(point.id(), point.clone());

        let reference = point.reference();
        for obs in reference.into_iter().chain(point.matches()) {
            let Some(frame) = obs.frame.upgrade() else {
                continue;
            };
            if !frame.is_keyframe() {
                continue;
            }
            if frame.add_feature(Feature::new(obs.pixel, obs.keypoint, point.clone())) {
                point.add_observation(obs);
            }
        }
    }

    /// Drop a candidate that failed too often. Nothing holds a Feature for a
    /// candidate, so it bypasses the trash.
    fn discard_candidate(&mut self, point: &Arc<Point>) {
        point.mark_trashed();
        self.candidates.retain(|c| c.id() != point.id());
    }

    /// Logically delete a point. Returns false if it was already trashed.
    pub fn delete_point(&mut self, point: &Arc<Point>) -> bool {
        if !point.mark_trashed() {
            return false;
        }
        let id = point.id();
        self.candidates.retain(|c| c.id() != id);
        self.points.remove(&id);
        self.trash.points.push(point.clone());
        true
    }

    /// Clear the tracker's `selected` flag on every active point.
    pub fn reset_selected(&mut self) {
        for point in self.points.values() {
            point.set_selected(false);
        }
    }
}

/// Index of `kp` in the frame's own keypoints, if it came from there.
fn frame_keypoint_index(frame: &Frame, kp: &KeyPoint) -> Option<usize> {
    frame
        .keypoints()
        .iter()
        .position(|k| k.pt == kp.pt && k.descriptor == kp.descriptor)
}
