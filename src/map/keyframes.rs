//! Keyframe store: insertion, the need-keyframe policy, eviction and
//! covisibility commits.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::matching::MatchOutcome;

use super::frame::{Feature, Frame};
use super::point::{Observation, Point};
use super::state::{MapState, PendingKeyframe};
use super::types::FrameId;

/// Keyframes linked or unlinked by one `commit_connections` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub matched: usize,
    pub features_added: usize,
    pub connected: Vec<(FrameId, usize)>,
    pub disconnected: Vec<FrameId>,
}

impl MapState {
    /// Insert a keyframe. Returns false if the frame already is one.
    ///
    /// With `search` the keyframe becomes the next bundle-adjustment pivot
    /// and is searched for connections by the worker. Candidate seeding is
    /// done separately by `init_candidates`, since detection happens before
    /// the map lock is taken.
    pub fn add_keyframe(&mut self, frame: &Arc<Frame>, search: bool) -> bool {
        if !frame.mark_keyframe() {
            debug!("[KeyFrames] {} is already a keyframe", frame.id());
            return false;
        }

        // Register the points the frontend already associated.
        for feature in frame.features().iter() {
            feature
                .point
                .add_observation(Observation::new(frame, feature.pixel, feature.keypoint));
        }

        self.keyframes.push(frame.clone());
        self.last_keyframe = Some(frame.clone());
        self.reference_matches = frame.num_points();
        self.pending_keyframes.push(PendingKeyframe {
            frame: frame.clone(),
            search,
        });
        if search {
            self.ba_keyframe = Some(frame.clone());
        }

        info!(
            "[KeyFrames] added {} ({} points, {} keyframes, search={})",
            frame.id(),
            self.reference_matches,
            self.keyframes.len(),
            search
        );
        true
    }

    /// Decide whether `frame`, tracked with `matches` point matches, should
    /// become a keyframe. Has no side effects.
    pub fn need_keyframe(&self, frame: &Frame, matches: usize, relocalizing: bool) -> bool {
        if self.keyframes.is_empty() || relocalizing {
            return false;
        }

        let cfg = &self.config.keyframes;

        if self.reference_matches > 0
            && (matches as f64) < cfg.min_match_ratio * self.reference_matches as f64
        {
            return true;
        }

        let center = frame.camera_center();
        let Some((nearest, baseline)) = self
            .keyframes
            .iter()
            .filter(|kf| kf.id() != frame.id())
            .map(|kf| (kf, (kf.camera_center() - center).norm()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return false;
        };

        let depth = nearest.median_depth().unwrap_or(1.0);
        baseline / depth > cfg.min_baseline_ratio
    }

    /// Evict keyframes until at most `max_keyframes` remain. `frame` is never
    /// evicted. Returns the evicted ids.
    pub fn limit_keyframes(&mut self, frame: &Frame) -> Vec<FrameId> {
        let mut evicted = Vec::new();
        while self.keyframes.len() > self.config.max_keyframes {
            let Some(victim) = self.furthest_keyframe(frame) else {
                break;
            };
            evicted.push(victim.id());
            self.evict_keyframe(&victim);
        }
        evicted
    }

    /// The keyframe with the largest camera-center distance from `frame`.
    ///
    /// Ties go to the keyframe sharing fewer points with `frame`, then to the
    /// older one.
    pub fn furthest_keyframe(&self, frame: &Frame) -> Option<Arc<Frame>> {
        let center = frame.camera_center();
        let mut best: Option<(&Arc<Frame>, f64, usize)> = None;

        // Oldest first, so a strict comparison keeps the older one on ties.
        for kf in self.keyframes.iter().filter(|kf| kf.id() != frame.id()) {
            let distance = (kf.camera_center() - center).norm();
            let weight = self.graph.weight(kf.id(), frame.id());
            let better = match best {
                None => true,
                Some((_, d, w)) => distance > d || (distance == d && weight < w),
            };
            if better {
                best = Some((kf, distance, weight));
            }
        }

        best.map(|(kf, _, _)| kf.clone())
    }

    fn evict_keyframe(&mut self, kf: &Arc<Frame>) {
        let id = kf.id();
        self.graph.remove_node(id);
        self.keyframes.retain(|k| k.id() != id);
        self.pending_keyframes.retain(|p| p.frame.id() != id);
        if self.ba_keyframe.as_ref().is_some_and(|k| k.id() == id) {
            self.ba_keyframe = None;
        }
        if self.last_keyframe.as_ref().is_some_and(|k| k.id() == id) {
            self.last_keyframe = None;
        }

        let mut orphaned = 0;
        for point in kf.points() {
            point.remove_observation(id);
            if point.is_converged() && point.num_observations() == 0 {
                self.delete_point(&point);
                orphaned += 1;
            }
        }

        self.trash.frames.push(kf.clone());
        info!(
            "[KFCulling] evicted {} ({} orphaned points deleted, {} keyframes left)",
            id,
            orphaned,
            self.keyframes.len()
        );
    }

    /// Converged points observed by some keyframe other than `frame` that
    /// `frame` does not observe yet.
    pub(crate) fn connection_candidates(&self, frame: &Frame) -> Vec<Arc<Point>> {
        let observed = frame.point_ids();
        let frame_id = frame.id();
        self.points
            .values()
            .filter(|p| !observed.contains(&p.id()))
            .filter(|p| p.observations().iter().any(|o| o.frame_id != frame_id))
            .cloned()
            .collect()
    }

    /// Attach the matched points to `frame` and recompute its covisibility
    /// edges against every other keyframe.
    pub fn commit_connections(
        &mut self,
        frame: &Arc<Frame>,
        results: Vec<(Arc<Point>, MatchOutcome)>,
    ) -> ConnectionReport {
        let mut report = ConnectionReport::default();

        if self.keyframes.iter().all(|k| k.id() != frame.id()) {
            debug!("[KeyFrames] {} was evicted before its connections were committed", frame.id());
            return report;
        }

        for (point, outcome) in results {
            let MatchOutcome::Matched { pixel, keypoint, .. } = outcome else {
                continue;
            };
            report.matched += 1;
            if point.is_trashed() || !self.points.contains_key(&point.id()) {
                continue;
            }
            if frame.add_feature(Feature::new(pixel, keypoint, point.clone())) {
                point.add_observation(Observation::new(frame, pixel, keypoint));
                report.features_added += 1;
            }
        }

        // Associations of the newest keyframe arrive here, after insertion.
        if self.last_keyframe.as_ref().is_some_and(|k| k.id() == frame.id()) {
            self.reference_matches = frame.num_points();
        }

        let ours: HashSet<_> = frame.point_ids();
        let threshold = self.config.keyframes.covisibility_threshold;
        for other in self.keyframes.iter().filter(|k| k.id() != frame.id()) {
            let shared = other
                .point_ids()
                .iter()
                .filter(|id| ours.contains(id))
                .count();
            if shared > threshold {
                self.graph.set_edge(frame.id(), other.id(), shared);
                report.connected.push((other.id(), shared));
            } else if self.graph.remove_edge(frame.id(), other.id()) {
                report.disconnected.push(other.id());
            }
        }

        debug!(
            "[KeyFrames] {}: {} matches, {} new features, {} edges, {} dropped",
            frame.id(),
            report.matched,
            report.features_added,
            report.connected.len(),
            report.disconnected.len()
        );
        report
    }
}
