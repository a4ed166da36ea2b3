//! MapState - every container guarded by the map-wide mutex.
//!
//! The MapState holds:
//! - the inbound frame queue (FIFO) the worker drains
//! - insertion-ordered keyframes and their covisibility graph
//! - candidate points and converged (active) points
//! - the trash for deferred reclamation
//!
//! Operations live next to the data they touch: keyframe policy in
//! `keyframes.rs`, the candidate lifecycle in `candidates.rs`, reclamation
//! in `trash.rs`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::config::MapConfig;

use super::covisibility::CovisibilityGraph;
use super::frame::Frame;
use super::point::Point;
use super::trash::Trash;
use super::types::PointId;

/// A keyframe inserted since the worker last ran its keyframe steps.
#[derive(Debug, Clone)]
pub struct PendingKeyframe {
    pub frame: Arc<Frame>,
    /// Whether the keyframe should be searched for connections.
    pub search: bool,
}

pub struct MapState {
    pub(crate) config: MapConfig,

    /// Frames waiting for the worker, oldest first.
    pub(crate) frame_queue: VecDeque<Arc<Frame>>,

    /// Keyframes in insertion order (oldest first).
    pub(crate) keyframes: Vec<Arc<Frame>>,

    pub(crate) graph: CovisibilityGraph,

    /// Points still being triangulated.
    pub(crate) candidates: Vec<Arc<Point>>,

    /// Converged points.
    pub(crate) points: HashMap<PointId, Arc<Point>>,

    pub(crate) trash: Trash,

    pub(crate) pending_keyframes: Vec<PendingKeyframe>,

    /// Pivot of the next bundle adjustment.
    pub(crate) ba_keyframe: Option<Arc<Frame>>,

    pub(crate) last_keyframe: Option<Arc<Frame>>,

    /// Number of point-bearing features of the last keyframe.
    pub(crate) reference_matches: usize,

    /// Set once the gauge has been fixed.
    pub(crate) initialized: bool,

    /// Number of keyframes that seeded at least one candidate.
    pub(crate) n_initializations: usize,
}

/// Counts describing the map at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapStats {
    pub num_keyframes: usize,
    pub num_candidates: usize,
    pub num_points: usize,
    pub queue_len: usize,
    pub num_edges: usize,
    pub trashed_points: usize,
    pub trashed_frames: usize,
    pub initialized: bool,
    pub n_initializations: usize,
}

impl MapState {
    pub fn new(config: MapConfig) -> Self {
        Self {
            config,
            frame_queue: VecDeque::new(),
            keyframes: Vec::new(),
            graph: CovisibilityGraph::new(),
            candidates: Vec::new(),
            points: HashMap::new(),
            trash: Trash::default(),
            pending_keyframes: Vec::new(),
            ba_keyframe: None,
            last_keyframe: None,
            reference_matches: 0,
            initialized: false,
            n_initializations: 0,
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame queue
    // ─────────────────────────────────────────────────────────────────────────

    pub fn push_frame(&mut self, frame: Arc<Frame>) {
        self.frame_queue.push_back(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Arc<Frame>> {
        self.frame_queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.frame_queue.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Keyframes, oldest first.
    pub fn keyframes(&self) -> &[Arc<Frame>] {
        &self.keyframes
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn candidates(&self) -> &[Arc<Point>] {
        &self.candidates
    }

    pub fn points(&self) -> impl Iterator<Item = &Arc<Point>> {
        self.points.values()
    }

    pub fn point(&self, id: PointId) -> Option<&Arc<Point>> {
        self.points.get(&id)
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn graph(&self) -> &CovisibilityGraph {
        &self.graph
    }

    pub fn last_keyframe(&self) -> Option<&Arc<Frame>> {
        self.last_keyframe.as_ref()
    }

    pub fn ba_keyframe(&self) -> Option<&Arc<Frame>> {
        self.ba_keyframe.as_ref()
    }

    pub fn reference_matches(&self) -> usize {
        self.reference_matches
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn n_initializations(&self) -> usize {
        self.n_initializations
    }

    pub fn has_pending_keyframes(&self) -> bool {
        !self.pending_keyframes.is_empty()
    }

    pub(crate) fn take_pending_keyframes(&mut self) -> Vec<PendingKeyframe> {
        std::mem::take(&mut self.pending_keyframes)
    }

    /// Put back keyframes taken but not processed. They run before any
    /// inserted since; evicted ones are dropped.
    pub(crate) fn restore_pending_keyframes(&mut self, mut restored: Vec<PendingKeyframe>) {
        restored.retain(|p| self.keyframes.iter().any(|k| k.id() == p.frame.id()));
        restored.append(&mut self.pending_keyframes);
        self.pending_keyframes = restored;
    }

    /// Insert a converged point directly, as the frontend does when it
    /// bootstraps the map from two views.
    pub fn add_point(&mut self, point: Arc<Point>) {
        debug_assert!(point.is_converged(), "add_point expects a converged point");
        self.points.insert(point.id(), point);
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            num_keyframes: self.keyframes.len(),
            num_candidates: self.candidates.len(),
            num_points: self.points.len(),
            queue_len: self.frame_queue.len(),
            num_edges: self.graph.num_edges(),
            trashed_points: self.trash.points.len(),
            trashed_frames: self.trash.frames.len(),
            initialized: self.initialized,
            n_initializations: self.n_initializations,
        }
    }
}

impl std::fmt::Debug for MapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapState").field("stats", &self.stats()).finish()
    }
}
