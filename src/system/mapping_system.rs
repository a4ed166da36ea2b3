//! Mapping System - main entry point and worker thread orchestration.
//!
//! The `MappingSystem` is the facade the tracking frontend talks to. It owns
//! the shared state, the pluggable detector/matcher/solver, and the handle of
//! the `map-worker` thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::MutexGuard;
use tracing::{info, warn};

use crate::config::MapConfig;
use crate::map::{Frame, FrameId, MapState, MapStats, Point, TrashReport};
use crate::mapping::{bundle_adjustment, transform_initial_map, BundleOutcome, CycleReport, MapWorker};
use crate::matching::{EpipolarMatcher, FeatureDetector, GridDetector, Matcher};
use crate::optimizer::{BundleSolver, LmSolver};

use super::shared_state::SharedState;

pub struct MappingSystem {
    shared: Arc<SharedState>,
    detector: Arc<dyn FeatureDetector>,
    solver: Arc<dyn BundleSolver>,
    worker: Arc<MapWorker>,
    cell_size: u32,
    max_queue_len: usize,
    handle: Option<JoinHandle<()>>,
}

impl MappingSystem {
    /// Create a system with the reference detector, matcher and solver.
    /// The worker is not started.
    pub fn new(config: MapConfig) -> Result<Self> {
        let detector = Arc::new(GridDetector::new(config.matcher.border));
        let matcher = Arc::new(EpipolarMatcher::new(config.matcher.clone()));
        let solver = Arc::new(LmSolver::new(&config.bundle));
        Self::with_components(config, detector, matcher, solver)
    }

    pub fn with_components(
        config: MapConfig,
        detector: Arc<dyn FeatureDetector>,
        matcher: Arc<dyn Matcher>,
        solver: Arc<dyn BundleSolver>,
    ) -> Result<Self> {
        config.validate().context("invalid map configuration")?;
        let cell_size = config.cell_size;
        let max_queue_len = config.worker.max_queue_len;

        let shared = SharedState::new(config);
        let worker = Arc::new(MapWorker::new(shared.clone(), matcher, solver.clone()));

        Ok(Self {
            shared,
            detector,
            solver,
            worker,
            cell_size,
            max_queue_len,
            handle: None,
        })
    }

    /// Spawn the `map-worker` thread.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("[MapWorker] start() called while already running");
            return Ok(());
        }
        self.shared.clear_shutdown();

        let worker = Arc::clone(&self.worker);
        let handle = thread::Builder::new()
            .name("map-worker".into())
            .spawn(move || worker.run())
            .context("failed to spawn the map worker thread")?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Cancel the worker and wait for it. A no-op when not running.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.request_shutdown();
        if handle.join().is_err() {
            warn!("[MapWorker] worker thread panicked");
        }
        info!("[MapWorker] joined");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Run one worker cycle on the calling thread. Meant for a system that
    /// was not started.
    pub fn run_cycle(&self) -> Option<CycleReport> {
        self.worker.step()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Scoped guard over the whole map.
    pub fn lock(&self) -> MutexGuard<'_, MapState> {
        self.shared.lock()
    }

    /// Queue a processed frame for candidate updating.
    pub fn add_frame(&self, frame: Arc<Frame>) {
        self.shared.lock().push_frame(frame);
        self.shared.ring();
    }

    /// Insert `frame` as a keyframe and queue it. With `search` it also
    /// becomes the bundle-adjustment pivot and seeds candidates.
    pub fn add_keyframe(&self, frame: &Arc<Frame>, search: bool) -> bool {
        let detected = if search && !frame.is_keyframe() {
            self.detector.detect(frame, self.cell_size)
        } else {
            Vec::new()
        };

        let inserted = {
            let mut state = self.shared.lock();
            let inserted = state.add_keyframe(frame, search);
            if inserted {
                if search {
                    state.init_candidates(frame, &detected);
                }
                state.push_frame(frame.clone());
            }
            inserted
        };
        if inserted {
            self.shared.ring();
        }
        inserted
    }

    pub fn add_candidate(&self, point: Arc<Point>) -> bool {
        self.shared.lock().add_candidate(point)
    }

    pub fn delete_point(&self, point: &Arc<Point>) -> bool {
        self.shared.lock().delete_point(point)
    }

    pub fn set_relocalizing(&self, value: bool) {
        self.shared.set_relocalizing(value);
    }

    pub fn set_candidates_halt(&self, value: bool) {
        self.shared.set_candidates_halt(value);
    }

    pub fn need_keyframe(&self, frame: &Frame, matches: usize) -> bool {
        let relocalizing = self.shared.is_relocalizing();
        self.shared.lock().need_keyframe(frame, matches, relocalizing)
    }

    pub fn empty_trash(&self) -> TrashReport {
        self.shared.lock().empty_trash()
    }

    pub fn transform_initial_map(&self, frame: &Frame) -> bool {
        let mut state = self.shared.lock();
        transform_initial_map(&mut state, frame)
    }

    pub fn bundle_adjustment(&self) -> BundleOutcome {
        bundle_adjustment(&self.shared, self.solver.as_ref())
    }

    pub fn limit_keyframes(&self, frame: &Frame) -> Vec<FrameId> {
        self.shared.lock().limit_keyframes(frame)
    }

    pub fn reset_selected(&self) {
        self.shared.lock().reset_selected();
    }

    pub fn stats(&self) -> MapStats {
        self.shared.lock().stats()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue_len()
    }

    /// True when the frontend should hold off creating keyframes.
    pub fn is_backlogged(&self) -> bool {
        self.queue_len() > self.max_queue_len
    }
}

impl Drop for MappingSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::{KeyPoint, PointSnapshot};
    use crate::matching::MatchOutcome;
    use crate::test_helpers::{
        candidate_seeded_by, converged_point_at, ground_plane_scene, observe, test_frame_with_keypoints, translated,
    };
    use nalgebra::{Vector2, Vector3};
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    /// Matcher that always triangulates the candidate where it already is,
    /// and records which frames it was asked about.
    #[derive(Default)]
    struct ScriptedMatcher {
        seen: Mutex<Vec<FrameId>>,
    }

    impl Matcher for ScriptedMatcher {
        fn match_or_triangulate(&self, snapshot: &PointSnapshot, frame: &Frame, _: &SE3) -> MatchOutcome {
            self.seen.lock().push(frame.id());
            MatchOutcome::Matched {
                position: snapshot.position,
                pixel: Vector2::new(320.0, 240.0),
                keypoint: None,
            }
        }
    }

    fn scripted_system(config: MapConfig) -> (MappingSystem, Arc<ScriptedMatcher>) {
        let matcher = Arc::new(ScriptedMatcher::default());
        let system = MappingSystem::with_components(
            config,
            Arc::new(GridDetector::default()),
            matcher.clone(),
            Arc::new(LmSolver::default()),
        )
        .unwrap();
        (system, matcher)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(MappingSystem::new(MapConfig::new(0, 5)).is_err());
    }

    #[test]
    fn test_ground_plane_gauge() {
        let system = MappingSystem::new(MapConfig::new(30, 5)).unwrap();
        let scene = {
            let mut state = system.lock();
            ground_plane_scene(&mut state, 50)
        };
        assert!(system.transform_initial_map(&scene.keyframes[1]));
        for p in &scene.points {
            assert!(p.position().z.abs() < 1e-9);
        }
        assert!(system.stats().initialized);
    }

    #[test]
    fn test_sixth_keyframe_evicts_furthest() {
        let system = MappingSystem::new(MapConfig::new(30, 5)).unwrap();
        let kfs: Vec<_> = [3.0, 1.0, 0.5, -2.0, 0.2]
            .iter()
            .map(|&x| translated(x, 0.0, 0.0))
            .collect();
        for kf in &kfs {
            assert!(system.add_keyframe(kf, false));
        }
        let newest = translated(0.0, 0.0, 0.0);
        assert!(system.add_keyframe(&newest, false));
        assert_eq!(system.lock().num_keyframes(), 6);

        let evicted = system.limit_keyframes(&newest);
        assert_eq!(evicted, vec![kfs[0].id()]);
        let state = system.lock();
        assert_eq!(state.num_keyframes(), 5);
        assert!(state.keyframes().iter().all(|k| k.id() != kfs[0].id()));
    }

    #[test]
    fn test_need_keyframe_on_match_drop() {
        let system = MappingSystem::new(MapConfig::default()).unwrap();
        let reference = translated(0.0, 0.0, 0.0);
        for i in 0..20 {
            let p = converged_point_at(Vector3::new(-1.0 + 0.1 * i as f64, 0.0, 5.0));
            observe(&reference, &p);
            system.lock().add_point(p);
        }
        system.add_keyframe(&reference, false);
        assert_eq!(system.lock().reference_matches(), 20);

        let frame = translated(0.01, 0.0, 0.0);
        assert!(system.need_keyframe(&frame, 9));
        assert!(!system.need_keyframe(&frame, 18));

        system.set_relocalizing(true);
        assert!(!system.need_keyframe(&frame, 9));
    }

    #[test]
    fn test_candidate_converges_after_repeated_matches() {
        let (system, _) = scripted_system(MapConfig::default());
        let reference = translated(0.0, 0.0, 0.0);
        system.add_keyframe(&reference, false);
        let candidate = candidate_seeded_by(&reference);
        assert!(system.add_candidate(candidate.clone()));
        // Drain the keyframe's own cycle.
        system.run_cycle();
        assert_eq!(candidate.successes(), 1);

        for i in 0..10 {
            system.add_frame(translated(0.1 * (i + 1) as f64, 0.0, 0.0));
            system.run_cycle();
            if candidate.successes() < 5 {
                assert!(candidate.is_candidate());
            }
        }

        assert!(candidate.is_converged());
        let state = system.lock();
        assert!(state.point(candidate.id()).is_some());
        assert!(state.candidates().iter().all(|c| c.id() != candidate.id()));
        assert!(reference.observes(candidate.id()));
    }

    #[test]
    fn test_worker_thread_processes_frames_in_order() {
        let (mut system, matcher) = scripted_system(MapConfig::default());
        let reference = translated(0.0, 0.0, 0.0);
        system.add_keyframe(&reference, false);
        system.run_cycle();
        // Four matches stay below the promotion threshold.
        let candidate = candidate_seeded_by(&reference);
        system.add_candidate(candidate.clone());

        system.start().unwrap();
        assert!(system.is_running());
        let frames: Vec<_> = (0..4).map(|i| translated(i as f64 * 0.1, 0.0, 0.0)).collect();
        for f in &frames {
            system.add_frame(f.clone());
        }
        assert!(wait_until(|| matcher.seen.lock().len() >= 4));
        system.stop();
        assert!(!system.is_running());

        let seen = matcher.seen.lock().clone();
        let expected: Vec<_> = frames.iter().map(|f| f.id()).collect();
        assert_eq!(seen[..4], expected[..]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut system = MappingSystem::new(MapConfig::default()).unwrap();
        system.stop();
        system.start().unwrap();
        system.start().unwrap();
        system.stop();
        system.stop();
        assert!(!system.is_running());

        // Restartable after a stop.
        system.start().unwrap();
        system.add_frame(translated(0.0, 0.0, 0.0));
        assert!(wait_until(|| system.queue_len() == 0));
        system.stop();
    }

    #[test]
    fn test_deleted_point_reclaimed_after_release() {
        let system = MappingSystem::new(MapConfig::default()).unwrap();
        let kf = translated(0.0, 0.0, 0.0);
        let frontend = translated(0.1, 0.0, 0.0);
        let point = converged_point_at(Vector3::new(0.0, 0.0, 3.0));
        observe(&kf, &point);
        observe(&frontend, &point);
        system.lock().add_point(point.clone());
        system.add_keyframe(&kf, false);

        let weak = Arc::downgrade(&point);
        assert!(system.delete_point(&point));
        drop(point);

        // The frontend frame still holds a Feature.
        assert_eq!(system.empty_trash().points_reclaimed, 0);
        assert!(weak.upgrade().is_some());

        frontend.release_all();
        assert_eq!(system.empty_trash().points_reclaimed, 1);
        assert!(weak.upgrade().is_none());
        assert_eq!(system.empty_trash(), TrashReport::default());
    }

    #[test]
    fn test_keyframe_with_search_seeds_candidates() {
        let system = MappingSystem::new(MapConfig::default()).unwrap();
        let keypoints = vec![
            KeyPoint::new(Vector2::new(100.0, 100.0), 1.0, Default::default()),
            KeyPoint::new(Vector2::new(105.0, 102.0), 2.0, Default::default()),
            KeyPoint::new(Vector2::new(400.0, 300.0), 1.0, Default::default()),
        ];
        let frame = test_frame_with_keypoints(SE3::identity(), keypoints);
        assert!(system.add_keyframe(&frame, true));
        assert!(!system.add_keyframe(&frame, true));

        let state = system.lock();
        assert_eq!(state.candidates().len(), 2);
        assert_eq!(state.n_initializations(), 1);
        assert_eq!(state.ba_keyframe().map(|k| k.id()), Some(frame.id()));
        assert_eq!(state.queue_len(), 1);
    }

    #[test]
    fn test_backlog_hint() {
        let system = MappingSystem::new(MapConfig::default()).unwrap();
        for _ in 0..4 {
            system.add_frame(translated(0.0, 0.0, 0.0));
        }
        assert!(system.is_backlogged());
    }
}
