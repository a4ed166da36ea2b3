//! Shared state between the producer (tracking frontend) and the map worker.
//!
//! The `SharedState` holds the map behind one mutex plus the lock-free flags
//! both sides poll, and the doorbell channel that wakes the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::config::MapConfig;
use crate::map::MapState;

/// Shared state accessible by the producer and the map worker.
pub struct SharedState {
    /// Every container of the map. Held only for short, bounded sections;
    /// never across a detector, matcher or solver call.
    pub map: Mutex<MapState>,

    /// Set by the frontend while it is relocalizing. Read with relaxed
    /// ordering: the worker may act on a value one cycle stale.
    relocalizing: AtomicBool,

    /// Explicit pause of candidate updating.
    candidates_halt: AtomicBool,

    /// Cancellation token of the worker.
    shutdown_requested: AtomicBool,

    /// Doorbell: a pending ring means "there may be work".
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl SharedState {
    pub fn new(config: MapConfig) -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        Arc::new(Self {
            map: Mutex::new(MapState::new(config)),
            relocalizing: AtomicBool::new(false),
            candidates_halt: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, MapState> {
        self.map.lock()
    }

    pub fn is_relocalizing(&self) -> bool {
        self.relocalizing.load(Ordering::Relaxed)
    }

    pub fn set_relocalizing(&self, value: bool) {
        self.relocalizing.store(value, Ordering::Relaxed);
    }

    pub fn is_candidates_halted(&self) -> bool {
        self.candidates_halt.load(Ordering::Relaxed)
    }

    pub fn set_candidates_halt(&self, value: bool) {
        self.candidates_halt.store(value, Ordering::Relaxed);
    }

    /// Candidate updating pauses while relocalizing or when halted.
    pub fn should_update_candidates(&self) -> bool {
        !self.is_relocalizing() && !self.is_candidates_halted()
    }

    /// Request shutdown of the map worker.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.ring();
    }

    /// Re-arm the cancellation token before a restart.
    pub fn clear_shutdown(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wake the worker. Coalesces with a ring that is still pending.
    pub fn ring(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Block until rung or `timeout` elapses. Returns true if rung.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // Both ends live in self, so this cannot happen while self exists.
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
