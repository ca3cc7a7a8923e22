//! Index update engine — single-flight background rebuilds.
//!
//! The engine owns a generation counter. Every completed rebuild bumps it
//! exactly once. Callers ask for "a rebuild covering everything known as
//! of now" and can block until a rebuild that started after their call
//! has finished.
//!
//! ```text
//!   request_rebuild()  ──┐
//!   wait_for_rebuild() ──┼──> RebuildState { generation, requested, phase }
//!                        │          │  Condvar
//!   watcher thread ──────┘          ▼
//!                           engine thread: Indexer::rebuild()
//!                                   │
//!                                   ├─> cache.invalidate(generation)
//!                                   └─> watcher.request_rescan()
//! ```

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::Invalidate;
use crate::cancel::CancelToken;
use crate::error::UpdateError;
use crate::indexer::Indexer;
use crate::watcher::RescanRequest;

/// Anything that can be asked for a rebuild. Implemented by [`UpdateEngine`];
/// the watcher only sees this interface.
pub trait RebuildTrigger: Send + Sync {
    fn request_rebuild(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requested,
    Rebuilding,
}

/// Snapshot of the rebuild state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildState {
    /// Number of completed rebuilds.
    pub generation: u64,
    /// Generation that must be reached to satisfy every request so far.
    pub requested_generation: u64,
    pub phase: Phase,
    stopped: bool,
}

impl RebuildState {
    fn new() -> Self {
        Self {
            generation: 0,
            requested_generation: 0,
            phase: Phase::Idle,
            stopped: false,
        }
    }

    /// First generation whose rebuild is guaranteed to start after now.
    ///
    /// While rebuilding, `generation + 1` is the rebuild already in flight,
    /// which may have read its inputs before the caller's change.
    fn next_target(&self) -> u64 {
        match self.phase {
            Phase::Rebuilding => self.generation + 2,
            Phase::Idle | Phase::Requested => self.generation + 1,
        }
    }

    fn pending(&self) -> bool {
        self.requested_generation > self.generation
    }

    fn request(&mut self) -> bool {
        let target = self.next_target();
        if self.requested_generation >= target {
            return false;
        }
        self.requested_generation = target;
        if self.phase == Phase::Idle {
            self.phase = Phase::Requested;
        }
        true
    }
}

/// Background rebuild engine. Run [`UpdateEngine::run`] on a dedicated thread.
pub struct UpdateEngine {
    state: Mutex<RebuildState>,
    changed: Condvar,
    indexer: Arc<dyn Indexer>,
    cache: Arc<dyn Invalidate>,
    watcher: Mutex<Option<Weak<dyn RescanRequest>>>,
    poll_interval: Duration,
}

impl UpdateEngine {
    pub fn new(
        indexer: Arc<dyn Indexer>,
        cache: Arc<dyn Invalidate>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(RebuildState::new()),
            changed: Condvar::new(),
            indexer,
            cache,
            watcher: Mutex::new(None),
            poll_interval,
        }
    }

    /// Attach the watcher whose watch list should be refreshed after rebuilds.
    ///
    /// The engine never keeps the watcher alive.
    pub fn attach_watcher(&self, watcher: Weak<dyn RescanRequest>) {
        *self.watcher.lock() = Some(watcher);
    }

    /// Ask the attached watcher, if any, to recompute its watch list.
    pub fn request_rescan(&self) {
        let watcher = self.watcher.lock().as_ref().and_then(Weak::upgrade);
        match watcher {
            Some(watcher) => watcher.request_rescan(),
            None => debug!("no watcher attached, rescan skipped"),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn state(&self) -> RebuildState {
        *self.state.lock()
    }

    /// Block until a rebuild that started at or after this call has completed.
    ///
    /// Forces a rebuild when none is pending. Returns the generation reached.
    pub fn wait_for_rebuild(&self) -> Result<u64, UpdateError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(UpdateError::Stopped);
        }

        let target = state.next_target().max(state.requested_generation);
        if state.request() {
            self.changed.notify_all();
        }
        debug!(target, generation = state.generation, "waiting for rebuild");

        while state.generation < target {
            if state.stopped {
                return Err(UpdateError::Stopped);
            }
            self.changed.wait(&mut state);
        }
        Ok(state.generation)
    }

    /// Engine loop. Returns once `cancel` is observed; a rebuild in progress
    /// is always allowed to finish first.
    pub fn run(&self, cancel: &CancelToken) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "update engine started"
        );

        while !cancel.is_cancelled() {
            let target = {
                let mut state = self.state.lock();
                if !state.pending() {
                    self.changed.wait_for(&mut state, self.poll_interval);
                    continue;
                }
                state.phase = Phase::Rebuilding;
                state.generation + 1
            };
            self.rebuild(target);
        }

        let mut state = self.state.lock();
        state.stopped = true;
        self.changed.notify_all();
        info!(generation = state.generation, "update engine stopped");
    }

    fn rebuild(&self, target: u64) {
        info!(generation = target, "rebuilding index");
        let started = Instant::now();

        match catch_unwind(AssertUnwindSafe(|| self.indexer.rebuild())) {
            Ok(Ok(stats)) => info!(
                generation = target,
                files_checked = stats.files_checked,
                files_indexed = stats.files_indexed,
                files_removed = stats.files_removed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "index rebuilt"
            ),
            Ok(Err(e)) => error!(generation = target, code = e.code(), error = %e, "index rebuild failed"),
            Err(_) => error!(generation = target, "indexer panicked during rebuild"),
        }

        self.cache.invalidate(target);

        {
            let mut state = self.state.lock();
            state.generation = target;
            state.phase = if state.pending() {
                Phase::Requested
            } else {
                Phase::Idle
            };
            self.changed.notify_all();
        }

        self.request_rescan();
    }
}

impl RebuildTrigger for UpdateEngine {
    fn request_rebuild(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            warn!("rebuild requested after engine stopped");
            return;
        }
        if state.request() {
            debug!(target = state.requested_generation, "rebuild requested");
            self.changed.notify_all();
        }
    }
}
