//! Running state of a transport instance.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunningState {
    /// Not running (initial state).
    #[default]
    Stopped,
    /// A sampling thread has been launched but has not finished setup.
    Starting,
    /// The sampling loop is emitting records.
    Started,
    /// Shutdown is in progress.
    Stopping,
    /// The last run ended on an unrecovered fault.
    Error,
}

impl RunningState {
    /// States in which `start()` must not launch another loop.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunningState::Starting | RunningState::Started | RunningState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunningState::Stopped => "STOPPED",
            RunningState::Starting => "STARTING",
            RunningState::Started => "STARTED",
            RunningState::Stopping => "STOPPING",
            RunningState::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: RunningState,
    /// Incremented on every accepted `start()`. A loop only acts while the
    /// generation it was launched with is still current.
    generation: u64,
}

/// Mutex-guarded running state shared between the controller and its loop.
///
/// Every mutation notifies the condition variable so a sleeping loop (or a
/// caller in [`StateCell::wait_until`]) observes the change immediately.
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RunningState::Stopped,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    // The guarded data is a plain enum and counter, always valid even if a
    // holder panicked.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self) -> RunningState {
        self.lock().state
    }

    /// Move to `Starting` and open a new generation, unless a run is active.
    pub(crate) fn begin_start(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state.is_active() {
            return None;
        }
        inner.state = RunningState::Starting;
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);
        self.changed.notify_all();
        Some(generation)
    }

    /// `Starting` -> `Started` for the given generation.
    ///
    /// Returns false if the run was stopped or superseded during setup.
    pub(crate) fn mark_started(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != RunningState::Starting {
            return false;
        }
        inner.state = RunningState::Started;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Unconditional transition.
    #[cfg(test)]
    pub(crate) fn set(&self, state: RunningState) {
        self.lock().state = state;
        self.changed.notify_all();
    }

    /// Move to `Stopped`. Returns the previous state if it was not already
    /// `Stopped`.
    pub(crate) fn stop(&self) -> Option<RunningState> {
        self.stop_if(|_| true)
    }

    /// [`stop`](Self::stop) on behalf of a run, unless a newer run has started.
    pub(crate) fn stop_run(&self, generation: u64) -> Option<RunningState> {
        self.stop_if(|inner| inner.generation == generation)
    }

    fn stop_if(&self, guard: impl FnOnce(&Inner) -> bool) -> Option<RunningState> {
        let mut inner = self.lock();
        if !guard(&inner) {
            return None;
        }
        let previous = std::mem::replace(&mut inner.state, RunningState::Stopped);
        drop(inner);
        self.changed.notify_all();
        (previous != RunningState::Stopped).then_some(previous)
    }

    /// Enter `Error` on behalf of a run, unless a newer run has started.
    ///
    /// Returns true if the state was changed.
    pub(crate) fn fail(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = RunningState::Error;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// True while the given run should keep ticking.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state == RunningState::Started
    }

    /// Sleep for `duration` or until the run stops being current.
    ///
    /// Returns whether the run is still current afterwards.
    pub(crate) fn sleep(&self, generation: u64, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, duration, |inner| {
                inner.generation == generation && inner.state == RunningState::Started
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.generation == generation && guard.state == RunningState::Started
    }

    /// Block until `predicate` holds or `timeout` elapses; returns the last
    /// observed state.
    pub(crate) fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> RunningState
    where
        F: FnMut(RunningState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if predicate(guard.state) {
                return guard.state;
            }
            let now = Instant::now();
            if now >= deadline {
                return guard.state;
            }
            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
