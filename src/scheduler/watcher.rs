//! Scheduler lifecycle observation.
//!
//! Watchers are registered on a scheduler and notified of the four
//! lifecycle events. The hub snapshots its list under its own lock but
//! invokes callbacks with no lock held, so a watcher may call back into the
//! scheduler, including `start()` to chain a fresh run from `on_killed`.
//!
//! Event order at the end of a run is fixed: the reason event (end-time
//! reached or no executable) fires first when the run dies naturally, then
//! the kill event. An external `kill()` fires no reason event. End-of-run
//! events never overtake the started event of their run: their notifiers
//! wait on the [`LifecycleGate`] until the started delivery has finished,
//! and a kill issued from inside `on_started` hands its notification to the
//! starter.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Observer of scheduler lifecycle events.
///
/// Every method defaults to a no-op; implementors override what they care
/// about. Callbacks run on the thread driving the transition and should
/// return promptly.
pub trait SchedulerWatcher: Send + Sync {
    /// A run began.
    fn on_started(&self) {}

    /// The current run died. Fired exactly once per run, after any reason
    /// event.
    fn on_killed(&self) {}

    /// The run ended because the earliest pending work lay beyond the
    /// horizon.
    fn on_end_time_reached(&self) {}

    /// The run ended because no pending work remained.
    fn on_no_executable(&self) {}
}

// ============================================================================
// Hub
// ============================================================================

/// Registered watchers, deduped by `Arc` identity.
pub(crate) struct WatcherHub {
    watchers: Mutex<Vec<Arc<dyn SchedulerWatcher>>>,
}

impl WatcherHub {
    pub(crate) fn new() -> Self {
        Self { watchers: Mutex::new(Vec::new()) }
    }

    /// Register; false if this exact watcher is already present.
    pub(crate) fn add(&self, watcher: Arc<dyn SchedulerWatcher>) -> bool {
        let mut watchers = self.watchers.lock().expect("watcher hub poisoned");
        if watchers.iter().any(|known| Arc::ptr_eq(known, &watcher)) {
            return false;
        }
        watchers.push(watcher);
        true
    }

    /// Unregister by identity; false if it was not present.
    pub(crate) fn remove(&self, watcher: &Arc<dyn SchedulerWatcher>) -> bool {
        let mut watchers = self.watchers.lock().expect("watcher hub poisoned");
        match watchers.iter().position(|known| Arc::ptr_eq(known, watcher)) {
            Some(pos) => {
                watchers.remove(pos);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn SchedulerWatcher>> {
        self.watchers.lock().expect("watcher hub poisoned").clone()
    }

    pub(crate) fn notify_started(&self) {
        for watcher in self.snapshot() {
            watcher.on_started();
        }
    }

    pub(crate) fn notify_killed(&self) {
        for watcher in self.snapshot() {
            watcher.on_killed();
        }
    }

    pub(crate) fn notify_end_time_reached(&self) {
        for watcher in self.snapshot() {
            watcher.on_end_time_reached();
        }
    }

    pub(crate) fn notify_no_executable(&self) {
        for watcher in self.snapshot() {
            watcher.on_no_executable();
        }
    }
}

// ============================================================================
// Lifecycle gate
// ============================================================================

/// Outcome of [`LifecycleGate::await_started`].
pub(crate) enum StartedSync {
    /// The run's started notification is fully delivered; the caller
    /// delivers its own notifications now.
    Delivered,
    /// The caller sits inside this run's started delivery. The kill
    /// notification was handed to the starter, which delivers it after the
    /// remaining `on_started` callbacks.
    DeferredToStarter,
}

struct GateState {
    /// Highest run whose started notification has finished delivering.
    delivered: u64,
    /// Run currently delivering its started notification, and on which
    /// thread.
    delivering: Option<(u64, ThreadId)>,
    /// Run whose kill notification was deferred to the starter.
    deferred_kill: Option<u64>,
}

/// Sequences end-of-run notifications behind the started notification of
/// their run. No lock is held while watcher callbacks execute; the gate
/// only orders who delivers when.
pub(crate) struct LifecycleGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl LifecycleGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState { delivered: 0, delivering: None, deferred_kill: None }),
            cv: Condvar::new(),
        }
    }

    /// Mark run `run`'s started notification as in delivery on the calling
    /// thread. The guard must live across the callbacks; finishing or
    /// dropping it releases waiting kill notifiers.
    pub(crate) fn begin_started(&self, run: u64) -> StartedDelivery<'_> {
        let mut state = self.state.lock().expect("lifecycle gate poisoned");
        state.delivering = Some((run, thread::current().id()));
        // A deferral orphaned by a panicking watcher must not leak into
        // this run.
        state.deferred_kill = None;
        StartedDelivery { gate: self, run }
    }

    /// Block until run `run`'s started notification has been delivered.
    /// Called from inside that delivery, this defers the kill notification
    /// to the starter instead of deadlocking.
    pub(crate) fn await_started(&self, run: u64) -> StartedSync {
        let mut state = self.state.lock().expect("lifecycle gate poisoned");
        while state.delivered < run {
            let inside_delivery = state.delivering.is_some_and(|(delivering, deliverer)| {
                delivering == run && deliverer == thread::current().id()
            });
            if inside_delivery {
                state.deferred_kill = Some(run);
                return StartedSync::DeferredToStarter;
            }
            state = self.cv.wait(state).expect("lifecycle gate poisoned");
        }
        StartedSync::Delivered
    }

    /// Idempotent; runs on the unwind path too.
    fn complete(&self, run: u64) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.delivering.is_some_and(|(delivering, _)| delivering == run) {
            state.delivering = None;
        }
        if state.delivered < run {
            state.delivered = run;
        }
        drop(state);
        self.cv.notify_all();
    }

    fn take_deferred_kill(&self, run: u64) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.deferred_kill {
            Some(deferred) if deferred == run => {
                state.deferred_kill = None;
                true
            }
            _ => false,
        }
    }
}

/// In-progress started delivery; see [`LifecycleGate::begin_started`].
pub(crate) struct StartedDelivery<'a> {
    gate: &'a LifecycleGate,
    run: u64,
}

impl StartedDelivery<'_> {
    /// Complete the delivery. True when a watcher killed the run from
    /// `on_started`; the kill notification is then the caller's to deliver.
    pub(crate) fn finish(self) -> bool {
        // Drop marks the delivery complete.
        self.gate.take_deferred_kill(self.run)
    }
}

impl Drop for StartedDelivery<'_> {
    fn drop(&mut self) {
        self.gate.complete(self.run);
    }
}

// ============================================================================
// Blocking watcher
// ============================================================================

struct KillCount {
    /// Kills seen by `on_killed`.
    kills: u64,
    /// Kills already consumed by a wait call.
    observed: u64,
}

/// Watcher that lets a controlling thread block until the scheduler dies.
///
/// A kill that happened since the last wait is consumed immediately, so the
/// controller cannot miss a fast simulation that finished before it got
/// around to waiting. Intended for a single controlling thread.
pub struct BlockingWatcher {
    state: Mutex<KillCount>,
    cv: Condvar,
}

impl BlockingWatcher {
    pub fn new() -> Self {
        Self { state: Mutex::new(KillCount { kills: 0, observed: 0 }), cv: Condvar::new() }
    }

    /// Block until the next unobserved kill.
    ///
    /// Returns immediately if a kill has happened since the last wait;
    /// otherwise blocks until `on_killed` fires.
    pub fn wait_until_killed(&self) {
        let mut state = self.state.lock().expect("blocking watcher poisoned");
        if state.kills > state.observed {
            state.observed = state.kills;
            return;
        }
        let target = state.kills + 1;
        while state.kills < target {
            state = self.cv.wait(state).expect("blocking watcher poisoned");
        }
        state.observed = state.kills;
    }

    /// Bounded [`wait_until_killed`](Self::wait_until_killed). Returns false
    /// on timeout, leaving the observation state untouched.
    pub fn wait_until_killed_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("blocking watcher poisoned");
        if state.kills > state.observed {
            state.observed = state.kills;
            return true;
        }
        let target = state.kills + 1;
        while state.kills < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("blocking watcher poisoned");
            state = guard;
        }
        state.observed = state.kills;
        true
    }

    /// Total kills seen so far.
    pub fn kills(&self) -> u64 {
        self.state.lock().expect("blocking watcher poisoned").kills
    }
}

impl Default for BlockingWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerWatcher for BlockingWatcher {
    fn on_killed(&self) {
        let mut state = self.state.lock().expect("blocking watcher poisoned");
        state.kills += 1;
        self.cv.notify_all();
    }
}
