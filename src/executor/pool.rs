//! Bounded-Concurrency Cooperative Executor
//!
//! # Architecture
//!
//! ```text
//!  submit ──▶ FIFO queue ──grant──▶ active (≤ slots) ──complete──▶ done
//!                 ▲                   │  ▲
//!                 │              park │  │ grant (resumers first)
//!                 │                   ▼  │
//!                 └──────────────── parked ──wake/force──▶ resuming
//! ```
//!
//! The executor bounds the number of concurrently *active* executions, not
//! the number of live activities: an activity that parks gives its slot back
//! to the pool (queued work may start in its place) and reacquires one on
//! resume. Activities run on dedicated threads spawned at slot-grant time, so
//! queued work consumes no thread and the live thread count is
//! `active + parked`.
//!
//! # Correctness Invariants
//!
//! - **Slot bound**: `active` (running + granted-but-not-yet-resumed) never
//!   exceeds the slot count, including during forced-wake wrap-up.
//! - **Edge-triggered wake**: `wake()` only affects an activity that is
//!   parked at that instant; a wake delivered before the matching `park()` is
//!   a no-op with no memory. The linearization point is the pool lock.
//! - **One-sweep forced wake**: the instant quiescence is reached with parked
//!   activities, every one of them is woken exactly once with
//!   [`ParkError::ForcedWake`], inside the same critical section that
//!   detected quiescence; no observer ever sees a quiescent pool that still
//!   has parked activities.
//! - **Latched termination**: once shutdown has been requested and quiescence
//!   observed, `is_terminated()` stays true while force-woken activities wrap
//!   up; a wrap-up that parks again gets [`ParkError::Terminated`] without
//!   parking.
//! - **Panic isolation**: a panic escaping `execute()` is caught at the
//!   activity boundary, counted and logged; siblings and the pool are
//!   unaffected.
//!
//! # Shutdown Signals
//!
//! | Signal | Meaning |
//! |--------|---------|
//! | `ParkError::ForcedWake` | "you were parked; wake up and wrap up" |
//! | `ParkError::Terminated` | "you never got to park; the executor is dead" |
//!
//! # Design Notes
//!
//! One mutex owns the queue, the counters and the parked list; submit, park,
//! wake, completion and shutdown all settle the state inside that critical
//! section: grant freed slots (resumers before queued work), then evaluate
//! quiescence, then latch termination, then force-wake. Thread spawns happen
//! after the lock drops. Blocking waits use condvars on the same mutex; the
//! only wait outside it is the parked activity's own latch.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::latch::{WakeCause, WakeLatch};
use crate::work::Executable;

// ============================================================================
// Signals
// ============================================================================

/// Why `park()` returned without a cooperative wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkError {
    /// The pool reached quiescence while this activity was parked. The
    /// activity holds a slot again and should wrap up; nobody was left to
    /// wake it cooperatively.
    ForcedWake,
    /// `park()` was called on an executor that had already terminated. The
    /// activity never parked and still holds its slot.
    Terminated,
}

impl fmt::Display for ParkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParkError::ForcedWake => write!(f, "activity was force-woken at quiescence"),
            ParkError::Terminated => write!(f, "executor already terminated; park refused"),
        }
    }
}

impl std::error::Error for ParkError {}

// ============================================================================
// Activity identity
// ============================================================================

/// Per-activity coordination state shared between the activity thread, its
/// handles, and the pool.
#[derive(Debug)]
struct ActivityShared {
    /// Stable id, used for thread naming and log correlation.
    id: u64,
    /// The park/wake latch, re-armed on every park.
    latch: WakeLatch,
}

/// Wake handle targeting one specific activity.
///
/// Cloneable and callable from any thread, including another activity or the
/// thread driving shutdown.
#[derive(Clone)]
pub struct ActivityHandle {
    core: Arc<Core>,
    act: Arc<ActivityShared>,
}

impl ActivityHandle {
    /// Wake the target activity if it is parked right now.
    ///
    /// Returns true iff a parked activity was woken. The primitive is
    /// edge-triggered: waking an activity that is queued, running, resuming
    /// or finished has no effect, and a later `park()` will not see this
    /// call.
    pub fn wake(&self) -> bool {
        Core::wake(&self.core, &self.act)
    }
}

impl fmt::Debug for ActivityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityHandle").field("activity", &self.act.id).finish()
    }
}

/// Execution context handed to [`Executable::execute`].
///
/// Lives only for the duration of one activity; suspension is valid only from
/// the activity's own thread, which holds by construction since the context
/// never leaves `execute()`.
pub struct ActivityContext {
    core: Arc<Core>,
    act: Arc<ActivityShared>,
}

impl ActivityContext {
    /// Release this activity's slot and block until a later wake.
    ///
    /// Returns `Ok(())` on a cooperative [`ActivityHandle::wake`]. Returns
    /// `Err(ParkError::ForcedWake)` if the pool reached quiescence while this
    /// activity was parked, and `Err(ParkError::Terminated)` if the executor
    /// had already terminated when `park()` was called (in that case the
    /// activity never parked).
    ///
    /// In every return case the activity holds an active slot again.
    pub fn park(&self) -> Result<(), ParkError> {
        Core::park(&self.core, &self.act)
    }

    /// A wake handle for this activity, shareable with collaborators.
    pub fn handle(&self) -> ActivityHandle {
        ActivityHandle { core: Arc::clone(&self.core), act: Arc::clone(&self.act) }
    }

    /// Stable id of this activity (log correlation).
    #[inline]
    pub fn activity_id(&self) -> u64 {
        self.act.id
    }
}

impl fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityContext").field("activity", &self.act.id).finish()
    }
}

// ============================================================================
// Pool state
// ============================================================================

/// Work admitted but not yet granted a slot.
struct QueuedWork {
    act: Arc<ActivityShared>,
    work: Arc<dyn Executable>,
}

/// Mutable state behind the pool mutex.
struct PoolState {
    /// FIFO admission queue; entries hold no thread.
    queue: VecDeque<QueuedWork>,
    /// Activities currently parked. Membership in this list *is* the parked
    /// state; wake and force-wake transition an activity out exactly once.
    parked: Vec<Arc<ActivityShared>>,
    /// Slot holders: running activities plus grants not yet consumed.
    active: usize,
    /// Woken activities that have not yet consumed a slot grant.
    resuming: usize,
    /// Slot grants issued to resumers and not yet consumed (`<= resuming`).
    grants: usize,
    /// False once shutdown has been requested; gates admission only.
    accepting: bool,
    /// Latched at the first shutdown+quiescence observation.
    terminated: bool,
}

impl PoolState {
    /// No running and no queued work; parked activities excluded.
    #[inline]
    fn quiescent(&self) -> bool {
        self.active == 0 && self.resuming == 0 && self.queue.is_empty()
    }
}

/// Cumulative counters, updated with relaxed atomics (observability only).
#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    parks: AtomicU64,
    wakes: AtomicU64,
    forced_wakes: AtomicU64,
    park_rejections: AtomicU64,
}

/// Point-in-time executor statistics.
///
/// Cumulative counters may lag live gauges by a moment; use the gauges for
/// coordination in tests, the counters for run-level accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Work items admitted.
    pub submitted: u64,
    /// Work items refused because shutdown had begun.
    pub rejected: u64,
    /// Activities that finished executing (including panicked ones).
    pub completed: u64,
    /// Activities whose `execute()` panicked.
    pub panicked: u64,
    /// `park()` calls that actually parked.
    pub parks: u64,
    /// Cooperative wakes delivered to parked activities.
    pub wakes: u64,
    /// Forced wakes delivered at quiescence.
    pub forced_wakes: u64,
    /// `park()` calls refused with [`ParkError::Terminated`].
    pub park_rejections: u64,
    /// Gauge: admitted work not yet granted a slot.
    pub queued: usize,
    /// Gauge: slot holders right now.
    pub active: usize,
    /// Gauge: parked activities right now.
    pub parked: usize,
    /// Gauge: woken activities waiting for a slot.
    pub resuming: usize,
}

struct Core {
    slots: usize,
    state: Mutex<PoolState>,
    /// Signalled when slot grants are issued to resumers.
    grant_cv: Condvar,
    /// Signalled on quiescence and termination transitions.
    idle_cv: Condvar,
    counters: Counters,
    next_activity: AtomicU64,
}

// ============================================================================
// Executor
// ============================================================================

/// Bounded-concurrency executor with cooperative suspension.
///
/// See the module docs for the full contract. Construction is cheap; threads
/// are spawned per activity when a slot is granted.
pub struct Executor {
    core: Arc<Core>,
}

impl Executor {
    /// Create an executor with `slots` concurrently active executions.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is 0.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "executor slots must be > 0");
        Self {
            core: Arc::new(Core {
                slots,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    parked: Vec::new(),
                    active: 0,
                    resuming: 0,
                    grants: 0,
                    accepting: true,
                    terminated: false,
                }),
                grant_cv: Condvar::new(),
                idle_cv: Condvar::new(),
                counters: Counters::default(),
                next_activity: AtomicU64::new(0),
            }),
        }
    }

    /// Active-slot capacity.
    #[inline]
    pub fn slots(&self) -> usize {
        self.core.slots
    }

    /// Admit a unit of work.
    ///
    /// Starts immediately if a slot is free and nothing is queued ahead of
    /// it; otherwise waits its turn in FIFO order. Returns the work item back
    /// as `Err` once shutdown has begun.
    pub fn submit(&self, work: Arc<dyn Executable>) -> Result<ActivityHandle, Arc<dyn Executable>> {
        let act = Arc::new(ActivityShared {
            id: self.core.next_activity.fetch_add(1, Ordering::Relaxed),
            latch: WakeLatch::new(),
        });

        let to_start = {
            let mut state = self.core.lock_state();
            if !state.accepting {
                self.core.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(work);
            }
            self.core.counters.submitted.fetch_add(1, Ordering::Relaxed);
            state.queue.push_back(QueuedWork { act: Arc::clone(&act), work });
            self.core.settle(&mut state)
        };
        Core::launch(&self.core, to_start);

        Ok(ActivityHandle { core: Arc::clone(&self.core), act })
    }

    /// Stop accepting new work. Non-blocking.
    ///
    /// Queued and running work still completes; once quiescence is reached,
    /// still-parked activities are force-woken exactly once and the executor
    /// terminates.
    pub fn shutdown(&self) {
        let to_start = {
            let mut state = self.core.lock_state();
            if state.accepting {
                state.accepting = false;
                debug!("executor shutdown requested");
            }
            self.core.settle(&mut state)
        };
        Core::launch(&self.core, to_start);
    }

    /// Shutdown and return the work items that never started.
    ///
    /// Running work is not interrupted; the forced-wake sweep still happens
    /// only once quiescence is actually reached.
    pub fn shutdown_now(&self) -> Vec<Arc<dyn Executable>> {
        let (drained, to_start) = {
            let mut state = self.core.lock_state();
            if state.accepting {
                state.accepting = false;
            }
            let drained: Vec<Arc<dyn Executable>> =
                state.queue.drain(..).map(|queued| queued.work).collect();
            if !drained.is_empty() {
                debug!(discarded = drained.len(), "shutdown_now discarded queued work");
            }
            let to_start = self.core.settle(&mut state);
            (drained, to_start)
        };
        Core::launch(&self.core, to_start);
        drained
    }

    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        !self.core.lock_state().accepting
    }

    /// True iff no running and no queued work (parked activities excluded).
    pub fn is_quiescent(&self) -> bool {
        self.core.lock_state().quiescent()
    }

    /// Block until quiescence. Always returns true.
    pub fn await_quiescence(&self) -> bool {
        let mut state = self.core.lock_state();
        while !state.quiescent() {
            state = self.core.idle_cv.wait(state).expect("executor state poisoned");
        }
        true
    }

    /// True iff shutdown was requested and quiescence was observed.
    ///
    /// Latched: stays true while force-woken activities wrap up.
    pub fn is_terminated(&self) -> bool {
        self.core.lock_state().terminated
    }

    /// Bounded wait for termination. Returns false on timeout.
    #[must_use]
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.lock_state();
        while !state.terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .core
                .idle_cv
                .wait_timeout(state, deadline - now)
                .expect("executor state poisoned");
            state = guard;
        }
        true
    }

    /// Snapshot of counters and gauges.
    pub fn stats(&self) -> ExecutorStats {
        let state = self.core.lock_state();
        let c = &self.core.counters;
        ExecutorStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            parks: c.parks.load(Ordering::Relaxed),
            wakes: c.wakes.load(Ordering::Relaxed),
            forced_wakes: c.forced_wakes.load(Ordering::Relaxed),
            park_rejections: c.park_rejections.load(Ordering::Relaxed),
            queued: state.queue.len(),
            active: state.active,
            parked: state.parked.len(),
            resuming: state.resuming,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").field("slots", &self.core.slots).finish_non_exhaustive()
    }
}

// ============================================================================
// Core state machine
// ============================================================================

impl Core {
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("executor state poisoned")
    }

    /// Settle the pool after a state transition.
    ///
    /// Order matters: grant freed slots first (resumers before queued work),
    /// then evaluate quiescence, then latch termination, then force-wake.
    /// Because the sweep runs inside the same critical section that detected
    /// quiescence, `is_quiescent()` never observes a quiescent pool that
    /// still has parked activities.
    ///
    /// Returns work to launch once the lock is dropped.
    fn settle(&self, state: &mut PoolState) -> Vec<QueuedWork> {
        let mut to_start = Vec::new();
        self.pump(state, &mut to_start);

        if state.quiescent() {
            if !state.accepting && !state.terminated {
                state.terminated = true;
                debug!("executor terminated");
            }
            if !state.parked.is_empty() {
                let swept = state.parked.len();
                for act in state.parked.drain(..) {
                    act.latch.fire(WakeCause::Forced);
                }
                state.resuming += swept;
                self.counters.forced_wakes.fetch_add(swept as u64, Ordering::Relaxed);
                debug!(count = swept, "force-woke parked activities at quiescence");
                // Wrap-ups reacquire slots like any other resumer.
                self.pump(state, &mut to_start);
            }
            self.idle_cv.notify_all();
        }
        to_start
    }

    /// Hand freed slots out: woken activities first, then queued work.
    fn pump(&self, state: &mut PoolState, to_start: &mut Vec<QueuedWork>) {
        let grants_before = state.grants;
        while state.active < self.slots && state.grants < state.resuming {
            state.grants += 1;
            state.active += 1;
        }
        if state.grants > grants_before {
            self.grant_cv.notify_all();
        }
        while state.active < self.slots {
            match state.queue.pop_front() {
                Some(queued) => {
                    state.active += 1;
                    to_start.push(queued);
                }
                None => break,
            }
        }
    }

    /// Spawn one thread per granted work item. Called with the lock dropped.
    fn launch(core: &Arc<Core>, to_start: Vec<QueuedWork>) {
        for queued in to_start {
            let core = Arc::clone(core);
            thread::Builder::new()
                .name(format!("simsched-activity-{}", queued.act.id))
                .spawn(move || core.activity_main(queued.act, queued.work))
                .expect("failed to spawn activity thread");
        }
    }

    fn activity_main(self: Arc<Self>, act: Arc<ActivityShared>, work: Arc<dyn Executable>) {
        let ctx = ActivityContext { core: Arc::clone(&self), act };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work.execute(&ctx)));
        // Discard the work item before completion bookkeeping so any RAII
        // state riding inside it (step-barrier clones, in-flight guards) is
        // released no later than the slot.
        drop(work);
        if let Err(payload) = outcome {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                activity = ctx.act.id,
                panic = panic_message(payload.as_ref()),
                "executable panicked; activity isolated"
            );
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);

        let to_start = {
            let mut state = self.lock_state();
            debug_assert!(state.active > 0, "completion without an active slot");
            state.active -= 1;
            self.settle(&mut state)
        };
        Core::launch(&self, to_start);
    }

    fn park(core: &Arc<Core>, act: &Arc<ActivityShared>) -> Result<(), ParkError> {
        let to_start = {
            let mut state = core.lock_state();
            if state.terminated {
                core.counters.park_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(ParkError::Terminated);
            }
            act.latch.arm();
            state.parked.push(Arc::clone(act));
            debug_assert!(state.active > 0, "park without an active slot");
            state.active -= 1;
            core.counters.parks.fetch_add(1, Ordering::Relaxed);
            core.settle(&mut state)
        };
        // The freed slot may start queued work while we are parked.
        Core::launch(core, to_start);

        let cause = act.latch.wait();

        // Reacquire a slot. The waker already moved us out of the parked
        // list and into `resuming`; grants are anonymous, any woken activity
        // may consume any grant.
        let mut state = core.lock_state();
        while state.grants == 0 {
            state = core.grant_cv.wait(state).expect("executor state poisoned");
        }
        state.grants -= 1;
        state.resuming -= 1;
        drop(state);

        match cause {
            WakeCause::Woken => Ok(()),
            WakeCause::Forced => Err(ParkError::ForcedWake),
        }
    }

    fn wake(core: &Arc<Core>, act: &Arc<ActivityShared>) -> bool {
        let to_start = {
            let mut state = core.lock_state();
            let Some(pos) = state.parked.iter().position(|parked| Arc::ptr_eq(parked, act))
            else {
                return false;
            };
            state.parked.swap_remove(pos);
            state.resuming += 1;
            act.latch.fire(WakeCause::Woken);
            core.counters.wakes.fetch_add(1, Ordering::Relaxed);
            core.settle(&mut state)
        };
        Core::launch(core, to_start);
        true
    }
}

/// Best-effort extraction of a panic payload's message for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    /// Poll `cond` until it holds or `ms` elapses; returns the final value.
    fn wait_until(ms: u64, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    #[should_panic(expected = "slots must be > 0")]
    fn zero_slots_is_a_usage_error() {
        let _ = Executor::new(0);
    }

    #[test]
    fn runs_all_submitted_work() {
        let ex = Executor::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let c = Arc::clone(&counter);
            ex.submit(Arc::new(move |_: &ActivityContext| {
                c.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }

        assert!(ex.await_quiescence());
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        let stats = ex.stats();
        assert_eq!(stats.submitted, 100);
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.panicked, 0);
    }

    #[test]
    fn new_executor_is_quiescent_and_not_terminated() {
        let ex = Executor::new(2);
        assert!(ex.is_quiescent());
        assert!(!ex.is_shutdown());
        assert!(!ex.is_terminated());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let ex = Executor::new(2);
        ex.shutdown();
        let res = ex.submit(Arc::new(|_: &ActivityContext| {}));
        assert!(res.is_err());
        assert_eq!(ex.stats().rejected, 1);
        // An idle executor terminates as soon as shutdown is requested.
        assert!(ex.is_terminated());
    }

    #[test]
    fn queued_work_completes_after_shutdown() {
        let ex = Executor::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let c = Arc::clone(&counter);
            ex.submit(Arc::new(move |_: &ActivityContext| {
                thread::sleep(Duration::from_millis(40));
                c.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }
        ex.shutdown();

        assert!(ex.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn shutdown_now_returns_never_started_work() {
        let ex = Arc::new(Executor::new(1));
        let gate = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            while !g.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap();
        for _ in 0..3 {
            ex.submit(Arc::new(|_: &ActivityContext| {})).unwrap();
        }

        let exs = Arc::clone(&ex);
        assert!(wait_until(2_000, move || {
            let s = exs.stats();
            s.active == 1 && s.queued == 3
        }));

        let drained = ex.shutdown_now();
        assert_eq!(drained.len(), 3);
        gate.store(true, Ordering::Relaxed);

        assert!(ex.await_termination(Duration::from_secs(5)));
        assert_eq!(ex.stats().completed, 1);
    }

    #[test]
    fn park_resumes_after_cooperative_wake() {
        let ex = Arc::new(Executor::new(2));
        let parked_result: Arc<StdMutex<Option<Result<(), ParkError>>>> =
            Arc::new(StdMutex::new(None));
        let wake_hit = Arc::new(AtomicBool::new(false));

        let pr = Arc::clone(&parked_result);
        let handle = ex
            .submit(Arc::new(move |ctx: &ActivityContext| {
                let r = ctx.park();
                *pr.lock().unwrap() = Some(r);
            }))
            .unwrap();

        let exs = Arc::clone(&ex);
        let wh = Arc::clone(&wake_hit);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            // Only wake once the suspension is established.
            while exs.stats().parked == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            wh.store(handle.wake(), Ordering::Relaxed);
        }))
        .unwrap();

        assert!(ex.await_quiescence());
        assert_eq!(*parked_result.lock().unwrap(), Some(Ok(())));
        assert!(wake_hit.load(Ordering::Relaxed));
        let stats = ex.stats();
        assert_eq!(stats.wakes, 1);
        assert_eq!(stats.forced_wakes, 0);
    }

    #[test]
    fn wake_before_park_has_no_effect() {
        let ex = Arc::new(Executor::new(1));
        let running = Arc::new(AtomicBool::new(false));
        let wake_sent = Arc::new(AtomicBool::new(false));
        let parked_result: Arc<StdMutex<Option<Result<(), ParkError>>>> =
            Arc::new(StdMutex::new(None));

        let (r, ws, pr) =
            (Arc::clone(&running), Arc::clone(&wake_sent), Arc::clone(&parked_result));
        let handle = ex
            .submit(Arc::new(move |ctx: &ActivityContext| {
                r.store(true, Ordering::Relaxed);
                while !ws.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                }
                // The wake above happened strictly before this park; it must
                // not satisfy it. With nothing else in the pool the park can
                // only end in a forced wake.
                *pr.lock().unwrap() = Some(ctx.park());
            }))
            .unwrap();

        assert!(wait_until(2_000, || running.load(Ordering::Relaxed)));
        assert!(!handle.wake(), "wake on a running activity must be a no-op");
        wake_sent.store(true, Ordering::Relaxed);

        assert!(ex.await_quiescence());
        assert_eq!(*parked_result.lock().unwrap(), Some(Err(ParkError::ForcedWake)));
        let stats = ex.stats();
        assert_eq!(stats.wakes, 0);
        assert_eq!(stats.forced_wakes, 1);
    }

    #[test]
    fn parked_at_quiescence_gets_exactly_one_forced_wake() {
        let ex = Arc::new(Executor::new(2));
        let parked_result: Arc<StdMutex<Option<Result<(), ParkError>>>> =
            Arc::new(StdMutex::new(None));

        let pr = Arc::clone(&parked_result);
        ex.submit(Arc::new(move |ctx: &ActivityContext| {
            *pr.lock().unwrap() = Some(ctx.park());
        }))
        .unwrap();

        assert!(ex.await_quiescence());
        assert_eq!(*parked_result.lock().unwrap(), Some(Err(ParkError::ForcedWake)));
        let stats = ex.stats();
        assert_eq!(stats.parks, 1);
        assert_eq!(stats.forced_wakes, 1);
    }

    #[test]
    fn park_after_termination_is_rejected() {
        let ex = Arc::new(Executor::new(2));
        let results: Arc<StdMutex<Vec<Result<(), ParkError>>>> = Arc::new(StdMutex::new(Vec::new()));
        // Keeps the pool non-quiescent so the park below stays parked until
        // shutdown actually drains the pool.
        let gate = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            while !g.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap();

        let rs = Arc::clone(&results);
        ex.submit(Arc::new(move |ctx: &ActivityContext| {
            let first = ctx.park();
            rs.lock().unwrap().push(first);
            // Wrap-up: the executor is terminated by now, so a second park
            // must be refused without parking.
            let second = ctx.park();
            rs.lock().unwrap().push(second);
        }))
        .unwrap();

        let exs = Arc::clone(&ex);
        assert!(wait_until(2_000, move || exs.stats().parked == 1));
        ex.shutdown_now();
        gate.store(true, Ordering::Relaxed);

        assert!(ex.await_termination(Duration::from_secs(5)));
        let exs = Arc::clone(&ex);
        assert!(wait_until(2_000, move || exs.stats().completed == 2));

        let results = results.lock().unwrap();
        assert_eq!(results.as_slice(), &[Err(ParkError::ForcedWake), Err(ParkError::Terminated)]);
        assert_eq!(ex.stats().park_rejections, 1);
    }

    #[test]
    fn suspended_activity_releases_its_slot() {
        // Single slot: A parks, B (queued behind it) must get the slot, wake
        // A, and the whole scenario must take about B's duration.
        let ex = Arc::new(Executor::new(1));
        let a_result: Arc<StdMutex<Option<Result<(), ParkError>>>> = Arc::new(StdMutex::new(None));
        let b_ran = Arc::new(AtomicBool::new(false));

        let start = Instant::now();

        let ar = Arc::clone(&a_result);
        let handle_a = ex
            .submit(Arc::new(move |ctx: &ActivityContext| {
                *ar.lock().unwrap() = Some(ctx.park());
            }))
            .unwrap();

        let br = Arc::clone(&b_ran);
        let exs = Arc::clone(&ex);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            while exs.stats().parked == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(150));
            br.store(true, Ordering::Relaxed);
            handle_a.wake();
        }))
        .unwrap();

        ex.shutdown();
        assert!(ex.await_termination(Duration::from_secs(5)), "scenario deadlocked");
        let elapsed = start.elapsed();

        assert_eq!(*a_result.lock().unwrap(), Some(Ok(())));
        assert!(b_ran.load(Ordering::Relaxed));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(1_000), "slot was not released on park: {elapsed:?}");
    }

    #[test]
    fn panic_does_not_stop_the_pool() {
        let ex = Executor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        ex.submit(Arc::new(|_: &ActivityContext| panic!("boom"))).unwrap();
        for _ in 0..2 {
            let c = Arc::clone(&counter);
            ex.submit(Arc::new(move |_: &ActivityContext| {
                c.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }

        assert!(ex.await_quiescence());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        let stats = ex.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.panicked, 1);

        // Pool is still usable.
        let c = Arc::clone(&counter);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            c.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
        assert!(ex.await_quiescence());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn await_termination_times_out_while_running() {
        let ex = Executor::new(1);
        ex.submit(Arc::new(|_: &ActivityContext| {
            thread::sleep(Duration::from_millis(250));
        }))
        .unwrap();
        ex.shutdown();

        assert!(!ex.await_termination(Duration::from_millis(20)));
        assert!(ex.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn wake_on_finished_or_queued_activity_is_noop() {
        let ex = Arc::new(Executor::new(1));

        // Finished.
        let handle = ex.submit(Arc::new(|_: &ActivityContext| {})).unwrap();
        assert!(ex.await_quiescence());
        assert!(!handle.wake());

        // Queued behind a blocker.
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        ex.submit(Arc::new(move |_: &ActivityContext| {
            while !g.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap();
        let queued_handle = ex.submit(Arc::new(|_: &ActivityContext| {})).unwrap();

        let exs = Arc::clone(&ex);
        assert!(wait_until(2_000, move || exs.stats().queued == 1));
        assert!(!queued_handle.wake());

        gate.store(true, Ordering::Relaxed);
        assert!(ex.await_quiescence());
        assert_eq!(ex.stats().wakes, 0);
    }

    /// Stress: concurrent submitters against a small pool lose nothing.
    #[test]
    fn concurrent_submitters_lose_nothing() {
        let ex = Arc::new(Executor::new(4));
        let counter = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let ex = Arc::clone(&ex);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let c = Arc::clone(&counter);
                        ex.submit(Arc::new(move |_: &ActivityContext| {
                            c.fetch_add(1, Ordering::Relaxed);
                        }))
                        .unwrap();
                    }
                })
            })
            .collect();
        for s in submitters {
            s.join().unwrap();
        }

        assert!(ex.await_quiescence());
        assert_eq!(counter.load(Ordering::Relaxed), 400);
        assert_eq!(ex.stats().completed, 400);
    }
}
