//! Real-time engine: wall-clock timers with a watchdog.
//!
//! # Purpose
//!
//! Simulation time is wall-clock milliseconds. Scheduling arms a timer; a
//! dedicated timer thread fires due timers as executor submissions and
//! doubles as the watchdog that ends the run when the horizon passes. There
//! is no step barrier: activations of one instant run concurrently up to
//! the slot budget, and only the shared per-request monitor keeps
//! activations of one repeating schedule from overlapping when one overruns
//! its step.
//!
//! # Timer thread
//!
//! ```text
//! loop:
//!   now beyond horizon            → end run (end time reached)
//!   due timers                    → submit them, loop
//!   nothing armed, nothing flying → end run (no executable)
//!   otherwise                     → sleep min(next timer, horizon, watchdog)
//! ```
//!
//! The no-work check runs from the first iteration, so starting an empty
//! real-time scheduler dies immediately with no-executable, like the
//! discrete engine. In-flight work is tracked by an RAII guard riding in
//! each submission; re-entrant scheduling therefore cannot race the
//! no-work check, because the scheduling activation's own guard is still
//! held while it runs.
//!
//! # Correctness Invariants
//!
//! - The clock is frozen by kill and resumes from the frozen value on
//!   restart; it never decreases.
//! - Timers armed at the same millisecond fire in schedule order.
//! - Lifecycle events fire exactly once per run, in order: started, reason
//!   (if any), then killed. An external kill fires no reason event and its
//!   notification never overtakes the started delivery.
//! - Stale timer threads and stale in-flight guards (from a killed and
//!   restarted run) never touch the new run's accounting: both check the
//!   run epoch.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::pending::{activation_times, Activation};
use super::watcher::{LifecycleGate, SchedulerWatcher, StartedSync, WatcherHub};
use super::{
    check_specific_time, validate_horizon, validate_mode, EndReason, Phase, ScheduleMode,
    Scheduler, TimeMode,
};
use crate::executor::{ActivityContext, Executor, ExecutorStats};
use crate::work::Executable;

/// Watchdog wakeup period when nothing sooner is due.
const DEFAULT_WATCHDOG: Duration = Duration::from_millis(100);

// ============================================================================
// Timers
// ============================================================================

/// An armed timer. Ordered by deadline, then by arm order, so same-instant
/// timers fire in schedule order.
struct ArmedTimer {
    fire_at: u64,
    seq: u64,
    activation: Activation,
}

impl PartialEq for ArmedTimer {
    fn eq(&self, other: &Self) -> bool {
        (self.fire_at, self.seq) == (other.fire_at, other.seq)
    }
}

impl Eq for ArmedTimer {}

impl PartialOrd for ArmedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArmedTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for earliest-deadline-first.
        (other.fire_at, other.seq).cmp(&(self.fire_at, self.seq))
    }
}

/// Decrements the run's in-flight count when a fired submission is done,
/// whether it completed, panicked, or was discarded by a kill.
struct InFlightGuard {
    inner: Arc<RealTimeInner>,
    epoch: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.epoch == self.epoch {
            debug_assert!(
                state.in_flight > 0 || state.phase != Phase::Running,
                "in-flight underflow"
            );
            state.in_flight = state.in_flight.saturating_sub(1);
            self.inner.timer_cv.notify_all();
        }
    }
}

/// One fired timer traveling through the executor.
struct TimerDispatch {
    activation: Activation,
    _inflight: InFlightGuard,
}

impl Executable for TimerDispatch {
    fn execute(&self, ctx: &ActivityContext) {
        self.activation.run(ctx);
    }
}

// ============================================================================
// Engine
// ============================================================================

struct RealTimeState {
    phase: Phase,
    /// Bumped on every start; stale timer threads and guards check it.
    epoch: u64,
    timers: BinaryHeap<ArmedTimer>,
    next_seq: u64,
    /// Fired submissions not yet finished.
    in_flight: usize,
    /// Clock base in ms. While running, `current = base + anchor.elapsed()`;
    /// frozen at `base` otherwise.
    base: u64,
    anchor: Option<Instant>,
    executor: Option<Arc<Executor>>,
}

struct RealTimeInner {
    end_time: u64,
    slots: usize,
    watchdog: Duration,
    state: Mutex<RealTimeState>,
    /// Wakes the timer thread: new timer armed, in-flight work finished,
    /// run killed.
    timer_cv: Condvar,
    watchers: WatcherHub,
    /// Holds end-of-run notifications behind the started delivery.
    lifecycle: LifecycleGate,
}

/// Wall-clock scheduler.
///
/// Cheap to clone; clones share the engine.
#[derive(Clone)]
pub struct RealTimeScheduler {
    inner: Arc<RealTimeInner>,
}

impl RealTimeScheduler {
    /// Create a real-time scheduler with a horizon of `end_time`
    /// milliseconds and `slots` concurrent executions.
    ///
    /// # Panics
    ///
    /// Panics if `end_time` or `slots` is 0.
    pub fn new(end_time: u64, slots: usize) -> Self {
        Self::with_watchdog_period(end_time, slots, DEFAULT_WATCHDOG)
    }

    /// [`new`](Self::new) with an explicit watchdog period, the upper bound
    /// on how long the timer thread sleeps between horizon checks. Shorter
    /// periods tighten end-of-run latency in exchange for more wakeups.
    ///
    /// # Panics
    ///
    /// Panics if `end_time` or `slots` is 0, or if `period` is shorter
    /// than one millisecond.
    pub fn with_watchdog_period(end_time: u64, slots: usize, period: Duration) -> Self {
        validate_horizon(end_time, slots);
        assert!(period >= Duration::from_millis(1), "watchdog period must be >= 1ms");
        Self {
            inner: Arc::new(RealTimeInner {
                end_time,
                slots,
                watchdog: period,
                state: Mutex::new(RealTimeState {
                    phase: Phase::NotStarted,
                    epoch: 0,
                    timers: BinaryHeap::new(),
                    next_seq: 0,
                    in_flight: 0,
                    base: 0,
                    anchor: None,
                    executor: None,
                }),
                timer_cv: Condvar::new(),
                watchers: WatcherHub::new(),
                lifecycle: LifecycleGate::new(),
            }),
        }
    }

    /// Executor statistics of the current run, if one is live.
    pub fn executor_stats(&self) -> Option<ExecutorStats> {
        self.inner.lock_state().executor.as_ref().map(|executor| executor.stats())
    }

    /// Timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.inner.lock_state().timers.len()
    }
}

impl fmt::Debug for RealTimeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealTimeScheduler")
            .field("end_time", &self.inner.end_time)
            .field("slots", &self.inner.slots)
            .field("watchdog", &self.inner.watchdog)
            .finish_non_exhaustive()
    }
}

impl Scheduler for RealTimeScheduler {
    fn schedule(&self, work: Arc<dyn Executable>, waiting_time: u64, mode: ScheduleMode) {
        validate_mode(mode);
        let monitor = match mode {
            ScheduleMode::Once => None,
            _ => Some(Arc::new(Mutex::new(()))),
        };
        let mut state = self.inner.lock_state();
        let first = RealTimeInner::now_ms(&state).saturating_add(waiting_time);
        for time in activation_times(first, mode, self.inner.end_time) {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.push(ArmedTimer {
                fire_at: time,
                seq,
                activation: Activation::new(Arc::clone(&work), monitor.clone()),
            });
        }
        self.inner.timer_cv.notify_all();
    }

    fn schedule_at(&self, work: Arc<dyn Executable>, time: u64) {
        let mut state = self.inner.lock_state();
        // Checked against the clock read under the same lock that arms the
        // timer; the guard drops before the usage-error panic.
        if let Err(violation) = check_specific_time(time, RealTimeInner::now_ms(&state)) {
            drop(state);
            panic!("{violation}");
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .timers
            .push(ArmedTimer { fire_at: time, seq, activation: Activation::new(work, None) });
        self.inner.timer_cv.notify_all();
    }

    fn current_time(&self) -> u64 {
        RealTimeInner::now_ms(&self.inner.lock_state())
    }

    fn end_time(&self) -> u64 {
        self.inner.end_time
    }

    fn is_running(&self) -> bool {
        self.inner.lock_state().phase == Phase::Running
    }

    fn is_killed(&self) -> bool {
        self.inner.lock_state().phase == Phase::Killed
    }

    fn add_watcher(&self, watcher: Arc<dyn SchedulerWatcher>) -> bool {
        self.inner.watchers.add(watcher)
    }

    fn remove_watcher(&self, watcher: &Arc<dyn SchedulerWatcher>) -> bool {
        self.inner.watchers.remove(watcher)
    }

    fn start(&self) -> bool {
        let epoch = {
            let mut state = self.inner.lock_state();
            if state.phase == Phase::Running {
                return false;
            }
            state.phase = Phase::Running;
            state.epoch += 1;
            state.anchor = Some(Instant::now());
            state.in_flight = 0;
            state.executor = Some(Arc::new(Executor::new(self.inner.slots)));
            state.epoch
        };
        debug!(epoch, horizon_ms = self.inner.end_time, "real-time run started");
        let delivery = self.inner.lifecycle.begin_started(epoch);
        self.inner.watchers.notify_started();

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("simsched-timer-{epoch}"))
            .spawn(move || inner.run_loop(epoch))
            .expect("failed to spawn scheduler timer thread");
        if delivery.finish() {
            // A watcher killed the run from `on_started`; its kill
            // notification was held back for the remaining callbacks.
            self.inner.watchers.notify_killed();
        }
        true
    }

    fn kill(&self) -> bool {
        self.inner.kill_current()
    }

    fn time_mode(&self) -> TimeMode {
        TimeMode::RealTime
    }
}

/// What the timer thread decided to do with the lock held.
enum TimerPlan {
    Fire { due: Vec<Activation>, epoch: u64, executor: Arc<Executor> },
    Finish { reason: EndReason, executor: Option<Arc<Executor>> },
}

impl RealTimeInner {
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, RealTimeState> {
        self.state.lock().expect("scheduler state poisoned")
    }

    /// Current time in ms given the lock is held.
    fn now_ms(state: &RealTimeState) -> u64 {
        match state.anchor {
            Some(anchor) => state.base.saturating_add(anchor.elapsed().as_millis() as u64),
            None => state.base,
        }
    }

    fn run_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let plan = {
                let mut state = self.lock_state();
                loop {
                    if state.epoch != epoch || state.phase != Phase::Running {
                        // Killed externally, or superseded by a restart.
                        return;
                    }
                    let now = Self::now_ms(&state);
                    if now > self.end_time {
                        break TimerPlan::Finish {
                            reason: EndReason::HorizonReached,
                            executor: Self::end_run_locked(&mut state),
                        };
                    }
                    let due = Self::pop_due(&mut state.timers, now);
                    if !due.is_empty() {
                        state.in_flight += due.len();
                        let executor = Arc::clone(
                            state.executor.as_ref().expect("running scheduler has no executor"),
                        );
                        break TimerPlan::Fire { due, epoch, executor };
                    }
                    if state.in_flight == 0 && state.timers.is_empty() {
                        break TimerPlan::Finish {
                            reason: EndReason::OutOfWork,
                            executor: Self::end_run_locked(&mut state),
                        };
                    }
                    let wait = self.next_wait(&state, now);
                    let (guard, _) = self
                        .timer_cv
                        .wait_timeout(state, wait)
                        .expect("scheduler state poisoned");
                    state = guard;
                }
            };

            match plan {
                TimerPlan::Fire { due, epoch, executor } => {
                    trace!(fired = due.len(), "timers fired");
                    for activation in due {
                        let dispatch = TimerDispatch {
                            activation,
                            _inflight: InFlightGuard { inner: Arc::clone(&self), epoch },
                        };
                        // A rejection means a kill got in first; the dropped
                        // guard releases the in-flight count.
                        let _ = executor.submit(Arc::new(dispatch));
                    }
                }
                TimerPlan::Finish { reason, executor } => {
                    debug!(epoch, reason = ?reason, "real-time run ended");
                    if let Some(executor) = executor {
                        drop(executor.shutdown_now());
                    }
                    // End-of-run events queue behind the starter's
                    // notification.
                    match self.lifecycle.await_started(epoch) {
                        StartedSync::Delivered => {}
                        StartedSync::DeferredToStarter => {
                            unreachable!("timer thread inside started delivery")
                        }
                    }
                    match reason {
                        EndReason::HorizonReached => self.watchers.notify_end_time_reached(),
                        EndReason::OutOfWork => self.watchers.notify_no_executable(),
                    }
                    self.watchers.notify_killed();
                    return;
                }
            }
        }
    }

    /// Pop every timer with `fire_at <= now`, earliest first.
    fn pop_due(timers: &mut BinaryHeap<ArmedTimer>, now: u64) -> Vec<Activation> {
        let mut due = Vec::new();
        while timers.peek().is_some_and(|timer| timer.fire_at <= now) {
            let Some(timer) = timers.pop() else { break };
            due.push(timer.activation);
        }
        due
    }

    /// Sleep bound: the soonest of next timer, horizon passing, watchdog.
    fn next_wait(&self, state: &RealTimeState, now: u64) -> Duration {
        let until_horizon = self.end_time.saturating_add(1).saturating_sub(now);
        let until_timer =
            state.timers.peek().map_or(u64::MAX, |timer| timer.fire_at.saturating_sub(now));
        let watchdog = self.watchdog.as_millis() as u64;
        Duration::from_millis(watchdog.min(until_horizon).min(until_timer).max(1))
    }

    /// Transition RUNNING → KILLED under the lock: freeze the clock, clear
    /// the timers. Returns the run's executor for shutdown outside the lock.
    fn end_run_locked(state: &mut RealTimeState) -> Option<Arc<Executor>> {
        state.base = Self::now_ms(state);
        state.anchor = None;
        state.phase = Phase::Killed;
        state.timers.clear();
        state.in_flight = 0;
        state.executor.take()
    }

    fn kill_current(&self) -> bool {
        let (epoch, executor) = {
            let mut state = self.lock_state();
            if state.phase != Phase::Running {
                return false;
            }
            let epoch = state.epoch;
            let executor = Self::end_run_locked(&mut state);
            self.timer_cv.notify_all();
            (epoch, executor)
        };
        debug!("real-time run killed");
        if let Some(executor) = executor {
            drop(executor.shutdown_now());
        }
        // The kill event never overtakes the started event of its run; a
        // kill issued from inside `on_started` hands its notification to
        // the starter.
        match self.lifecycle.await_started(epoch) {
            StartedSync::Delivered => self.watchers.notify_killed(),
            StartedSync::DeferredToStarter => {}
        }
        true
    }
}
