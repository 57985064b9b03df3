//! Discrete-time step-barrier engine.
//!
//! # Purpose
//!
//! Virtual time advances in jumps: each step picks the smallest pending
//! time, moves the clock there, dispatches the whole bucket through the
//! executor, and blocks on a barrier until every dispatch of the step has
//! finished. Only then is the next step considered, so work scheduled by a
//! running activation (re-entrant scheduling) always lands in a later
//! round, never in the current barrier.
//!
//! # Step algorithm
//!
//! ```text
//! loop:
//!   t ← smallest pending time
//!   t missing        → end run (no executable)
//!   t beyond horizon → end run (end time reached)
//!   otherwise        → clock = t
//!                      group bucket(t) into dispatches
//!                      submit all, wait on the step barrier
//! ```
//!
//! Grouping: activations owned by the same agent merge into one dispatch
//! and run sequentially in schedule order; everything else becomes its own
//! dispatch. Dispatches of one step run concurrently up to the executor's
//! slot budget.
//!
//! # Correctness Invariants
//!
//! - The virtual clock never decreases, across steps, kills and restarts.
//! - The step barrier cannot leak: every dispatch holds a barrier clone
//!   that drops on completion, on panic unwind, and on kill-time discard.
//! - Lifecycle events fire exactly once per run, in order: started, the
//!   reason event (if any), then killed. An external kill fires no reason
//!   event and its notification never overtakes the started delivery.
//! - A stale control thread (from a run that was killed and restarted)
//!   never touches the new run: every step re-checks the run epoch under
//!   the state lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use ahash::AHashMap;
use crossbeam_utils::sync::WaitGroup;
use tracing::{debug, trace};

use super::pending::{activation_times, Activation, PendingWork};
use super::watcher::{LifecycleGate, SchedulerWatcher, StartedSync, WatcherHub};
use super::{
    check_specific_time, validate_horizon, validate_mode, EndReason, Phase, ScheduleMode,
    Scheduler, TimeMode,
};
use crate::executor::{ActivityContext, Executor, ExecutorStats};
use crate::work::{AgentId, Executable};

// ============================================================================
// Step dispatch
// ============================================================================

/// One executor submission of a step: a run of activations executed
/// sequentially, plus the barrier clone that marks the step incomplete
/// until this dispatch is done (or discarded).
struct StepDispatch {
    items: Vec<Activation>,
    _sync: WaitGroup,
}

impl Executable for StepDispatch {
    fn execute(&self, ctx: &ActivityContext) {
        for activation in &self.items {
            activation.run(ctx);
        }
    }
}

/// Group a time bucket into dispatches: same-agent activations merge in
/// bucket order, ownerless activations stand alone.
fn group_dispatches(bucket: Vec<Activation>, barrier: &WaitGroup) -> Vec<StepDispatch> {
    let mut dispatches: Vec<StepDispatch> = Vec::new();
    let mut by_agent: AHashMap<AgentId, usize> = AHashMap::new();
    for activation in bucket {
        match activation.owner {
            Some(agent) => {
                let slot = *by_agent.entry(agent).or_insert_with(|| {
                    dispatches.push(StepDispatch { items: Vec::new(), _sync: barrier.clone() });
                    dispatches.len() - 1
                });
                dispatches[slot].items.push(activation);
            }
            None => {
                dispatches.push(StepDispatch { items: vec![activation], _sync: barrier.clone() });
            }
        }
    }
    dispatches
}

// ============================================================================
// Engine
// ============================================================================

struct DiscreteState {
    phase: Phase,
    /// Bumped on every start; stale control threads detect it and exit.
    epoch: u64,
    pending: PendingWork,
    /// Executor of the current run; `None` outside RUNNING.
    executor: Option<Arc<Executor>>,
}

struct DiscreteInner {
    end_time: u64,
    slots: usize,
    state: Mutex<DiscreteState>,
    /// Virtual clock. Written only by the control thread under the state
    /// lock; frozen while killed; never decreases.
    clock: AtomicU64,
    watchers: WatcherHub,
    /// Holds end-of-run notifications behind the started delivery.
    lifecycle: LifecycleGate,
}

/// Discrete-time scheduler.
///
/// Cheap to clone; clones share the engine, which is what lets an
/// activation hold its scheduler and schedule re-entrantly.
#[derive(Clone)]
pub struct DiscreteScheduler {
    inner: Arc<DiscreteInner>,
}

impl DiscreteScheduler {
    /// Create a discrete-time scheduler that simulates up to `end_time`
    /// ticks inclusive, running at most `slots` dispatches concurrently per
    /// step.
    ///
    /// # Panics
    ///
    /// Panics if `end_time` or `slots` is 0.
    pub fn new(end_time: u64, slots: usize) -> Self {
        validate_horizon(end_time, slots);
        Self {
            inner: Arc::new(DiscreteInner {
                end_time,
                slots,
                state: Mutex::new(DiscreteState {
                    phase: Phase::NotStarted,
                    epoch: 0,
                    pending: PendingWork::default(),
                    executor: None,
                }),
                clock: AtomicU64::new(0),
                watchers: WatcherHub::new(),
                lifecycle: LifecycleGate::new(),
            }),
        }
    }

    /// Executor statistics of the current run, if one is live.
    pub fn executor_stats(&self) -> Option<ExecutorStats> {
        self.inner.lock_state().executor.as_ref().map(|executor| executor.stats())
    }

    /// Activations waiting in the time index.
    pub fn pending_activations(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

impl fmt::Debug for DiscreteScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscreteScheduler")
            .field("end_time", &self.inner.end_time)
            .field("slots", &self.inner.slots)
            .finish_non_exhaustive()
    }
}

impl Scheduler for DiscreteScheduler {
    fn schedule(&self, work: Arc<dyn Executable>, waiting_time: u64, mode: ScheduleMode) {
        validate_mode(mode);
        let monitor = match mode {
            ScheduleMode::Once => None,
            _ => Some(Arc::new(Mutex::new(()))),
        };
        let mut state = self.inner.lock_state();
        let first = self.inner.clock.load(Ordering::Relaxed).saturating_add(waiting_time);
        for time in activation_times(first, mode, self.inner.end_time) {
            state.pending.insert(time, Activation::new(Arc::clone(&work), monitor.clone()));
        }
    }

    fn schedule_at(&self, work: Arc<dyn Executable>, time: u64) {
        let mut state = self.inner.lock_state();
        // The clock only advances under the state lock, so the check and
        // the insert see the same instant; the guard drops before the
        // usage-error panic.
        if let Err(violation) = check_specific_time(time, self.inner.clock.load(Ordering::Relaxed))
        {
            drop(state);
            panic!("{violation}");
        }
        state.pending.insert(time, Activation::new(work, None));
    }

    fn current_time(&self) -> u64 {
        self.inner.clock.load(Ordering::Relaxed)
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
            state.executor = Some(Arc::new(Executor::new(self.inner.slots)));
            state.epoch
        };
        debug!(epoch, horizon = self.inner.end_time, "discrete run started");
        let delivery = self.inner.lifecycle.begin_started(epoch);
        self.inner.watchers.notify_started();

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("simsched-clock-{epoch}"))
            .spawn(move || inner.run_loop(epoch))
            .expect("failed to spawn scheduler control thread");
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
        TimeMode::DiscreteTime
    }
}

/// What the control thread decided to do with the lock held.
enum StepPlan {
    Dispatch { time: u64, bucket: Vec<Activation>, executor: Arc<Executor> },
    Finish { reason: EndReason, executor: Option<Arc<Executor>> },
}

impl DiscreteInner {
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, DiscreteState> {
        self.state.lock().expect("scheduler state poisoned")
    }

    fn run_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let plan = {
                let mut state = self.lock_state();
                if state.epoch != epoch || state.phase != Phase::Running {
                    // Killed externally, or superseded by a restart.
                    return;
                }
                match state.pending.next_time() {
                    None => StepPlan::Finish {
                        reason: EndReason::OutOfWork,
                        executor: Self::end_run_locked(&mut state),
                    },
                    Some(next) if next > self.end_time => StepPlan::Finish {
                        reason: EndReason::HorizonReached,
                        executor: Self::end_run_locked(&mut state),
                    },
                    Some(next) => {
                        debug_assert!(
                            next >= self.clock.load(Ordering::Relaxed),
                            "virtual clock would move backwards"
                        );
                        self.clock.store(next, Ordering::Relaxed);
                        let bucket = state.pending.take_bucket(next);
                        let executor = Arc::clone(
                            state.executor.as_ref().expect("running scheduler has no executor"),
                        );
                        StepPlan::Dispatch { time: next, bucket, executor }
                    }
                }
            };

            match plan {
                StepPlan::Dispatch { time, bucket, executor } => {
                    let barrier = WaitGroup::new();
                    let dispatches = group_dispatches(bucket, &barrier);
                    trace!(time, dispatches = dispatches.len(), "step dispatched");
                    for dispatch in dispatches {
                        // A rejection means a kill got in first; the dropped
                        // clone keeps the barrier consistent.
                        let _ = executor.submit(Arc::new(dispatch));
                    }
                    barrier.wait();
                }
                StepPlan::Finish { reason, executor } => {
                    debug!(
                        epoch,
                        reason = ?reason,
                        time = self.clock.load(Ordering::Relaxed),
                        "discrete run ended"
                    );
                    if let Some(executor) = executor {
                        drop(executor.shutdown_now());
                    }
                    // End-of-run events queue behind the starter's
                    // notification.
                    match self.lifecycle.await_started(epoch) {
                        StartedSync::Delivered => {}
                        StartedSync::DeferredToStarter => {
                            unreachable!("control thread inside started delivery")
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

    /// Transition RUNNING → KILLED under the lock. Returns the run's
    /// executor for the caller to shut down outside the lock.
    fn end_run_locked(state: &mut DiscreteState) -> Option<Arc<Executor>> {
        state.phase = Phase::Killed;
        state.pending.clear();
        state.executor.take()
    }

    fn kill_current(&self) -> bool {
        let (epoch, executor) = {
            let mut state = self.lock_state();
            if state.phase != Phase::Running {
                return false;
            }
            (state.epoch, Self::end_run_locked(&mut state))
        };
        debug!(time = self.clock.load(Ordering::Relaxed), "discrete run killed");
        if let Some(executor) = executor {
            // Never-started dispatches are discarded here; running ones
            // finish on their own.
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
