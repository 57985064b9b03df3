//! Scheduler contract and engines.
//!
//! # Architecture
//!
//! Two engines, one interface. A scheduler owns simulation time and decides
//! *when* admitted work reaches the executor; the executor decides *how
//! concurrently* it runs.
//!
//! | Engine | Time base | Step semantics |
//! |--------|-----------|----------------|
//! | [`DiscreteScheduler`] | virtual ticks | jump to next pending time, barrier per step |
//! | [`RealTimeScheduler`] | wall-clock ms | timers fire as their deadline passes |
//!
//! # Lifecycle
//!
//! ```text
//! NOT_STARTED ──start──▶ RUNNING ──kill / horizon / out-of-work──▶ KILLED
//!                           ▲                                        │
//!                           └────────────────start───────────────────┘
//! ```
//!
//! `start()` and `kill()` return false when the scheduler is not in the
//! state the transition needs. A killed scheduler can be restarted; its
//! clock continues from the frozen value and never moves backwards.
//!
//! # Scheduling rules
//!
//! - `waiting_time` is relative to `current_time()`; [`NOW`] (0) means the
//!   current instant and is valid only for the relative entry points.
//! - `schedule_at` takes an absolute time and must target the strict future
//!   (`t > 1` and `t > current_time()`).
//! - Repeating schedules expand at schedule time: with `first` the absolute
//!   time of the first activation, `min(repetitions, (horizon - first) / step
//!   + 1)` activations are created, each sharing one monitor so successive
//!   activations never overlap.
//! - Violating an argument precondition is a caller bug and panics
//!   synchronously; nothing is ever half-scheduled.

use std::sync::Arc;

use crate::work::{Event, EventDelivery, Executable};

mod discrete;
mod pending;
mod realtime;
mod watcher;

pub use discrete::DiscreteScheduler;
pub use realtime::RealTimeScheduler;
pub use watcher::{BlockingWatcher, SchedulerWatcher};

/// Relative waiting time meaning "at the current instant".
pub const NOW: u64 = 0;

// ============================================================================
// Modes
// ============================================================================

/// How often a scheduled work item recurs.
///
/// The payload lives in the variant, so a repetition count without a step
/// (or vice versa) is unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleMode {
    /// One activation.
    Once,
    /// `repetitions` activations, `step` time units apart.
    Repeated {
        /// Total number of activations (>= 1).
        repetitions: u64,
        /// Gap between consecutive activations (>= 1).
        step: u64,
    },
    /// Activations every `step` units until the horizon.
    Infinite {
        /// Gap between consecutive activations (>= 1).
        step: u64,
    },
}

/// Which clock an engine runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeMode {
    /// Virtual ticks; time jumps between pending buckets.
    DiscreteTime,
    /// Wall-clock milliseconds since the current run started.
    RealTime,
}

/// Why a run ended on its own (an external `kill()` has no reason).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EndReason {
    /// The earliest pending work lay beyond the horizon.
    HorizonReached,
    /// Nothing left pending and nothing in flight.
    OutOfWork,
}

/// Engine lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    NotStarted,
    Running,
    Killed,
}

// ============================================================================
// Contract
// ============================================================================

/// Common surface of every scheduling engine.
///
/// Object-safe: simulation setups hold `Arc<dyn Scheduler>` and stay agnostic
/// of the engine behind it.
pub trait Scheduler: Send + Sync {
    /// Schedule `work` to first run `waiting_time` units from now, recurring
    /// per `mode`.
    ///
    /// Accepted in every lifecycle state; work scheduled while killed waits
    /// for the next run. Activations landing beyond the simulation horizon
    /// are never created (the recurrence is truncated), except that a plain
    /// [`ScheduleMode::Once`] beyond the horizon is kept pending so the run
    /// can end with end-time-reached rather than out-of-work.
    ///
    /// # Panics
    ///
    /// Panics if the mode payload is invalid (`repetitions` or `step` of 0).
    fn schedule(&self, work: Arc<dyn Executable>, waiting_time: u64, mode: ScheduleMode);

    /// Schedule `work` at the absolute time `time`.
    ///
    /// # Panics
    ///
    /// Panics unless `time > 1` and `time > current_time()`. Nothing is
    /// scheduled when the check fails.
    fn schedule_at(&self, work: Arc<dyn Executable>, time: u64);

    /// Current simulation time. Frozen while killed; never decreases.
    fn current_time(&self) -> u64;

    /// The simulation horizon this engine was built with.
    fn end_time(&self) -> u64;

    /// True between a successful `start()` and the matching kill.
    fn is_running(&self) -> bool;

    /// True once a run has been killed and no restart has happened yet.
    /// False before the first start.
    fn is_killed(&self) -> bool;

    /// Register a watcher. Returns false if this exact watcher (by
    /// identity) is already registered.
    fn add_watcher(&self, watcher: Arc<dyn SchedulerWatcher>) -> bool;

    /// Unregister a watcher by identity. Returns false if it was not
    /// registered.
    fn remove_watcher(&self, watcher: &Arc<dyn SchedulerWatcher>) -> bool;

    /// Begin a run. Returns false if one is already running.
    fn start(&self) -> bool;

    /// Kill the current run: stop dispatching, discard pending work, freeze
    /// the clock, notify watchers. Returns false unless currently running.
    fn kill(&self) -> bool;

    /// Which clock this engine runs on.
    fn time_mode(&self) -> TimeMode;

    /// [`ScheduleMode::Once`] convenience.
    fn schedule_once(&self, work: Arc<dyn Executable>, waiting_time: u64) {
        self.schedule(work, waiting_time, ScheduleMode::Once);
    }

    /// [`ScheduleMode::Repeated`] convenience.
    ///
    /// # Panics
    ///
    /// Panics if `repetitions` or `step` is 0.
    fn schedule_repeated(
        &self,
        work: Arc<dyn Executable>,
        waiting_time: u64,
        repetitions: u64,
        step: u64,
    ) {
        self.schedule(work, waiting_time, ScheduleMode::Repeated { repetitions, step });
    }

    /// [`ScheduleMode::Infinite`] convenience.
    ///
    /// # Panics
    ///
    /// Panics if `step` is 0.
    fn schedule_infinitely(&self, work: Arc<dyn Executable>, waiting_time: u64, step: u64) {
        self.schedule(work, waiting_time, ScheduleMode::Infinite { step });
    }

    /// Schedule delivery of `event` to its receiver `waiting_time` units
    /// from now.
    ///
    /// Delivery runs as receiver-owned work, so events addressed to one
    /// receiver at one time slot serialize in schedule order.
    ///
    /// # Panics
    ///
    /// Panics if the event names no receiver.
    fn schedule_event(&self, event: Arc<dyn Event>, waiting_time: u64) {
        let Some(receiver) = event.receiver() else {
            panic!("scheduled event must name a receiver agent");
        };
        self.schedule_once(Arc::new(EventDelivery::new(event, receiver)), waiting_time);
    }
}

// ============================================================================
// Argument validation
// ============================================================================

/// Validate a mode payload. Engines call this before touching any state.
pub(crate) fn validate_mode(mode: ScheduleMode) {
    match mode {
        ScheduleMode::Once => {}
        ScheduleMode::Repeated { repetitions, step } => {
            assert!(repetitions >= 1, "schedule repetitions must be >= 1");
            assert!(step >= 1, "schedule step must be >= 1");
        }
        ScheduleMode::Infinite { step } => {
            assert!(step >= 1, "schedule step must be >= 1");
        }
    }
}

/// Check a `schedule_at` target against the current clock.
///
/// Engines evaluate this under the state lock, where the clock is stable
/// against a concurrently stepping run, and drop the guard before panicking
/// with the returned violation.
pub(crate) fn check_specific_time(time: u64, current: u64) -> Result<(), String> {
    if time <= 1 {
        return Err(format!("specific-time schedule requires time > 1, got {time}"));
    }
    if time <= current {
        return Err(format!(
            "specific-time schedule must target the future: time {time} <= current {current}"
        ));
    }
    Ok(())
}

/// Validate engine construction arguments.
pub(crate) fn validate_horizon(end_time: u64, slots: usize) {
    assert!(end_time >= 1, "simulation end time must be >= 1");
    assert!(slots >= 1, "scheduler executor slots must be >= 1");
}
