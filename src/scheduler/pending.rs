//! Time-indexed pending work shared by both engines.
//!
//! The index maps absolute activation times to buckets of [`Activation`]s.
//! Bucket vectors preserve insertion order, which is the only intra-slot
//! priority the system has. Repeating schedules are expanded into individual
//! activations up front by [`activation_times`]; all activations of one
//! request share one monitor so they can never overlap even when dispatched
//! concurrently.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::error;

use super::ScheduleMode;
use crate::executor::{panic_message, ActivityContext};
use crate::work::{AgentId, Executable};

/// One scheduled activation, ready to dispatch at its time slot.
pub(crate) struct Activation {
    pub(crate) work: Arc<dyn Executable>,
    /// Shared by every activation of one repeating request; `None` for
    /// one-shot work. Locked around execution so successive activations of
    /// the same request serialize.
    pub(crate) monitor: Option<Arc<Mutex<()>>>,
    /// Owner captured at schedule time; keys same-slot agent grouping.
    pub(crate) owner: Option<AgentId>,
}

impl Activation {
    pub(crate) fn new(work: Arc<dyn Executable>, monitor: Option<Arc<Mutex<()>>>) -> Self {
        let owner = work.owner();
        Self { work, monitor, owner }
    }

    /// Run the work: serialize against sibling activations via the shared
    /// monitor, contain its panic so the rest of the dispatch still runs.
    pub(crate) fn run(&self, ctx: &ActivityContext) {
        let _serial = self.monitor.as_deref().map(lock_or_recover);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.work.execute(ctx))) {
            error!(
                agent = ?self.owner,
                panic = panic_message(payload.as_ref()),
                "scheduled work panicked; run continues"
            );
        }
    }
}

fn lock_or_recover(monitor: &Mutex<()>) -> MutexGuard<'_, ()> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending activations keyed by absolute time.
#[derive(Default)]
pub(crate) struct PendingWork {
    buckets: BTreeMap<u64, Vec<Activation>>,
}

impl PendingWork {
    pub(crate) fn insert(&mut self, time: u64, activation: Activation) {
        self.buckets.entry(time).or_default().push(activation);
    }

    /// Smallest time with pending work.
    pub(crate) fn next_time(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Remove and return the whole bucket at `time` (empty if none).
    pub(crate) fn take_bucket(&mut self, time: u64) -> Vec<Activation> {
        self.buckets.remove(&time).unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Total pending activations across all times.
    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// Expand a schedule request into absolute activation times.
///
/// `first` is the absolute time of the first activation (current time plus
/// waiting time). Recurrences are truncated at the horizon:
/// `min(repetitions, (horizon - first) / step + 1)` activations, none beyond
/// it. A recurrence whose first activation already lies beyond the horizon
/// expands to nothing. One-shot work is the exception: it is kept even
/// beyond the horizon, where it ends the run with end-time-reached instead
/// of out-of-work.
pub(crate) fn activation_times(first: u64, mode: ScheduleMode, horizon: u64) -> Vec<u64> {
    match mode {
        ScheduleMode::Once => vec![first],
        ScheduleMode::Repeated { repetitions, step } => {
            if first > horizon {
                return Vec::new();
            }
            let within = ((horizon - first) / step).saturating_add(1);
            (0..repetitions.min(within)).map(|i| first + i * step).collect()
        }
        ScheduleMode::Infinite { step } => {
            if first > horizon {
                return Vec::new();
            }
            let within = ((horizon - first) / step).saturating_add(1);
            (0..within).map(|i| first + i * step).collect()
        }
    }
}
