//! Single-Shot Wake Latch
//!
//! # Purpose
//!
//! The suspension primitive under `park()`/`wake()`: a latch that is re-armed
//! for every park and fired at most once per park cycle, carrying the cause of
//! the wake (a cooperative `wake()` vs a forced wake-up from the executor).
//!
//! # Correctness Invariants
//!
//! - **Edge-triggered**: `arm()` clears any previous cause, so a fire from an
//!   earlier park cycle can never satisfy a later `wait()`.
//! - **Single-shot**: the first `fire()` per cycle wins; the recorded cause is
//!   never overwritten.
//! - **No lost wakeups**: `fire()` stores the cause before notifying, `wait()`
//!   re-checks under the lock, so a fire landing between `arm()` and `wait()`
//!   is observed immediately.
//!
//! # Design Notes
//!
//! Mutex + Condvar rather than atomics: the latch sits on the suspension slow
//! path (an activity about to block), where a condvar wait is exactly the
//! right cost and there are no memory-ordering subtleties to get wrong.
//! Callers sequence `arm()`/`fire()` under the pool lock; only `wait()` runs
//! outside it.

use std::sync::{Condvar, Mutex};

/// Why a parked activity was woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WakeCause {
    /// A collaborator called `ActivityHandle::wake`.
    Woken,
    /// The executor force-woke the activity (quiescence or shutdown sweep).
    Forced,
}

/// Single-shot wake latch, re-armed on every park.
#[derive(Debug)]
pub(crate) struct WakeLatch {
    cause: Mutex<Option<WakeCause>>,
    cv: Condvar,
}

impl WakeLatch {
    pub(crate) fn new() -> Self {
        Self { cause: Mutex::new(None), cv: Condvar::new() }
    }

    /// Re-arm for a new park cycle, discarding any stale cause.
    pub(crate) fn arm(&self) {
        *self.cause.lock().expect("wake latch poisoned") = None;
    }

    /// Fire the latch with `cause`.
    ///
    /// Returns false if the latch was already fired this cycle; the first
    /// cause wins.
    pub(crate) fn fire(&self, cause: WakeCause) -> bool {
        let mut slot = self.cause.lock().expect("wake latch poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        self.cv.notify_all();
        true
    }

    /// Block until the latch fires, returning the cause.
    pub(crate) fn wait(&self) -> WakeCause {
        let mut slot = self.cause.lock().expect("wake latch poisoned");
        loop {
            match *slot {
                Some(cause) => return cause,
                None => slot = self.cv.wait(slot).expect("wake latch poisoned"),
            }
        }
    }
}
