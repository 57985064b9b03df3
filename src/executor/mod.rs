//! Cooperative bounded-concurrency execution.
//!
//! Two layers:
//!
//! - `latch`: the single-shot park/wake latch each activity re-arms per
//!   suspension.
//! - `pool`: the executor itself: slot accounting, FIFO admission,
//!   park/wake/forced-wake, shutdown and termination.
//!
//! Schedulers in [`crate::scheduler`] sit on top of this module; they own an
//! executor per run and never touch the latch layer directly.

mod latch;
mod pool;

pub use pool::{ActivityContext, ActivityHandle, Executor, ExecutorStats, ParkError};

pub(crate) use pool::panic_message;
