//! Concurrency and scheduling core for agent-based discrete-event simulation.
//!
//! ## Scope
//! This crate runs simulation work under an explicit concurrency bound and an
//! explicit notion of time. Work is anything implementing [`Executable`]; an
//! [`Executor`] runs it with a fixed number of active slots and cooperative
//! suspension; a [`Scheduler`] engine decides when each piece runs, either in
//! virtual discrete time or against the wall clock.
//!
//! ## Key invariants
//! - Concurrency is bounded by slots, and a suspended activity does not hold
//!   one: `park()` releases the slot, resuming reacquires it.
//! - Wake-ups are edge-triggered. A wake delivered while the target is not
//!   parked has no effect, then or later.
//! - An activity parked when the pool goes quiescent is force-woken exactly
//!   once; nothing blocks forever waiting for a wake nobody can send.
//! - Scheduler lifecycle events fire exactly once per run, and the
//!   simulation clock never decreases, across steps, kills and restarts.
//! - A panicking work item is contained and logged; siblings, the step and
//!   the pool keep going.
//!
//! ## Execution flow (discrete step)
//! `schedule -> pending index -> take bucket -> group by agent -> executor
//! -> step barrier -> next step`
//!
//! ## Notable entry points
//! - [`Executor`] / [`ActivityContext`]: bounded execution, park/wake.
//! - [`DiscreteScheduler`] / [`RealTimeScheduler`]: the two time engines.
//! - [`Scheduler`] / [`ScheduleMode`] / [`NOW`]: the scheduling contract.
//! - [`SchedulerWatcher`] / [`BlockingWatcher`]: lifecycle observation.
//! - [`Action`] / [`AgentId`] / [`Event`]: the agent-facing work model.

pub mod executor;
pub mod scheduler;
pub mod work;

pub use executor::{ActivityContext, ActivityHandle, Executor, ExecutorStats, ParkError};
pub use scheduler::{
    BlockingWatcher, DiscreteScheduler, RealTimeScheduler, ScheduleMode, Scheduler,
    SchedulerWatcher, TimeMode, NOW,
};
pub use work::{Action, AgentId, Event, Executable};
