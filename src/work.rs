//! Unit-of-Work Model
//!
//! # Purpose
//!
//! Defines what the scheduling core runs: [`Executable`] (the bare unit of
//! work), [`Action`] (work owned by an agent), and [`Event`] (a timed message
//! addressed to an agent). Everything the schedulers queue, expand, group and
//! dispatch is an `Arc<dyn Executable>`.
//!
//! # Ownership Flow
//!
//! ```text
//! consumer ──schedule──▶ pending index ──dispatch──▶ executor ──▶ discarded
//!            (scheduler owns)            (executor owns)
//! ```
//!
//! Work items are created by consumers, owned by the scheduler while queued,
//! handed to the executor for the duration of execution, then dropped. There
//! is no reuse or pooling; a repeating schedule re-activates the *same*
//! `Arc<dyn Executable>` at each step, which is why `execute` takes `&self`
//! and state mutation goes through interior mutability.
//!
//! # Agent Ordering
//!
//! [`Executable::owner`] is the grouping key for the discrete engine: work
//! sharing an owner and a time slot runs sequentially in submission order,
//! never concurrently. Ownerless work and work of different agents runs fully
//! in parallel, bounded only by the executor's slot budget.

use std::fmt;
use std::sync::Arc;

use crate::executor::ActivityContext;

/// Identity of a simulation agent.
///
/// Used purely as an ordering/grouping key by the scheduling core; agent
/// lifecycle lives in the layers above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

/// A unit of simulation work.
///
/// Implementations must be shareable across threads: a repeating schedule
/// activates the same instance many times, and the real-time engine may hold
/// an activation on a timer while an earlier one is still running (the two are
/// serialized by the schedule's monitor, not by `&mut` exclusivity).
///
/// Any `Fn(&ActivityContext) + Send + Sync + 'static` closure is an
/// `Executable` via the blanket impl below, which is the common way to write
/// small behaviors and tests.
pub trait Executable: Send + Sync + 'static {
    /// Run this unit of work.
    ///
    /// `ctx` is the live activity context: it exposes [`ActivityContext::park`]
    /// for cooperative suspension and [`ActivityContext::handle`] so the
    /// activity can hand out a wake handle to collaborators.
    fn execute(&self, ctx: &ActivityContext);

    /// Agent this work belongs to, if any.
    ///
    /// Work sharing an owner and a discrete time slot is guaranteed
    /// non-overlapping and order-preserving; `None` opts out of both
    /// guarantees.
    fn owner(&self) -> Option<AgentId> {
        None
    }
}

impl<F> Executable for F
where
    F: Fn(&ActivityContext) + Send + Sync + 'static,
{
    fn execute(&self, ctx: &ActivityContext) {
        self(ctx)
    }
}

impl fmt::Debug for dyn Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable").field("owner", &self.owner()).finish_non_exhaustive()
    }
}

/// A unit of work owned by an agent.
///
/// Wrapping work in an `Action` is what buys the same-agent guarantees: two
/// actions with the same [`AgentId`] scheduled at the same discrete time run
/// sequentially, in the order they were scheduled.
pub struct Action<E> {
    agent: AgentId,
    work: E,
}

impl<E: Executable> Action<E> {
    /// Bind `work` to its owning agent.
    pub fn new(agent: AgentId, work: E) -> Self {
        Self { agent, work }
    }

    /// The owning agent.
    #[inline]
    pub fn agent(&self) -> AgentId {
        self.agent
    }
}

impl<E: Executable> Executable for Action<E> {
    fn execute(&self, ctx: &ActivityContext) {
        self.work.execute(ctx);
    }

    fn owner(&self) -> Option<AgentId> {
        Some(self.agent)
    }
}

impl<E> fmt::Debug for Action<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("agent", &self.agent).finish_non_exhaustive()
    }
}

/// A timed message addressed to an agent.
///
/// The scheduling core does not interpret events; it only turns
/// `schedule_event(event, waiting_time)` into a receiver-owned activation that
/// calls [`Event::deliver`] at the right time. Because the activation is owned
/// by the receiver, events addressed to one agent at one time slot are
/// delivered sequentially in submission order, like same-agent actions.
pub trait Event: Send + Sync + 'static {
    /// The agent this event is addressed to.
    ///
    /// `None` means the event is undeliverable; scheduling it is a usage
    /// error.
    fn receiver(&self) -> Option<AgentId>;

    /// Deliver the event to its receiver.
    ///
    /// Runs on an executor activity at the scheduled time; the environment
    /// layer implements the actual hand-off.
    fn deliver(&self, ctx: &ActivityContext);
}

/// Adapter turning a scheduled event into receiver-owned work.
pub(crate) struct EventDelivery {
    event: Arc<dyn Event>,
    receiver: AgentId,
}

impl EventDelivery {
    /// `receiver` must be the event's own declared receiver; the caller has
    /// already rejected receiverless events.
    pub(crate) fn new(event: Arc<dyn Event>, receiver: AgentId) -> Self {
        Self { event, receiver }
    }
}

impl Executable for EventDelivery {
    fn execute(&self, ctx: &ActivityContext) {
        self.event.deliver(ctx);
    }

    fn owner(&self) -> Option<AgentId> {
        Some(self.receiver)
    }
}
