//! Execution engines for sequences.
//!
//! A posted task is wrapped into a `PendingTask` carrying its run time, delay policy and whether
//! it may run nested, and stored in the sequence's queue. Whoever drives the sequence pops ready
//! tasks one at a time and runs each with the sequence's context installed, which is what
//! [`runs_tasks_in_current_sequence`](crate::SequencedTaskRunner::runs_tasks_in_current_sequence)
//! and [`current_default`] observe.
//!
//! Two drivers are provided:
//!
//! 1. [`SequenceThread`](thread::SequenceThread), a dedicated OS thread.
//! 2. [`TestTaskRunner`](test_runner::TestTaskRunner), driven by hand on a mock clock.
use self::{current::SequenceContext, queue::PendingTask};
use crate::time::TickClock;

pub mod current;
mod queue;
pub mod test_runner;
pub mod thread;

pub use current::{current_default, has_current_default, SequenceId};

/// Runs one task of the sequence described by `context`.
pub(crate) fn run_pending(context: &SequenceContext, clock: &dyn TickClock, pending: PendingTask) {
    let location = pending.task.location();

    #[cfg(feature = "debugging")]
    log::debug!(
        "[{}][{}] queued for {:?}, {:?} past its run time",
        context.sequence(),
        location,
        clock.now_ticks().saturating_duration_since(pending.posted_at),
        clock.now_ticks().saturating_duration_since(pending.run_time),
    );
    #[cfg(not(feature = "debugging"))]
    let _ = clock;

    tracing::trace!(sequence = %context.sequence(), %location, "running task");
    context.enter(|| pending.task.run())
}
