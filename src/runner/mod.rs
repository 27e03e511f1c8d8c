//! The scheduling interface.
//!
//! A [`SequencedTaskRunner`] is bound to one sequence: tasks posted through it never run
//! concurrently with each other and run in the order of their delay-adjusted run time, ties broken
//! by post order.
//!
//! # Nesting
//!
//! Some runners can run tasks from inside another task's stack frame, for example when a task
//! spins a nested run loop. Tasks posted with [`post_task`](SequencedTaskRunner::post_task) may run
//! there. Tasks posted with [`post_non_nestable_task`](SequencedTaskRunner::post_non_nestable_task)
//! never do: they wait until the running task has returned.
//!
//! # Failure
//!
//! Posting returns `false` when the runner has shut down. The task is destroyed without running.
//! Callers are expected to treat that as a normal teardown condition.
use std::{
    mem::ManuallyDrop,
    panic::Location,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    task::{
        handle::{CancellationDelegate, DelayedTaskHandle},
        Task,
    },
    time::{default_tick_clock, TickClock},
};

pub mod deleter;

/// How strictly a runner must honour a deadline.
///
/// Only affects scheduling tolerance. A task never runs before a precise deadline, and never
/// runs out of order within its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    /// Run no earlier than the deadline. The runner may run it later.
    Precise,
    /// The runner may run the task somewhat early, to batch it with nearby work.
    Flexible,
}

pub trait SequencedTaskRunner: Send + Sync {
    /// Posts `task` to run after `delay`. The task may run nested inside another task.
    ///
    /// A zero delay makes the task eligible immediately. It is still ordered after every task of
    /// the sequence that is already eligible.
    fn post_delayed_task(&self, task: Task, delay: Duration) -> bool;

    /// Like [`post_delayed_task`](Self::post_delayed_task), but the task never runs nested inside
    /// another task of this sequence.
    fn post_non_nestable_delayed_task(&self, task: Task, delay: Duration) -> bool;

    /// Returns `true` if the calling thread is currently running a task of this sequence.
    fn runs_tasks_in_current_sequence(&self) -> bool;

    /// The clock deadlines passed to [`post_delayed_task_at`](Self::post_delayed_task_at) are
    /// measured against.
    fn clock(&self) -> Arc<dyn TickClock> {
        default_tick_clock()
    }

    fn post_task(&self, task: Task) -> bool {
        self.post_delayed_task(task, Duration::ZERO)
    }

    /// Posts `task` so that it runs only once the currently running task (if any) has returned.
    ///
    /// Routed through the delayed path with a zero delay, which never nests.
    fn post_non_nestable_task(&self, task: Task) -> bool {
        self.post_non_nestable_delayed_task(task, Duration::ZERO)
    }

    /// Posts `task` to run at an absolute deadline.
    ///
    /// `None` means "as soon as possible". A deadline in the past is clamped to a zero delay.
    /// This default converts to a relative delay and drops `delay_policy`; runners that can honour
    /// the policy override it.
    fn post_delayed_task_at(
        &self,
        task: Task,
        delayed_run_time: Option<Instant>,
        _delay_policy: DelayPolicy,
    ) -> bool {
        let delay = delay_until(&*self.clock(), delayed_run_time);
        self.post_delayed_task(task, delay)
    }
}

/// Converts an absolute deadline to a delay from now, clamped to zero.
pub(crate) fn delay_until(clock: &dyn TickClock, delayed_run_time: Option<Instant>) -> Duration {
    match delayed_run_time {
        None => Duration::ZERO,
        Some(deadline) => deadline.saturating_duration_since(clock.now_ticks()),
    }
}

/// Operations built on top of the [`SequencedTaskRunner`] primitives.
///
/// Implemented for every runner, including `dyn SequencedTaskRunner`.
pub trait SequencedTaskRunnerExt: SequencedTaskRunner {
    /// Posts `task` after `delay` and returns a handle that can cancel it until it starts running.
    ///
    /// If the post is rejected the returned handle is already invalid.
    fn post_cancelable_delayed_task(&self, task: Task, delay: Duration) -> DelayedTaskHandle {
        let delegate = Arc::new(CancellationDelegate::new());
        let location = task.location();
        let task = task.bind_to(delegate.clone());
        let handle = DelayedTaskHandle::new(delegate);

        // A rejected task is destroyed before the post returns, which settles the delegate.
        if !self.post_delayed_task(task, delay) {
            tracing::trace!(%location, "cancelable post rejected");
            debug_assert!(!handle.is_valid());
        }
        handle
    }

    /// Like [`post_cancelable_delayed_task`](Self::post_cancelable_delayed_task) with an absolute
    /// deadline.
    fn post_cancelable_delayed_task_at(
        &self,
        task: Task,
        delayed_run_time: Option<Instant>,
        delay_policy: DelayPolicy,
    ) -> DelayedTaskHandle {
        let delegate = Arc::new(CancellationDelegate::new());
        let location = task.location();
        let task = task.bind_to(delegate.clone());
        let handle = DelayedTaskHandle::new(delegate);

        if !self.post_delayed_task_at(task, delayed_run_time, delay_policy) {
            tracing::trace!(%location, "cancelable post rejected");
            debug_assert!(!handle.is_valid());
        }
        handle
    }

    /// Posts a non-nestable task calling `deleter(object)` on this sequence.
    ///
    /// If the post is rejected `object` is leaked rather than destroyed on the wrong sequence.
    #[track_caller]
    fn delete_or_release_soon<T>(&self, object: T, deleter: fn(T)) -> bool
    where
        T: Send + 'static,
    {
        let object = ManuallyDrop::new(object);
        self.post_non_nestable_task(Task::with_location(Location::caller(), move || {
            deleter(ManuallyDrop::into_inner(object))
        }))
    }

    /// Destroys `object` on this sequence, after the tasks already posted to it.
    #[track_caller]
    fn delete_soon<T>(&self, object: Box<T>) -> bool
    where
        T: ?Sized + Send + 'static,
    {
        self.delete_or_release_soon(object, drop::<Box<T>>)
    }

    /// Drops this reference to `object` on this sequence.
    #[track_caller]
    fn release_soon<T>(&self, object: Arc<T>) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.delete_or_release_soon(object, drop::<Arc<T>>)
    }
}

impl<R> SequencedTaskRunnerExt for R where R: SequencedTaskRunner + ?Sized {}
