//! Units of work posted to a sequence.
//!
//! A [`Task`] is a single-invocation closure paired with the source location it was created at.
//! Ownership of the closure moves from the poster to the runner and finally to the thread that
//! runs it; a task is never cloned, so it runs at most once.
//!
//! # Cancellation
//!
//! Tasks posted through
//! [`post_cancelable_delayed_task`](crate::SequencedTaskRunnerExt::post_cancelable_delayed_task)
//! are bound to a [`CancellationDelegate`](handle::CancellationDelegate) before they are handed to
//! the runner. The delegate is shared between the wrapped closure and the returned
//! [`DelayedTaskHandle`](handle::DelayedTaskHandle), and its state decides whether the body runs.
use std::{fmt, panic::Location, sync::Arc};

use self::{handle::CancellationDelegate, state::TransitionToRan};

pub mod handle;
mod state;

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

pub struct Task {
    location: &'static Location<'static>,
    callback: Callback,
}

impl Task {
    /// Creates a task tagged with the caller's source location.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_location(Location::caller(), f)
    }

    pub fn with_location<F>(location: &'static Location<'static>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            location,
            callback: Box::new(f),
        }
    }

    /// Where the task was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Runs the task, consuming it.
    pub fn run(self) {
        (self.callback)()
    }

    /// Wraps the task so that it only runs if `delegate` is still pending when the runner gets to
    /// it.
    ///
    /// The wrapped closure holds its own reference to the delegate, so the handle side can be
    /// dropped at any time. If the wrapped task is destroyed without running (the post was
    /// rejected, or the runner shut down with the task still queued) the delegate settles as
    /// cancelled.
    pub(crate) fn bind_to(self, delegate: Arc<CancellationDelegate>) -> Task {
        let location = self.location;
        let bound = BoundCallback {
            delegate,
            callback: Some(self.callback),
        };

        Task::with_location(location, move || bound.run())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("location", &format_args!("{}", self.location))
            .finish_non_exhaustive()
    }
}

struct BoundCallback {
    delegate: Arc<CancellationDelegate>,
    callback: Option<Callback>,
}

impl BoundCallback {
    fn run(mut self) {
        let callback = match self.callback.take() {
            Some(callback) => callback,
            None => return,
        };

        match self.delegate.state().transition_to_ran() {
            TransitionToRan::Run => callback(),
            // Cancelled first. Drop the body without running it
            TransitionToRan::Skip => drop(callback),
        }
    }
}

impl Drop for BoundCallback {
    fn drop(&mut self) {
        if self.callback.is_some() {
            // Never ran, so it can never run. Settle the state so the handle reports invalid.
            self.delegate.state().abandon();
        }
    }
}
