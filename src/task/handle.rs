use std::{fmt, sync::Arc};

use super::state::{State, TransitionToCancelled};

/// Cancellation state shared between a [`DelayedTaskHandle`] and the wrapped task it controls.
///
/// The handle holds one strong reference and the wrapped task closure another. Neither owns the
/// other, so dropping the handle leaves the task runnable and running the task leaves the handle
/// queryable.
pub struct CancellationDelegate {
    state: State,
}

impl CancellationDelegate {
    pub(crate) fn new() -> Self {
        Self {
            state: State::new(),
        }
    }

    pub(super) fn state(&self) -> &State {
        &self.state
    }

    /// Returns `true` while the task has neither started running nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.load().is_pending()
    }

    /// Attempts to move the task from pending to cancelled. Returns whether this call won.
    pub fn cancel(&self) -> bool {
        match self.state.transition_to_cancelled() {
            TransitionToCancelled::Cancelled => true,
            TransitionToCancelled::DoNothing => false,
        }
    }
}

impl fmt::Debug for CancellationDelegate {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CancellationDelegate")
            .field("state", &self.state)
            .finish()
    }
}

/// Handle to a delayed task that can still be cancelled.
///
/// Returned by the cancelable posting methods on
/// [`SequencedTaskRunnerExt`](crate::SequencedTaskRunnerExt). The handle is valid from the moment
/// the task is posted until the task starts running, is cancelled, or is dropped by the runner.
///
/// Dropping the handle does **not** cancel the task. Only [`cancel_task()`](Self::cancel_task)
/// does.
///
/// The handle is move-only. A default-constructed or [`take`](Self::take)n-from handle has no
/// delegate and behaves as an invalid handle: every query returns `false`.
#[derive(Default)]
#[must_use = "dropping the handle does not cancel the task"]
pub struct DelayedTaskHandle {
    delegate: Option<Arc<CancellationDelegate>>,
}

impl DelayedTaskHandle {
    pub(crate) fn new(delegate: Arc<CancellationDelegate>) -> Self {
        Self {
            delegate: Some(delegate),
        }
    }

    /// Returns `true` if the task is still waiting to run and can be cancelled.
    pub fn is_valid(&self) -> bool {
        self.delegate
            .as_ref()
            .map_or(false, |delegate| delegate.is_pending())
    }

    /// Cancels the task if it hasn't started running yet.
    ///
    /// Returns `true` if the task will now never run, `false` if it already ran, is running, was
    /// already cancelled, or this handle is empty. The handle is invalid afterwards either way.
    pub fn cancel_task(&mut self) -> bool {
        match self.delegate.take() {
            Some(delegate) => delegate.cancel(),
            None => false,
        }
    }

    /// Transfers ownership of the delegate into a new handle, leaving this one empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl fmt::Debug for DelayedTaskHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DelayedTaskHandle")
            .field("delegate", &self.delegate)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::{CancellationDelegate, DelayedTaskHandle};
    use crate::task::Task;

    fn bound_handle(ran: &Arc<AtomicBool>) -> (Task, DelayedTaskHandle) {
        let delegate = Arc::new(CancellationDelegate::new());
        let r = ran.clone();
        let task = Task::new(move || r.store(true, Ordering::SeqCst)).bind_to(delegate.clone());
        (task, DelayedTaskHandle::new(delegate))
    }

    #[test]
    fn default_handle_is_inert() {
        let mut handle = DelayedTaskHandle::default();
        assert!(!handle.is_valid());
        assert!(!handle.cancel_task());
    }

    #[test]
    fn cancel_before_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let (task, mut handle) = bound_handle(&ran);

        assert!(handle.is_valid());
        assert!(handle.cancel_task());
        assert!(!handle.is_valid());

        task.run();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_after_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let (task, mut handle) = bound_handle(&ran);

        task.run();
        assert!(!handle.is_valid());
        assert!(!handle.cancel_task());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn taken_from_handle_is_inert() {
        let ran = Arc::new(AtomicBool::new(false));
        let (task, mut handle) = bound_handle(&ran);

        let mut moved = handle.take();
        assert!(!handle.is_valid());
        assert!(!handle.cancel_task());
        assert!(moved.is_valid());

        // The empty handle's cancel must not have reached the delegate
        task.run();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!moved.cancel_task());
    }

    #[test]
    fn dropped_handle_does_not_cancel() {
        let ran = Arc::new(AtomicBool::new(false));
        let (task, handle) = bound_handle(&ran);

        drop(handle);
        task.run();
        assert!(ran.load(Ordering::SeqCst));
    }
}
