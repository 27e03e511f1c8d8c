use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Set while the task can still go either way.
///
/// Every cancelable task starts here. Exactly one party moves it out: the runner, right before the
/// body is invoked, or a [`DelayedTaskHandle::cancel_task()`] call. Whoever loses observes the
/// settled value and does nothing.
///
/// [`DelayedTaskHandle::cancel_task()`]: super::handle::DelayedTaskHandle::cancel_task
const PENDING: u8 = 0;

/// Set once the runner has started invoking the body.
///
/// Once set can't be unset. The body may still be running when another thread observes it.
const RAN: u8 = 1;

/// Set if the task will never run.
///
/// A task becomes cancelled when:
///
/// 1. It gets cancelled through its handle before it starts running.
/// 2. The wrapped task is destroyed without running (rejected post, runner shutdown).
///
/// Once set can't be unset.
const CANCELLED: u8 = 2;

#[must_use]
pub(super) enum TransitionToRan {
    /// Won the race, the body must run.
    Run,
    /// Already cancelled, the body must be dropped unrun.
    Skip,
}

#[must_use]
pub(super) enum TransitionToCancelled {
    Cancelled,
    /// The task already ran, is running, or was already cancelled.
    DoNothing,
}

/// Current state value
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot(u8);

impl Snapshot {
    pub(crate) fn is_pending(self) -> bool {
        self.0 == PENDING
    }

    pub(crate) fn is_ran(self) -> bool {
        self.0 == RAN
    }

    pub(crate) fn is_cancelled(self) -> bool {
        self.0 == CANCELLED
    }
}

pub(crate) struct State(AtomicU8);

impl State {
    pub(crate) fn new() -> Self {
        State(AtomicU8::new(PENDING))
    }

    /// Loads the current state into a new Snapshot
    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.0.load(Ordering::Acquire))
    }

    /// Single decision point for both parties. Only succeeds out of `PENDING`.
    fn settle(&self, to: u8) -> Result<Snapshot, Snapshot> {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .map(Snapshot)
            .map_err(Snapshot)
    }

    /// Transitions `PENDING` -> `RAN`. Called by the runner before invoking the body.
    pub(super) fn transition_to_ran(&self) -> TransitionToRan {
        match self.settle(RAN) {
            Ok(_) => TransitionToRan::Run,
            Err(actual) => {
                // Nothing but a cancel can beat the runner, a task is only dispatched once
                debug_assert!(actual.is_cancelled());
                TransitionToRan::Skip
            }
        }
    }

    /// Transitions `PENDING` -> `CANCELLED`. Called from the handle.
    pub(super) fn transition_to_cancelled(&self) -> TransitionToCancelled {
        match self.settle(CANCELLED) {
            Ok(_) => TransitionToCancelled::Cancelled,
            Err(_) => TransitionToCancelled::DoNothing,
        }
    }

    /// The wrapped task was destroyed without running.
    pub(super) fn abandon(&self) {
        let _ = self.settle(CANCELLED);
    }
}

impl fmt::Debug for State {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.load();
        snapshot.fmt(fmt)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.is_pending() {
            "Pending"
        } else if self.is_ran() {
            "Ran"
        } else {
            "Cancelled"
        };
        fmt.write_str(name)
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use super::{State, TransitionToCancelled, TransitionToRan};

    #[test]
    fn ran_is_terminal() {
        let state = State::new();
        assert!(matches!(state.transition_to_ran(), TransitionToRan::Run));
        assert!(state.load().is_ran());
        assert!(matches!(
            state.transition_to_cancelled(),
            TransitionToCancelled::DoNothing
        ));
        assert!(state.load().is_ran());
    }

    #[test]
    fn cancelled_is_terminal() {
        let state = State::new();
        assert!(matches!(
            state.transition_to_cancelled(),
            TransitionToCancelled::Cancelled
        ));
        assert!(matches!(
            state.transition_to_cancelled(),
            TransitionToCancelled::DoNothing
        ));
        assert!(matches!(state.transition_to_ran(), TransitionToRan::Skip));
        assert!(state.load().is_cancelled());
    }

    #[test]
    fn abandon_does_not_override_ran() {
        let state = State::new();
        let _ = state.transition_to_ran();
        state.abandon();
        assert!(state.load().is_ran());
    }

    #[test]
    fn race_has_exactly_one_winner() {
        for _ in 0..200 {
            let state = Arc::new(State::new());
            let barrier = Arc::new(Barrier::new(2));

            let runner = {
                let state = state.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    matches!(state.transition_to_ran(), TransitionToRan::Run)
                })
            };

            barrier.wait();
            let cancelled = matches!(
                state.transition_to_cancelled(),
                TransitionToCancelled::Cancelled
            );
            let ran = runner.join().unwrap();

            assert!(ran ^ cancelled);
            assert!(!state.load().is_pending());
        }
    }
}
