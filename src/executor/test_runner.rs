use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::{
    current::{self, SequenceContext, SequenceId},
    queue::{push_locked, run_time_after, Nestable, PendingTask, SequenceQueue},
    run_pending,
};
use crate::{
    runner::{DelayPolicy, SequencedTaskRunner},
    task::Task,
    time::{MockTickClock, TickClock},
};

/// A runner that only runs tasks when told to, on the thread telling it, against a mock clock.
///
/// Time never passes on its own: delayed tasks become ready as [`fast_forward_by`] advances the
/// clock. Calling [`run_until_idle`] from inside one of this runner's own tasks spins a nested run
/// loop, in which only nestable tasks run.
///
/// Only one thread may drive the runner at a time. Posting is allowed from anywhere.
///
/// [`fast_forward_by`]: Self::fast_forward_by
/// [`run_until_idle`]: Self::run_until_idle
pub struct TestTaskRunner {
    sequence: SequenceId,
    clock: Arc<MockTickClock>,
    queue: Mutex<SequenceQueue>,
    driving: AtomicBool,
}

impl TestTaskRunner {
    pub fn new() -> Arc<Self> {
        Self::with_leeway(Duration::ZERO)
    }

    /// A runner that lets flexible tasks run up to `leeway` before their deadline.
    pub fn with_leeway(leeway: Duration) -> Arc<Self> {
        Arc::new(Self {
            sequence: SequenceId::next(),
            clock: Arc::new(MockTickClock::new()),
            queue: Mutex::new(SequenceQueue::new(leeway)),
            driving: AtomicBool::new(false),
        })
    }

    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    pub fn mock_clock(&self) -> &Arc<MockTickClock> {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now_ticks()
    }

    pub fn pending_task_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn has_pending_task(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Delay until the next pending task is due, zero if one is due already.
    pub fn next_pending_task_delay(&self) -> Option<Duration> {
        let now = self.now();
        self.queue
            .lock()
            .next_run_time()
            .map(|run_time| run_time.saturating_duration_since(now))
    }

    /// Runs every task that is ready at the current mock time, including tasks they post, until
    /// none is left.
    ///
    /// # Panics
    ///
    /// Panics if another thread is driving the runner.
    pub fn run_until_idle(self: &Arc<Self>) {
        let nested = current::is_current(self.sequence);
        if !nested {
            let claimed = self
                .driving
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            assert!(claimed, "TestTaskRunner is already being driven by another thread");
        }

        defer! {
            if !nested {
                self.driving.store(false, Ordering::Release);
            }
        }

        let context = SequenceContext::new(self.sequence, self.clone());
        loop {
            let now = self.clock.now_ticks();
            // Lock released before the task runs
            let next = self.queue.lock().pop_ready(now, nested);
            match next {
                Some(pending) => run_pending(&context, &*self.clock, pending),
                None => break,
            }
        }
    }

    /// Advances the mock clock by `delta`, running each delayed task when its time comes.
    pub fn fast_forward_by(self: &Arc<Self>, delta: Duration) {
        let target = run_time_after(self.now(), delta);
        let nested = current::is_current(self.sequence);

        loop {
            self.run_until_idle();

            let now = self.now();
            let next = self.queue.lock().next_wake_time(nested);
            match next {
                Some(wake_time) if wake_time > now && wake_time <= target => {
                    self.clock.advance_to(wake_time)
                }
                _ => break,
            }
        }

        self.clock.advance_to(target);
        self.run_until_idle();
    }

    /// Destroys every pending task without running it and rejects later posts.
    pub fn shutdown(&self) {
        let discarded = {
            let mut queue = self.queue.lock();
            queue.close();
            queue.drain()
        };

        tracing::debug!(
            sequence = %self.sequence,
            discarded = discarded.len(),
            "test task runner shut down"
        );
        drop(discarded);
    }

    fn post_at(
        &self,
        task: Task,
        now: Instant,
        run_time: Instant,
        delay_policy: DelayPolicy,
        nestable: Nestable,
    ) -> bool {
        let pending = PendingTask::new(task, now, run_time, delay_policy, nestable);
        push_locked(&self.queue, pending)
    }

    fn post_after(&self, task: Task, delay: Duration, nestable: Nestable) -> bool {
        let now = self.now();
        self.post_at(
            task,
            now,
            run_time_after(now, delay),
            DelayPolicy::Precise,
            nestable,
        )
    }
}

impl SequencedTaskRunner for TestTaskRunner {
    fn post_delayed_task(&self, task: Task, delay: Duration) -> bool {
        self.post_after(task, delay, Nestable::Nestable)
    }

    fn post_non_nestable_delayed_task(&self, task: Task, delay: Duration) -> bool {
        self.post_after(task, delay, Nestable::NonNestable)
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        current::is_current(self.sequence)
    }

    fn clock(&self) -> Arc<dyn TickClock> {
        self.clock.clone()
    }

    fn post_delayed_task_at(
        &self,
        task: Task,
        delayed_run_time: Option<Instant>,
        delay_policy: DelayPolicy,
    ) -> bool {
        let now = self.now();
        self.post_at(
            task,
            now,
            delayed_run_time.unwrap_or(now),
            delay_policy,
            Nestable::Nestable,
        )
    }
}
