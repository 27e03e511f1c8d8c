use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::{
    current::{self, SequenceContext, SequenceId},
    queue::{
        push_locked, run_time_after, Nestable, PendingTask, SequenceQueue, DEFAULT_TASK_QUEUE_SIZE,
    },
    run_pending,
};
use crate::{
    runner::{DelayPolicy, SequencedTaskRunner},
    task::Task,
    time::{default_tick_clock, TickClock},
};

/// How early a flexible task may run by default.
pub const DEFAULT_LEEWAY: Duration = Duration::from_millis(8);

/// Options for a [`SequenceThread`].
pub struct SequenceThreadBuilder {
    name: Option<String>,
    queue_capacity: usize,
    leeway: Duration,
    clock: Arc<dyn TickClock>,
}

impl Default for SequenceThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceThreadBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            queue_capacity: DEFAULT_TASK_QUEUE_SIZE,
            leeway: DEFAULT_LEEWAY,
            clock: default_tick_clock(),
        }
    }

    /// Name of the OS thread. Defaults to the sequence id.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Clock the deadlines are measured against. A clock that does not follow real time has to be
    /// paired with [`ThreadTaskRunner::wake_up`] after each change.
    pub fn clock(mut self, clock: Arc<dyn TickClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> io::Result<SequenceThread> {
        let sequence = SequenceId::next();
        let runner = Arc::new(ThreadTaskRunner {
            sequence,
            clock: self.clock,
            queue: Mutex::new(SequenceQueue::new_with_capacity(
                self.queue_capacity,
                self.leeway,
            )),
            wake: Condvar::new(),
        });

        let name = self.name.unwrap_or_else(|| sequence.to_string());
        let worker = runner.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())?;

        Ok(SequenceThread {
            runner,
            join: Some(join),
        })
    }
}

/// An OS thread running the tasks of one sequence.
///
/// Tasks run one at a time, in run-time order. A task that panics is logged and the thread moves
/// on to the next one. The thread stops on [`shutdown`](Self::shutdown) or when this value is
/// dropped; tasks still queued at that point are destroyed without running and every later post
/// returns `false`.
pub struct SequenceThread {
    runner: Arc<ThreadTaskRunner>,
    join: Option<JoinHandle<()>>,
}

impl SequenceThread {
    /// Spawns a thread with default options.
    pub fn new() -> io::Result<Self> {
        SequenceThreadBuilder::new().spawn()
    }

    pub fn builder() -> SequenceThreadBuilder {
        SequenceThreadBuilder::new()
    }

    pub fn task_runner(&self) -> Arc<ThreadTaskRunner> {
        self.runner.clone()
    }

    pub fn sequence(&self) -> SequenceId {
        self.runner.sequence
    }

    /// Stops the thread and waits for it to exit.
    ///
    /// A task already running is allowed to finish. When called from the thread itself, the thread
    /// stops after the current task but is not waited for.
    pub fn shutdown(&mut self) {
        self.runner.close();

        let join = match self.join.take() {
            Some(join) => join,
            None => return,
        };

        if self.runner.runs_tasks_in_current_sequence() {
            tracing::debug!(sequence = %self.runner.sequence, "shutdown from own sequence, detaching");
            return;
        }

        if join.join().is_err() {
            tracing::error!(sequence = %self.runner.sequence, "sequence thread panicked");
        }
    }
}

impl Drop for SequenceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The [`SequencedTaskRunner`] of a [`SequenceThread`].
pub struct ThreadTaskRunner {
    sequence: SequenceId,
    clock: Arc<dyn TickClock>,
    queue: Mutex<SequenceQueue>,
    wake: Condvar,
}

impl ThreadTaskRunner {
    pub fn sequence(&self) -> SequenceId {
        self.sequence
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

        let posted = push_locked(&self.queue, pending);
        if posted {
            self.wake.notify_one();
        }
        posted
    }

    fn post_after(&self, task: Task, delay: Duration, nestable: Nestable) -> bool {
        let now = self.clock.now_ticks();
        let run_time = run_time_after(now, delay);
        self.post_at(task, now, run_time, DelayPolicy::Precise, nestable)
    }

    /// Makes the thread re-check its queue against the clock.
    ///
    /// Only needed with a clock injected through [`SequenceThreadBuilder::clock`] that is advanced
    /// by hand: the thread otherwise sleeps for the delay it saw last.
    pub fn wake_up(&self) {
        let _queue = self.queue.lock();
        self.wake.notify_all();
    }

    fn close(&self) {
        self.queue.lock().close();
        self.wake.notify_all();
    }

    /// Blocks until a task is ready or the sequence is closed.
    fn next_task(&self) -> Option<PendingTask> {
        let mut queue = self.queue.lock();
        loop {
            if queue.is_shut_down() {
                return None;
            }

            if let Some(pending) = queue.pop_ready(self.clock.now_ticks(), false) {
                return Some(pending);
            }

            // Wake times are on `self.clock`, which need not follow real time
            match queue.next_wake_time(false) {
                Some(wake_time) => {
                    let timeout = wake_time.saturating_duration_since(self.clock.now_ticks());
                    let _ = self.wake.wait_for(&mut queue, timeout);
                }
                None => self.wake.wait(&mut queue),
            }
        }
    }

    fn run(self: Arc<Self>) {
        let context = SequenceContext::new(self.sequence, self.clone());
        tracing::debug!(sequence = %self.sequence, "sequence thread started");

        while let Some(pending) = self.next_task() {
            let location = pending.task.location();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_pending(&context, &*self.clock, pending)
            }));

            if result.is_err() {
                tracing::error!(sequence = %self.sequence, %location, "task panicked");
            }
        }

        // Destroyed on the sequence they belong to. Nothing runs.
        let discarded = self.queue.lock().drain();
        tracing::debug!(
            sequence = %self.sequence,
            discarded = discarded.len(),
            "sequence thread stopped"
        );
        context.enter(|| drop(discarded));
    }
}

impl SequencedTaskRunner for ThreadTaskRunner {
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
        let now = self.clock.now_ticks();
        let run_time = delayed_run_time.unwrap_or(now);
        self.post_at(task, now, run_time, delay_policy, Nestable::Nestable)
    }
}
