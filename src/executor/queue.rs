use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::{runner::DelayPolicy, task::Task};

pub(crate) const DEFAULT_TASK_QUEUE_SIZE: usize = 256;

/// Stand-in deadline for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn run_time_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

new_key_type! {
    pub(crate) struct TaskKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Nestable {
    Nestable,
    NonNestable,
}

/// A task waiting in a sequence, with everything needed to decide when it may run.
#[derive(Debug)]
pub(crate) struct PendingTask {
    pub(crate) task: Task,
    pub(crate) run_time: Instant,
    pub(crate) delay_policy: DelayPolicy,
    pub(crate) nestable: Nestable,
    pub(crate) posted_at: Instant,
}

impl PendingTask {
    /// `run_time` earlier than `now` is clamped to `now`.
    pub(crate) fn new(
        task: Task,
        now: Instant,
        run_time: Instant,
        delay_policy: DelayPolicy,
        nestable: Nestable,
    ) -> Self {
        Self {
            task,
            run_time: run_time.max(now),
            delay_policy,
            nestable,
            posted_at: now,
        }
    }

    /// Earliest moment the task may start. Flexible tasks may start up to `leeway` early.
    fn earliest_run_time(&self, leeway: Duration) -> Instant {
        match self.delay_policy {
            DelayPolicy::Precise => self.run_time,
            DelayPolicy::Flexible => self
                .run_time
                .checked_sub(leeway)
                .unwrap_or(self.run_time)
                .max(self.posted_at),
        }
    }

    fn is_ready(&self, now: Instant, leeway: Duration) -> bool {
        self.earliest_run_time(leeway) <= now
    }
}

/// Ordering key of a queued task: run time, then post order.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    run_time: Instant,
    sequence_num: u64,
    key: TaskKey,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.run_time
            .cmp(&other.run_time)
            .then(self.sequence_num.cmp(&other.sequence_num))
    }
}

/// The pending work of one sequence.
///
/// Tasks live in a slot map; a min-heap of [`QueueEntry`] decides the order they leave in. The
/// queue itself is not synchronized, runners keep it behind a lock and never run a task while
/// holding it.
#[derive(Debug)]
pub(crate) struct SequenceQueue {
    tasks: SlotMap<TaskKey, PendingTask>,
    order: BinaryHeap<Reverse<QueueEntry>>,
    next_sequence_num: u64,
    leeway: Duration,
    shut_down: bool,
}

impl Default for SequenceQueue {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl SequenceQueue {
    pub(crate) fn new(leeway: Duration) -> Self {
        Self::new_with_capacity(DEFAULT_TASK_QUEUE_SIZE, leeway)
    }

    pub(crate) fn new_with_capacity(capacity: usize, leeway: Duration) -> Self {
        Self {
            tasks: SlotMap::with_capacity_and_key(capacity),
            order: BinaryHeap::with_capacity(capacity),
            next_sequence_num: 0,
            leeway,
            shut_down: false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Enqueues `pending`. Hands it back if the queue has shut down.
    pub(crate) fn push(&mut self, pending: PendingTask) -> Result<(), PendingTask> {
        if self.shut_down {
            return Err(pending);
        }

        let run_time = pending.run_time;
        let key = self.tasks.insert(pending);
        let sequence_num = self.next_sequence_num;
        self.next_sequence_num += 1;
        self.order.push(Reverse(QueueEntry {
            run_time,
            sequence_num,
            key,
        }));
        Ok(())
    }

    /// Removes the first task allowed to run at `now`.
    ///
    /// Only the head of the queue is considered, so a flexible task never overtakes an earlier
    /// one. When `nested`, non-nestable tasks are skipped over and keep their place for the next
    /// top-level pop.
    pub(crate) fn pop_ready(&mut self, now: Instant, nested: bool) -> Option<PendingTask> {
        let mut deferred = Vec::new();

        let found = loop {
            let entry = match self.order.peek() {
                Some(&Reverse(entry)) => entry,
                None => break None,
            };

            let pending = &self.tasks[entry.key];
            if !pending.is_ready(now, self.leeway) {
                break None;
            }

            self.order.pop();
            if nested && pending.nestable == Nestable::NonNestable {
                deferred.push(entry);
                continue;
            }

            break self.tasks.remove(entry.key);
        };

        self.order.extend(deferred.into_iter().map(Reverse));
        found
    }

    /// Earliest time at which [`pop_ready`](Self::pop_ready) could return a task.
    ///
    /// When `nested`, non-nestable tasks are never returned but still hold back what follows them
    /// until they are ready themselves.
    pub(crate) fn next_wake_time(&self, nested: bool) -> Option<Instant> {
        if !nested {
            return self
                .order
                .peek()
                .map(|Reverse(entry)| self.tasks[entry.key].earliest_run_time(self.leeway));
        }

        let mut entries: Vec<QueueEntry> = self.order.iter().map(|Reverse(entry)| *entry).collect();
        entries.sort();

        let mut blocked_until: Option<Instant> = None;
        for entry in entries {
            let pending = &self.tasks[entry.key];
            let ready_at = pending.earliest_run_time(self.leeway);
            if pending.nestable == Nestable::Nestable {
                return Some(blocked_until.map_or(ready_at, |blocked| blocked.max(ready_at)));
            }
            blocked_until = Some(blocked_until.map_or(ready_at, |blocked| blocked.max(ready_at)));
        }
        None
    }

    /// Run time of the head of the queue, without leeway.
    pub(crate) fn next_run_time(&self) -> Option<Instant> {
        self.order.peek().map(|Reverse(entry)| entry.run_time)
    }

    /// Rejects every later push.
    pub(crate) fn close(&mut self) {
        self.shut_down = true;
    }

    /// Removes every queued task, in run order.
    pub(crate) fn drain(&mut self) -> Vec<PendingTask> {
        let mut drained = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(entry)) = self.order.pop() {
            if let Some(pending) = self.tasks.remove(entry.key) {
                drained.push(pending);
            }
        }
        drained
    }
}

/// Pushes `pending` onto a locked queue.
///
/// A rejected task is dropped after the lock is released: its destructor may post again.
pub(crate) fn push_locked(queue: &Mutex<SequenceQueue>, pending: PendingTask) -> bool {
    let rejected = match queue.lock().push(pending) {
        Ok(()) => return true,
        Err(rejected) => rejected,
    };

    tracing::trace!(
        location = %rejected.task.location(),
        "post rejected, sequence has shut down"
    );
    drop(rejected);
    false
}
