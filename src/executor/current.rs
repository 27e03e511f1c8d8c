use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::runner::SequencedTaskRunner;

scoped_tls::scoped_thread_local!(static CURRENT: SequenceContext);

static ID_GEN: AtomicUsize = AtomicUsize::new(1);

/// Identity of a sequence. Two runners share a sequence only if they share this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceId(usize);

impl SequenceId {
    /// Generate sequence id.
    pub(crate) fn next() -> Self {
        SequenceId(ID_GEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "seq-{}", self.0)
    }
}

/// What a thread is running on behalf of, while it runs a task.
pub(crate) struct SequenceContext {
    sequence: SequenceId,
    runner: Arc<dyn SequencedTaskRunner>,
}

impl SequenceContext {
    pub(crate) fn new(sequence: SequenceId, runner: Arc<dyn SequencedTaskRunner>) -> Self {
        Self { sequence, runner }
    }

    pub(crate) fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Runs `f` with this context installed. Nests: the previous context is restored on return.
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.set(self, f)
    }
}

/// Returns `true` if the innermost task running on this thread belongs to `sequence`.
pub(crate) fn is_current(sequence: SequenceId) -> bool {
    CURRENT.is_set() && CURRENT.with(|ctx| ctx.sequence == sequence)
}

/// The runner of the sequence whose task is running on the calling thread, if any.
pub fn current_default() -> Option<Arc<dyn SequencedTaskRunner>> {
    if CURRENT.is_set() {
        Some(CURRENT.with(|ctx| ctx.runner.clone()))
    } else {
        None
    }
}

pub fn has_current_default() -> bool {
    CURRENT.is_set()
}
