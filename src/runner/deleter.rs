//! Destruction policies for owned objects.
//!
//! [`OwnedBox`] is an owning pointer whose destruction is delegated to a [`Deleter`]. With
//! [`SequenceBoundDeleter`] the pointee is always destroyed on the sequence it belongs to, in
//! posted order, never inline.
use std::{
    fmt,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::Arc,
};

use super::{SequencedTaskRunner, SequencedTaskRunnerExt};

/// Policy deciding how an [`OwnedBox`] disposes of its pointee.
pub trait Deleter<T: ?Sized> {
    fn delete(&mut self, object: Box<T>);
}

/// Drops the object in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDelete;

impl<T: ?Sized> Deleter<T> for DefaultDelete {
    fn delete(&mut self, object: Box<T>) {
        drop(object)
    }
}

/// Posts the destruction of an object to the sequence of a [`SequencedTaskRunner`].
///
/// The deleter is move-only. A default-constructed (unbound) deleter must never be invoked, and
/// one that was [`take`](Self::take)n from is unbound as well.
#[derive(Default)]
pub struct SequenceBoundDeleter {
    runner: Option<Arc<dyn SequencedTaskRunner>>,
}

impl SequenceBoundDeleter {
    pub fn new(runner: Arc<dyn SequencedTaskRunner>) -> Self {
        Self {
            runner: Some(runner),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.runner.is_some()
    }

    /// Transfers the runner reference into a new deleter, leaving this one unbound.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Posts a non-nestable task destroying `object` on the bound sequence.
    ///
    /// Best effort: if the runner has shut down the object is leaked.
    ///
    /// # Panics
    ///
    /// Panics if the deleter is unbound.
    #[track_caller]
    pub fn delete_on_sequence<T>(&self, object: Box<T>)
    where
        T: ?Sized + Send + 'static,
    {
        let runner = match &self.runner {
            Some(runner) => runner,
            None => panic!("SequenceBoundDeleter invoked without a task runner"),
        };

        let location = Location::caller();
        if !runner.delete_soon(object) {
            tracing::trace!(%location, "sequence has shut down, leaking object");
        }
    }
}

impl<T> Deleter<T> for SequenceBoundDeleter
where
    T: ?Sized + Send + 'static,
{
    #[track_caller]
    fn delete(&mut self, object: Box<T>) {
        self.delete_on_sequence(object)
    }
}

impl fmt::Debug for SequenceBoundDeleter {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SequenceBoundDeleter")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// An owning pointer that hands its pointee to a [`Deleter`] when dropped.
pub struct OwnedBox<T, D = DefaultDelete>
where
    T: ?Sized,
    D: Deleter<T>,
{
    object: Option<Box<T>>,
    deleter: D,
}

impl<T> OwnedBox<T>
where
    T: ?Sized,
{
    pub fn new(object: Box<T>) -> Self {
        Self::with_deleter(object, DefaultDelete)
    }
}

impl<T> OwnedBox<T, SequenceBoundDeleter>
where
    T: ?Sized + Send + 'static,
{
    /// Owns `object`, destroying it on `runner`'s sequence.
    pub fn on_sequence(object: Box<T>, runner: Arc<dyn SequencedTaskRunner>) -> Self {
        Self::with_deleter(object, SequenceBoundDeleter::new(runner))
    }
}

impl<T, D> OwnedBox<T, D>
where
    T: ?Sized,
    D: Deleter<T>,
{
    pub fn with_deleter(object: Box<T>, deleter: D) -> Self {
        Self {
            object: Some(object),
            deleter,
        }
    }

    pub fn deleter(&self) -> &D {
        &self.deleter
    }

    /// Gives up ownership without running the deleter.
    pub fn release(mut self) -> Box<T> {
        // Empty now, so dropping `self` skips the deleter
        match self.object.take() {
            Some(object) => object,
            None => unreachable!("OwnedBox always holds its object until dropped"),
        }
    }

    /// Replaces the pointee, handing the previous one to the deleter.
    pub fn reset(&mut self, object: Box<T>) {
        if let Some(previous) = self.object.replace(object) {
            self.deleter.delete(previous);
        }
    }
}

impl<T, D> Deref for OwnedBox<T, D>
where
    T: ?Sized,
    D: Deleter<T>,
{
    type Target = T;

    fn deref(&self) -> &T {
        match &self.object {
            Some(object) => object,
            None => unreachable!("OwnedBox always holds its object until dropped"),
        }
    }
}

impl<T, D> DerefMut for OwnedBox<T, D>
where
    T: ?Sized,
    D: Deleter<T>,
{
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("OwnedBox always holds its object until dropped"),
        }
    }
}

impl<T, D> Drop for OwnedBox<T, D>
where
    T: ?Sized,
    D: Deleter<T>,
{
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.deleter.delete(object);
        }
    }
}

impl<T, D> fmt::Debug for OwnedBox<T, D>
where
    T: ?Sized + fmt::Debug,
    D: Deleter<T> + fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("OwnedBox")
            .field("object", &&**self)
            .field("deleter", &self.deleter)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc,
        },
        thread,
    };

    use super::{Deleter, OwnedBox, SequenceBoundDeleter};
    use crate::{
        executor::test_runner::TestTaskRunner, runner::SequencedTaskRunner, task::Task,
    };

    struct Tracked {
        drops: Arc<AtomicUsize>,
        on_sequence: Option<Arc<TestTaskRunner>>,
        dropped_on_sequence: Arc<AtomicBool>,
    }

    impl Tracked {
        fn new(drops: &Arc<AtomicUsize>) -> Self {
            Self {
                drops: drops.clone(),
                on_sequence: None,
                dropped_on_sequence: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            if let Some(runner) = &self.on_sequence {
                self.dropped_on_sequence
                    .store(runner.runs_tasks_in_current_sequence(), Ordering::SeqCst);
            }
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destruction_is_posted_not_inline() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let mut object = Tracked::new(&drops);
        object.on_sequence = Some(runner.clone());
        let dropped_on_sequence = object.dropped_on_sequence.clone();

        let owned = OwnedBox::on_sequence(Box::new(object), runner.clone());
        drop(owned);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        runner.run_until_idle();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(dropped_on_sequence.load(Ordering::SeqCst));
    }

    #[test]
    fn destruction_from_own_sequence_is_still_posted() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(usize::MAX));

        let owned = OwnedBox::on_sequence(Box::new(Tracked::new(&drops)), runner.clone());
        let (d, o) = (drops.clone(), observed.clone());
        runner.post_task(Task::new(move || {
            drop(owned);
            o.store(d.load(Ordering::SeqCst), Ordering::SeqCst);
        }));

        runner.run_until_idle();
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destruction_follows_already_posted_work() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let seen_before = Arc::new(AtomicUsize::new(usize::MAX));

        let (d, s) = (drops.clone(), seen_before.clone());
        runner.post_task(Task::new(move || s.store(d.load(Ordering::SeqCst), Ordering::SeqCst)));
        drop(OwnedBox::on_sequence(
            Box::new(Tracked::new(&drops)),
            runner.clone(),
        ));

        runner.run_until_idle();
        assert_eq!(seen_before.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shut_down_sequence_leaks() {
        let runner = TestTaskRunner::new();
        runner.shutdown();
        let drops = Arc::new(AtomicUsize::new(0));

        drop(OwnedBox::on_sequence(
            Box::new(Tracked::new(&drops)),
            runner.clone(),
        ));
        runner.run_until_idle();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn taken_from_deleter_is_unbound() {
        let runner = TestTaskRunner::new();
        let mut deleter = SequenceBoundDeleter::new(runner.clone());

        let moved = deleter.take();
        assert!(!deleter.is_bound());
        assert!(moved.is_bound());
    }

    #[test]
    fn taken_from_deleter_posts_nothing() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let mut deleter = SequenceBoundDeleter::new(runner.clone());
        let mut moved = deleter.take();

        let object = Box::new(Tracked::new(&drops));
        let result = panic::catch_unwind(AssertUnwindSafe(|| deleter.delete(object)));
        assert!(result.is_err());
        assert_eq!(runner.pending_task_count(), 0);

        moved.delete(Box::new(Tracked::new(&drops)));
        assert_eq!(runner.pending_task_count(), 1);

        runner.run_until_idle();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "without a task runner")]
    fn unbound_deleter_panics() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut deleter = SequenceBoundDeleter::default();
        deleter.delete(Box::new(Tracked::new(&drops)));
    }

    #[test]
    fn release_skips_the_deleter() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let owned = OwnedBox::on_sequence(Box::new(Tracked::new(&drops)), runner.clone());
        let object = owned.release();
        assert_eq!(runner.pending_task_count(), 0);

        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_deletes_previous_object() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut owned = OwnedBox::new(Box::new(Tracked::new(&drops)));

        owned.reset(Box::new(Tracked::new(&drops)));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(owned);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deleter_crosses_threads() {
        let runner = TestTaskRunner::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let owned = OwnedBox::on_sequence(Box::new(Tracked::new(&drops)), runner.clone());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            drop(owned);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        runner.run_until_idle();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
