#[macro_use(defer)]
extern crate scopeguard;

pub mod executor;
pub mod runner;
pub mod task;
pub mod time;

pub use executor::{
    current::{current_default, has_current_default, SequenceId},
    thread::{SequenceThread, SequenceThreadBuilder, ThreadTaskRunner},
    test_runner::TestTaskRunner,
};
pub use runner::{
    deleter::{DefaultDelete, Deleter, OwnedBox, SequenceBoundDeleter},
    DelayPolicy, SequencedTaskRunner, SequencedTaskRunnerExt,
};
pub use task::{
    handle::{CancellationDelegate, DelayedTaskHandle},
    Task,
};
pub use time::{DefaultTickClock, MockTickClock, TickClock};
