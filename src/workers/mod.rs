//! Worker back-ends.
//!
//! Every back-end implements [`Worker`]: run one task and report a [`Status`], stop
//! gracefully, or crash and hand back whatever was in flight.
//!
//! | back-end | where the call runs | transport |
//! |---|---|---|
//! | [`InLoopWorker`] | the scheduler's own runtime | none |
//! | [`ThreadWorker`] | one dedicated OS thread | job channel + oneshot reply |
//! | [`ProcessWorker`] | a child process | NDJSON over a byte stream |
//!
//! Each back-end serializes its calls with a [`PriorityLock`](crate::sync::PriorityLock), so at
//! most one task is in flight per worker and rushed tasks take the VIP lane.

mod local;
mod process;
mod thread;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::Outcome;
use crate::iteration::SequenceSource;
use crate::tasks::{Series, TaskRef, ValueIter};

pub use local::InLoopWorker;
pub use process::{Envelope, ProcessWorker, Request, Response, WorkerServer};
pub use thread::ThreadWorker;

/// Outcome vocabulary shared by all back-ends.
pub enum Status {
    Value(Value),
    None,
    /// Formatted error text from the worker side.
    Error(String),
    /// A lazy sequence still held by the worker.
    Sequence(Box<dyn SequenceSource>),
    /// A value that crossed the transport in pieces and was reassembled.
    Chunked(Value),
    TimedOut,
    Disconnected,
}

impl Status {
    /// Converts a runner outcome, wrapping a sequence with the back-end's own source.
    pub fn from_outcome(outcome: Outcome, wrap: impl FnOnce(ValueIter) -> Status) -> Status {
        match outcome {
            Outcome::Value(v) => Status::Value(v),
            Outcome::None => Status::None,
            Outcome::Error(text) => Status::Error(text),
            Outcome::Sequence(iter) => wrap(iter),
        }
    }

    /// Stable snake_case label.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Value(_) => "value",
            Status::None => "none",
            Status::Error(_) => "error",
            Status::Sequence(_) => "sequence",
            Status::Chunked(_) => "chunked",
            Status::TimedOut => "timed_out",
            Status::Disconnected => "disconnected",
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Status::Chunked(v) => f.debug_tuple("Chunked").field(v).finish(),
            Status::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Status::Sequence(_) => f.write_str("Sequence(..)"),
            Status::None => f.write_str("None"),
            Status::TimedOut => f.write_str("TimedOut"),
            Status::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// One execution back-end.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Name for logs and events.
    fn name(&self) -> &str;

    /// Series this worker accepts. Empty means any task.
    fn qualifications(&self) -> Vec<Series> {
        Vec::new()
    }

    /// Runs one task to a [`Status`]. Never fails; failures are statuses.
    async fn run(&self, task: TaskRef) -> Status;

    /// Waits for in-flight work and live sequences, then ends the transport.
    async fn stop(&self);

    /// Tears the transport down at once and returns the tasks that were in flight.
    async fn crash(&self) -> Vec<TaskRef>;
}

/// Tasks currently inside `run`, for [`Worker::crash`].
#[derive(Default)]
pub(crate) struct InFlight {
    tasks: std::sync::Mutex<Vec<TaskRef>>,
}

impl InFlight {
    pub(crate) fn enter(&self, task: &TaskRef) -> InFlightGuard<'_> {
        self.lock().push(TaskRef::clone(task));
        InFlightGuard {
            set: self,
            id: std::sync::Arc::as_ptr(task) as usize,
        }
    }

    pub(crate) fn drain(&self) -> Vec<TaskRef> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TaskRef>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub(crate) struct InFlightGuard<'a> {
    set: &'a InFlight,
    id: usize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut tasks = self.set.lock();
        if let Some(i) = tasks
            .iter()
            .position(|t| std::sync::Arc::as_ptr(t) as usize == self.id)
        {
            tasks.swap_remove(i);
        }
    }
}
