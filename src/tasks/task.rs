//! # Submitted task and its result future.
//!
//! A [`Task`] is created by the scheduler on submission and shared as a [`TaskRef`]
//! between the heap, the worker that runs it and the result loop. Its priority key is
//! fixed at enqueue time; only rush/relax may change it before a retry.
//!
//! ## Retries
//! A retry never re-runs the same `Task`. [`Task::retry`] builds a fresh child task that
//! owns its own result channel and marks the parent superseded. The scheduler forwards
//! the child's result into the parent, so ownership stays one-directional:
//!
//! ```text
//! caller ◄── TaskFuture(parent) ◄── forward ◄── TaskFuture(child) ◄── worker
//! ```
//!
//! A superseded task ignores late results from its own earlier attempt.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::Priority;
use crate::error::TaskError;
use crate::iteration::{AsyncSequence, Consumer};
use crate::policies::{FailurePolicy, Niceness};
use crate::tasks::{Call, Series};

/// Global counter for task ids.
static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Final result of a task, as delivered to its caller.
pub type TaskResult = Result<TaskOutput, TaskError>;

/// Shared handle to a task.
pub type TaskRef = Arc<Task>;

/// Successful outcomes of a task.
#[derive(Debug)]
pub enum TaskOutput {
    /// The callable returned a value (possibly reassembled from chunks).
    Value(Value),
    /// The callable returned nothing.
    None,
    /// The callable returned a lazy sequence; drain it with [`AsyncSequence::next`].
    Sequence(AsyncSequence),
    /// The sequence was pushed into the task's consumer; `items` were delivered.
    Done {
        /// Number of items written to the consumer.
        items: usize,
    },
    /// The callable failed and the failure policy does not return typed failures;
    /// this is the formatted error text.
    Error(String),
}

impl TaskOutput {
    /// Borrows the value, if this is [`TaskOutput::Value`].
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TaskOutput::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Takes the value, if this is [`TaskOutput::Value`].
    pub fn into_value(self) -> Option<Value> {
        match self {
            TaskOutput::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Takes the sequence, if this is [`TaskOutput::Sequence`].
    pub fn into_sequence(self) -> Option<AsyncSequence> {
        match self {
            TaskOutput::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the call returned nothing.
    pub fn is_none(&self) -> bool {
        matches!(self, TaskOutput::None)
    }
}

struct Settlement {
    done: Option<oneshot::Sender<TaskResult>>,
    superseded: bool,
}

/// One unit of submitted work.
pub struct Task {
    id: u64,
    call: Call,
    series: Option<Series>,
    niceness: Niceness,
    timeout: Option<Duration>,
    failure: Option<FailurePolicy>,
    consumer: Option<Arc<dyn Consumer>>,
    priority: Mutex<Priority>,
    attempt: u32,
    timeouts: u32,
    root: bool,
    settlement: Mutex<Settlement>,
}

/// Everything needed to build a root task.
pub(crate) struct TaskParts {
    pub call: Call,
    pub series: Option<Series>,
    pub niceness: Niceness,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub failure: Option<FailurePolicy>,
    pub consumer: Option<Arc<dyn Consumer>>,
}

impl Task {
    pub(crate) fn create(parts: TaskParts) -> (TaskRef, TaskFuture) {
        let (tx, rx) = oneshot::channel();
        let task = Task {
            id: TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            call: parts.call,
            series: parts.series,
            niceness: parts.niceness,
            timeout: parts.timeout,
            failure: parts.failure,
            consumer: parts.consumer,
            priority: Mutex::new(parts.priority),
            attempt: 1,
            timeouts: 0,
            root: true,
            settlement: Mutex::new(Settlement {
                done: Some(tx),
                superseded: false,
            }),
        };
        (Arc::new(task), TaskFuture { rx })
    }

    /// A task that never enters the heap (worker updates).
    pub(crate) fn detached(call: Call) -> (TaskRef, TaskFuture) {
        Self::create(TaskParts {
            call,
            series: None,
            niceness: Niceness::NORMAL,
            priority: Priority::RUSH,
            timeout: None,
            failure: None,
            consumer: None,
        })
    }

    /// Builds the next attempt under `priority` and supersedes `self`.
    /// `timed_out` records that the attempt being replaced hit its timeout.
    pub(crate) fn retry(self: &Arc<Self>, priority: Priority, timed_out: bool) -> (TaskRef, TaskFuture) {
        self.settlement().superseded = true;
        let (tx, rx) = oneshot::channel();
        let child = Task {
            id: self.id,
            call: self.call.clone(),
            series: self.series.clone(),
            niceness: self.niceness,
            timeout: self.timeout,
            failure: self.failure,
            consumer: self.consumer.clone(),
            priority: Mutex::new(priority),
            attempt: self.attempt + 1,
            timeouts: self.timeouts + u32::from(timed_out),
            root: false,
            settlement: Mutex::new(Settlement {
                done: Some(tx),
                superseded: false,
            }),
        };
        (Arc::new(child), TaskFuture { rx })
    }

    fn settlement(&self) -> MutexGuard<'_, Settlement> {
        self.settlement.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the result of this attempt. Ignored (returns `false`) when already
    /// settled or superseded by a retry.
    pub(crate) fn finish(&self, result: TaskResult) -> bool {
        let mut s = self.settlement();
        if s.superseded {
            return false;
        }
        Self::deliver(&mut s, result)
    }

    /// Delivers a result forwarded from a retry of this task.
    pub(crate) fn finish_forwarded(&self, result: TaskResult) -> bool {
        Self::deliver(&mut self.settlement(), result)
    }

    fn deliver(s: &mut Settlement, result: TaskResult) -> bool {
        match s.done.take() {
            Some(tx) => {
                // Caller may have dropped its future; the task still counts as settled.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Still waiting for a result from its current attempt.
    pub fn is_live(&self) -> bool {
        let s = self.settlement();
        !s.superseded && s.done.is_some()
    }

    /// Process-unique id, shared by every attempt of the same submission.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the callable.
    pub fn name(&self) -> &str {
        self.call.name()
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn series(&self) -> Option<&Series> {
        self.series.as_ref()
    }

    pub fn niceness(&self) -> Niceness {
        self.niceness
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-task override of the scheduler's failure policy.
    pub fn failure_policy(&self) -> Option<FailurePolicy> {
        self.failure
    }

    pub fn consumer(&self) -> Option<&Arc<dyn Consumer>> {
        self.consumer.as_ref()
    }

    /// Current heap key.
    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boosts to the front of the heap for the next enqueue.
    pub fn rush(&self) {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner) = Priority::RUSH;
    }

    /// Drops to the back of the heap for the next enqueue.
    pub fn relax(&self) {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner) = Priority::RELAX;
    }

    /// Rushed tasks take a worker lock's VIP lane.
    pub fn is_rushed(&self) -> bool {
        self.priority() == Priority::RUSH
    }

    /// 1 for the original submission, +1 per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// How many earlier attempts of this submission timed out.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Whether this is the submission itself rather than a retry.
    pub fn is_root(&self) -> bool {
        self.root
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("series", &self.series)
            .field("priority", &self.priority())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Resolves with the task's final result.
#[must_use = "the result of a task is only observable through its future"]
pub struct TaskFuture {
    rx: oneshot::Receiver<TaskResult>,
}

impl Future for TaskFuture {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TaskError::Abandoned)))
    }
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFuture(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Callable, Output};

    fn parts() -> TaskParts {
        TaskParts {
            call: Call::new(Callable::new("noop", |_, _| Ok(Output::none()))),
            series: Some(Series::from("s")),
            niceness: Niceness::NORMAL,
            priority: Priority(3.0),
            timeout: None,
            failure: None,
            consumer: None,
        }
    }

    #[tokio::test]
    async fn finish_resolves_once() {
        let (task, fut) = Task::create(parts());
        assert!(task.is_live());
        assert!(task.finish(Ok(TaskOutput::None)));
        assert!(!task.finish(Ok(TaskOutput::Value(Value::Null))));
        assert!(fut.await.unwrap().is_none());
        assert!(!task.is_live());
    }

    #[tokio::test]
    async fn retry_supersedes_parent() {
        let (task, fut) = Task::create(TaskParts {
            failure: Some(FailurePolicy::Return),
            ..parts()
        });
        let (child, child_fut) = task.retry(Priority::RUSH, true);
        assert!(child.is_rushed());
        assert_eq!(child.failure_policy(), Some(FailurePolicy::Return));
        assert_eq!(child.attempt(), 2);
        assert_eq!(child.timeouts(), 1);
        assert!(!child.is_root());
        assert_eq!(child.id(), task.id());

        // A late result for the replaced attempt is ignored...
        assert!(!task.finish(Ok(TaskOutput::None)));
        // ...while the child's result is forwarded.
        assert!(child.finish(Ok(TaskOutput::Value(Value::from(9)))));
        let forwarded = child_fut.await;
        assert!(task.finish_forwarded(forwarded));
        assert_eq!(fut.await.unwrap().into_value(), Some(Value::from(9)));
    }

    #[tokio::test]
    async fn dropped_task_reports_abandoned() {
        let (task, fut) = Task::create(parts());
        drop(task);
        assert_eq!(fut.await.unwrap_err(), TaskError::Abandoned);
    }
}
