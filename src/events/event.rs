//! # Runtime events emitted by the scheduler, its roster and its workers.
//!
//! [`EventKind`] groups into:
//! - **Task events**: queued, dispatched, completed, failed, timed out, retried, cancelled
//! - **Worker events**: attached, detached, crashed
//! - **Scheduler events**: load changes, delayed stop, shutdown
//! - **Subscriber events**: panics and overflow inside the fan-out itself
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use workheap::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::TimeoutHit)
//!     .with_task("square")
//!     .with_task_id(7)
//!     .with_attempt(1)
//!     .with_timeout(Duration::from_secs(5));
//!
//! assert_eq!(ev.kind, EventKind::TimeoutHit);
//! assert_eq!(ev.task.as_deref(), Some("square"));
//! assert_eq!(ev.timeout_ms, Some(5000));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::tasks::Task;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Task events ===
    /// Task entered the heap.
    ///
    /// Sets: `task`, `task_id`, `series`, `attempt`.
    TaskQueued,

    /// Task was handed to a worker.
    ///
    /// Sets: `task`, `task_id`, `worker`, `attempt`.
    TaskDispatched,

    /// Task's future was resolved with a success outcome.
    ///
    /// Sets: `task`, `task_id`, `reason` (outcome label).
    TaskCompleted,

    /// The callable failed on a worker.
    ///
    /// Sets: `task`, `task_id`, `worker`, `reason` (error text).
    TaskFailed,

    /// No response within the task's timeout.
    ///
    /// Sets: `task`, `task_id`, `worker`, `attempt`, `timeout_ms`.
    TimeoutHit,

    /// Task re-enqueued after a timeout, a disconnect or a crash.
    ///
    /// Sets: `task`, `task_id`, `attempt` (of the new try), `reason`.
    RetryScheduled,

    /// Task removed from the heap before dispatch.
    ///
    /// Sets: `task`, `task_id`, `series`.
    TaskCancelled,

    // === Worker events ===
    /// Worker joined the roster. Sets: `worker`.
    WorkerAttached,

    /// Worker left the roster after stopping. Sets: `worker`.
    WorkerDetached,

    /// Worker was crashed. Sets: `worker`, `reason`.
    WorkerCrashed,

    // === Scheduler events ===
    /// Count of submitted-but-unresolved tasks changed. Sets: `load`.
    LoadChanged,

    /// A call error scheduled the scheduler to stop. Sets: `delay_ms`, `reason`.
    StopScheduled,

    /// Shutdown began.
    ShutdownRequested,

    /// Shutdown finished. Sets: `reason` (unhandled count).
    ShutdownComplete,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `task` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `task` (subscriber name), `reason` ("full" or "closed").
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Callable name (or subscriber name for subscriber events).
    pub task: Option<Arc<str>>,
    /// Task id, shared by all attempts of one submission.
    pub task_id: Option<u64>,
    /// Series of the task.
    pub series: Option<Arc<str>>,
    /// Worker name.
    pub worker: Option<Arc<str>>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Human-readable reason (errors, outcome labels, overflow details).
    pub reason: Option<Arc<str>>,
    /// Task timeout in milliseconds.
    pub timeout_ms: Option<u32>,
    /// Delay in milliseconds.
    pub delay_ms: Option<u32>,
    /// Submitted-but-unresolved tasks.
    pub load: Option<usize>,
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            task: None,
            task_id: None,
            series: None,
            worker: None,
            attempt: None,
            reason: None,
            timeout_ms: None,
            delay_ms: None,
            load: None,
        }
    }

    /// Event about `task`: name, id, series and attempt filled in.
    pub(crate) fn for_task(kind: EventKind, task: &Task) -> Self {
        let ev = Event::new(kind)
            .with_task(task.name())
            .with_task_id(task.id())
            .with_attempt(task.attempt());
        match task.series() {
            Some(s) => ev.with_series(s.as_str()),
            None => ev,
        }
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn with_task(mut self, task: impl Into<Arc<str>>) -> Self {
        self.task = Some(task.into());
        self
    }

    #[inline]
    pub fn with_task_id(mut self, id: u64) -> Self {
        self.task_id = Some(id);
        self
    }

    #[inline]
    pub fn with_series(mut self, series: impl Into<Arc<str>>) -> Self {
        self.series = Some(series.into());
        self
    }

    #[inline]
    pub fn with_worker(mut self, worker: impl Into<Arc<str>>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a timeout duration (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(millis(d));
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(millis(d));
        self
    }

    #[inline]
    pub fn with_load(mut self, load: usize) -> Self {
        self.load = Some(load);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_task(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_task(subscriber)
            .with_reason(info)
    }

    /// Events raised by the fan-out itself; never fed back into it.
    #[inline]
    pub fn is_subscriber_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::TaskQueued);
        let b = Event::new(EventKind::TaskQueued);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn durations_saturate() {
        let ev = Event::new(EventKind::StopScheduled).with_delay(Duration::from_secs(u64::MAX));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
