//! # In-loop worker.
//!
//! Runs calls directly on the scheduler's runtime, one at a time behind a
//! [`PriorityLock`]. A callable given to this worker must not block.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::CallRunner;
use crate::iteration::IterSource;
use crate::policies::BackoffPolicy;
use crate::sync::{OpTracker, PriorityLock};
use crate::tasks::{Series, TaskRef};
use crate::workers::{InFlight, Status, Worker};

/// Worker that executes on the caller's own runtime.
pub struct InLoopWorker {
    name: String,
    series: Vec<Series>,
    runner: CallRunner,
    lock: PriorityLock,
    tracker: OpTracker,
    in_flight: InFlight,
}

impl InLoopWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            series: Vec::new(),
            runner: CallRunner::new(),
            lock: PriorityLock::new(),
            tracker: OpTracker::new(BackoffPolicy::default()),
            in_flight: InFlight::default(),
        }
    }

    /// Restricts the worker to tasks without a series plus these.
    pub fn with_series(mut self, series: impl IntoIterator<Item = Series>) -> Self {
        self.series = series.into_iter().collect();
        self
    }

    /// Replaces the runner, e.g. to enable timing or raw mode.
    pub fn with_runner(mut self, runner: CallRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Returns and clears per-call timings.
    pub fn stats(&self) -> Vec<Duration> {
        self.runner.take_stats()
    }
}

#[async_trait]
impl Worker for InLoopWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn qualifications(&self) -> Vec<Series> {
        self.series.clone()
    }

    async fn run(&self, task: TaskRef) -> Status {
        let _lock = self.lock.acquire(task.is_rushed()).await;
        let _flight = self.in_flight.enter(&task);
        let _busy = self.tracker.guard();
        let outcome = self.runner.run(task.call());
        Status::from_outcome(outcome, |iter| {
            Status::Sequence(Box::new(IterSource::new(iter).tracked(self.tracker.guard())))
        })
    }

    async fn stop(&self) {
        self.tracker.defer_to_all(None).await;
        self.lock.stop().await;
        tracing::debug!(worker = %self.name, "in-loop worker stopped");
    }

    async fn crash(&self) -> Vec<TaskRef> {
        self.tracker.quit_waiting();
        self.in_flight.drain()
    }
}
