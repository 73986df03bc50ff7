//! # TaskScheduler: submission, result classification, retry and shutdown.
//!
//! ```text
//! submit(spec) ──► key = SeriesCounter::key(series, niceness)   (or RUSH / RELAX)
//!                  heap.put(key, task) ──► DispatchLoop ──► Roster ──► Worker::run
//!                                                                         │
//!   caller ◄── TaskFuture ◄── result loop ◄── Completion{task, status} ◄──┘
//! ```
//!
//! ## Result classification
//! ```text
//! Value / Chunked ─► Ok(Value)
//! None            ─► Ok(None)
//! Sequence        ─► prefetch ─► consumer? ─► IterationProducer ─► Ok(Done{items})
//!                                 └─ else  ─► Ok(Sequence(AsyncSequence))
//! Error(text)     ─► Return: Err(Call{text})
//!                    Warn:   log, Ok(Error(text))
//!                    Stop:   log, Ok(Error(text)), shutdown after stop_grace
//! TimedOut        ─► first time: retry rushed; second time: Err(Timeout{attempts: 2})
//! Disconnected    ─► retry at the same priority, without limit
//! ```
//!
//! A retry is a new task whose result is forwarded into the original caller's future.
//! Results for tasks that are no longer live (superseded, cancelled, abandoned) are dropped.
//!
//! ## Shutdown
//! ```text
//! shutdown()
//!   ├─► running = false               (submit ─► NotRunning, retry ─► Shutdown)
//!   ├─► roster.close(); roster.stop_all()     (in-flight work finishes, workers stop)
//!   ├─► dispatch.request_shutdown()            (remaining heap items ─► unhandled)
//!   ├─► unhandled tasks ─► Err(Shutdown)
//!   └─► cancel pending delayed stop; stopped() resolves
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::dispatch::DispatchLoop;
use crate::core::heap::{AsyncPriorityHeap, Priority};
use crate::core::roster::{Completion, Roster, WorkerId};
use crate::core::{Config, SchedulerBuilder};
use crate::error::TaskError;
use crate::events::{Bus, Event, EventKind};
use crate::iteration::{prefetch, IterationProducer};
use crate::policies::{FailurePolicy, Niceness};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::tasks::{
    Call, Placement, Series, SeriesCounter, Task, TaskFuture, TaskOutput, TaskParts, TaskRef,
    TaskResult, TaskSpec,
};
use crate::workers::{Status, Worker};

pub(crate) struct Inner {
    cfg: Config,
    bus: Bus,
    heap: Arc<AsyncPriorityHeap<TaskRef>>,
    roster: Roster,
    dispatch: DispatchLoop<TaskRef>,
    counter: Mutex<SeriesCounter>,
    load: AtomicUsize,
    running: AtomicBool,
    shutting_down: AtomicBool,
    stop_scheduled: AtomicBool,
    stop_timer: CancellationToken,
    stopped: CancellationToken,
    listener_stop: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Priority scheduler over a roster of heterogeneous workers; cheap to clone.
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::json;
/// use workheap::{Call, Callable, Config, InLoopWorker, Output, TaskScheduler, TaskSpec};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sched = TaskScheduler::builder(Config::default())
///     .with_worker(Arc::new(InLoopWorker::new("loop")))
///     .build()?;
///
/// let square = Callable::new("square", |a, _| {
///     let x = a[0].as_i64().unwrap_or_default();
///     Ok(Output::value(x * x))
/// });
/// let out = sched.submit(TaskSpec::new(Call::new(square).arg(5)))?.await?;
/// assert_eq!(out.into_value(), Some(json!(25)));
/// sched.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Scheduler with `cfg`, no subscribers and no workers yet.
    pub fn new(cfg: Config) -> Result<Self, crate::RuntimeError> {
        SchedulerBuilder::new(cfg).build()
    }

    pub fn builder(cfg: Config) -> SchedulerBuilder {
        SchedulerBuilder::new(cfg)
    }

    pub(crate) fn assemble(
        cfg: Config,
        subscribers: Vec<Arc<dyn Subscribe>>,
        workers: Vec<Arc<dyn Worker>>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let subs = SubscriberSet::new(subscribers, bus.clone());
        let listener_stop = CancellationToken::new();
        let listener = spawn_listener(bus.clone(), subs, listener_stop.clone());

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let roster = Roster::new(bus.clone(), results_tx, cfg.poll, cfg.worker_stop_timeout);
        for w in workers {
            roster.insert(w, false);
        }
        let heap = Arc::new(AsyncPriorityHeap::new());
        let dispatch = DispatchLoop::spawn(
            Arc::clone(&heap),
            Arc::new(roster.clone()),
            cfg.loop_shutdown_timeout,
        );

        let inner = Arc::new(Inner {
            cfg,
            bus,
            heap,
            roster,
            dispatch,
            counter: Mutex::new(SeriesCounter::new()),
            load: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            stop_scheduled: AtomicBool::new(false),
            stop_timer: CancellationToken::new(),
            stopped: CancellationToken::new(),
            listener_stop,
            listener: Mutex::new(Some(listener)),
        });
        spawn_result_loop(Arc::downgrade(&inner), results_rx);
        Self { inner }
    }

    /// Enqueues a task and returns the future of its result. A spec without an explicit
    /// timeout gets `Config::timeout`.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskFuture, TaskError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(TaskError::NotRunning);
        }
        let parts = spec.into_parts(&inner.cfg);
        let niceness = Niceness::new(parts.niceness)?;
        let priority = match parts.placement {
            Placement::Rush => Priority::RUSH,
            Placement::Relax => Priority::RELAX,
            Placement::Normal => inner
                .counter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .key(parts.series.as_ref(), niceness),
        };
        let (task, fut) = Task::create(TaskParts {
            call: parts.call,
            series: parts.series,
            niceness,
            priority,
            timeout: parts.timeout,
            failure: parts.failure,
            consumer: parts.consumer,
        });
        let load = inner.load.fetch_add(1, Ordering::SeqCst) + 1;
        inner.bus.publish(Event::new(EventKind::LoadChanged).with_load(load));
        inner.bus.publish(Event::for_task(EventKind::TaskQueued, &task));
        tracing::debug!(task = task.name(), task_id = task.id(), %priority, "task queued");
        inner.heap.put(priority, task);
        Ok(fut)
    }

    /// Runs `call` on every attached worker, bypassing the heap. Unless `ephemeral`, the
    /// call is also replayed on workers attached later.
    pub async fn update(&self, call: Call, ephemeral: bool) -> Vec<TaskResult> {
        let statuses = self.inner.roster.update(call, ephemeral).await;
        let mut results = Vec::with_capacity(statuses.len());
        for status in statuses {
            results.push(match status {
                Status::Value(v) | Status::Chunked(v) => Ok(TaskOutput::Value(v)),
                Status::None => Ok(TaskOutput::None),
                Status::Sequence(src) => Ok(TaskOutput::Sequence(prefetch(src).await)),
                Status::Error(text) => Err(TaskError::Call { text }),
                Status::TimedOut => Err(TaskError::Timeout { attempts: 1 }),
                Status::Disconnected => Err(TaskError::Disconnected),
            });
        }
        results
    }

    /// Adds a worker. Remembered updates are replayed on it first.
    pub async fn attach_worker(&self, worker: Arc<dyn Worker>) -> WorkerId {
        self.inner.roster.attach(worker).await
    }

    /// Removes a worker; see [`Config::worker_stop_timeout`]. Tasks it still had in flight
    /// when it had to be crashed are re-enqueued (`reassign`) or fail with
    /// [`TaskError::Abandoned`], and are returned either way.
    pub async fn detach_worker(
        &self,
        id: WorkerId,
        reassign: bool,
    ) -> Result<Vec<TaskRef>, crate::RuntimeError> {
        let orphans = self.inner.roster.detach(id).await?;
        for task in orphans.iter().filter(|t| t.is_live()) {
            if reassign {
                self.inner.retry(task, task.priority(), false, "worker crashed");
            } else {
                self.inner.settle(task, Err(TaskError::Abandoned));
            }
        }
        Ok(orphans)
    }

    /// Lets a worker take tasks of `series` as well.
    pub fn qualify_worker(&self, id: WorkerId, series: impl Into<Series>) -> Result<(), crate::RuntimeError> {
        self.inner.roster.qualify(id, series.into())
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.inner.roster.worker_ids()
    }

    /// Removes queued tasks matching `predicate`; their futures fail with
    /// [`TaskError::Cancelled`]. Tasks already on a worker are not affected.
    pub fn cancel_where(&self, mut predicate: impl FnMut(&Task) -> bool) -> usize {
        let removed = self.inner.heap.cancel(|t| predicate(t.as_ref()));
        for task in &removed {
            self.inner
                .bus
                .publish(Event::for_task(EventKind::TaskCancelled, task));
            self.inner.settle(task, Err(TaskError::Cancelled));
        }
        removed.len()
    }

    /// Cancels every queued task of `series`.
    pub fn cancel_series(&self, series: &Series) -> usize {
        self.cancel_where(|t| t.series() == Some(series))
    }

    /// Cancels every queued task.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Stops the roster, then the dispatch loop, and returns the tasks that were never
    /// handled; their futures fail with [`TaskError::Shutdown`]. Later calls wait for the
    /// first one and return nothing.
    pub async fn shutdown(&self) -> Vec<TaskRef> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            inner.stopped.cancelled().await;
            return Vec::new();
        }
        inner.running.store(false, Ordering::SeqCst);
        inner.bus.publish(Event::new(EventKind::ShutdownRequested));
        tracing::info!(load = inner.load.load(Ordering::SeqCst), "scheduler shutting down");

        inner.roster.close();
        let crashed = inner.roster.stop_all().await;
        let unhandled = inner.dispatch.request_shutdown().await;

        for task in crashed.iter().chain(unhandled.iter()) {
            if task.is_live() {
                inner.settle(task, Err(TaskError::Shutdown));
            }
        }
        inner.stop_timer.cancel();
        inner.bus.publish(
            Event::new(EventKind::ShutdownComplete)
                .with_reason(format!("{} unhandled", unhandled.len())),
        );

        inner.listener_stop.cancel();
        let listener = inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        inner.stopped.cancel();
        unhandled
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has completed.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Submitted tasks whose futures are not yet resolved.
    pub fn load(&self) -> usize {
        self.inner.load.load(Ordering::SeqCst)
    }

    /// Raw event receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }
}

impl Inner {
    /// Delivers `result` to `task`; a root task leaving the scheduler lowers the load.
    fn settle(&self, task: &Task, result: TaskResult) {
        let label = outcome_label(&result);
        if task.finish(result) && task.is_root() {
            self.resolved(task, label);
        }
    }

    fn resolved(&self, task: &Task, label: &'static str) {
        let load = self
            .load
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        self.bus
            .publish(Event::for_task(EventKind::TaskCompleted, task).with_reason(label));
        self.bus.publish(Event::new(EventKind::LoadChanged).with_load(load));
    }

    /// Re-enqueues `task` as a new attempt under `priority`.
    fn retry(self: &Arc<Self>, task: &TaskRef, priority: Priority, timed_out: bool, reason: &str) {
        if !self.running.load(Ordering::SeqCst) {
            self.settle(task, Err(TaskError::Shutdown));
            return;
        }
        let (child, fut) = task.retry(priority, timed_out);
        self.bus.publish(
            Event::for_task(EventKind::RetryScheduled, &child).with_reason(reason.to_string()),
        );
        tracing::debug!(task = task.name(), task_id = task.id(), attempt = child.attempt(), reason, "retrying task");

        let parent = TaskRef::clone(task);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = fut.await;
            let label = outcome_label(&result);
            if parent.finish_forwarded(result) && parent.is_root() {
                if let Some(inner) = weak.upgrade() {
                    inner.resolved(&parent, label);
                }
            }
        });
        self.heap.put(priority, child);
    }

    fn on_result(self: &Arc<Self>, done: Completion) {
        let Completion {
            task,
            worker,
            status,
        } = done;
        if !task.is_live() {
            tracing::debug!(task = task.name(), task_id = task.id(), status = status.label(), "dropping result for a task that is no longer live");
            return;
        }
        match status {
            Status::Value(v) | Status::Chunked(v) => self.settle(&task, Ok(TaskOutput::Value(v))),
            Status::None => self.settle(&task, Ok(TaskOutput::None)),
            Status::Sequence(source) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let seq = prefetch(source).await;
                    let result = match task.consumer() {
                        Some(consumer) => {
                            match IterationProducer::new(seq, Arc::clone(consumer))
                                .with_poll(inner.cfg.poll)
                                .run()
                                .await
                            {
                                Ok(items) => Ok(TaskOutput::Done { items }),
                                Err(e) => Err(TaskError::Call {
                                    text: format!("{}: consumer failed: {e:#}", task.name()),
                                }),
                            }
                        }
                        None => Ok(TaskOutput::Sequence(seq)),
                    };
                    inner.settle(&task, result);
                });
            }
            Status::Error(text) => self.on_error(&task, &worker, text),
            Status::TimedOut if task.timeouts() >= 1 => {
                let attempts = task.timeouts() + 1;
                tracing::warn!(task = task.name(), task_id = task.id(), attempts, "task timed out again; giving up");
                self.settle(&task, Err(TaskError::Timeout { attempts }));
            }
            Status::TimedOut => self.retry(&task, Priority::RUSH, true, "timed out"),
            // Uncapped, unlike timeouts.
            Status::Disconnected => self.retry(&task, task.priority(), false, "worker disconnected"),
        }
    }

    fn on_error(self: &Arc<Self>, task: &TaskRef, worker: &str, text: String) {
        self.bus.publish(
            Event::for_task(EventKind::TaskFailed, task)
                .with_worker(worker)
                .with_reason(text.as_str()),
        );
        match task.failure_policy().unwrap_or(self.cfg.failure) {
            FailurePolicy::Return => self.settle(task, Err(TaskError::Call { text })),
            policy => {
                tracing::error!(task = task.name(), task_id = task.id(), worker, error = %text, "task failed");
                self.settle(task, Ok(TaskOutput::Error(text.clone())));
                if policy.stops_scheduler() {
                    self.schedule_stop(text);
                }
            }
        }
    }

    /// Shuts the scheduler down after `stop_grace`, once.
    fn schedule_stop(self: &Arc<Self>, reason: String) {
        if self.stop_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.cfg.stop_grace;
        self.bus.publish(
            Event::new(EventKind::StopScheduled)
                .with_delay(grace)
                .with_reason(reason),
        );
        let weak = Arc::downgrade(self);
        let cancel = self.stop_timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(inner) = weak.upgrade() {
                        TaskScheduler { inner }.shutdown().await;
                    }
                }
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.roster.close();
        self.heap.put_sentinel();
        self.listener_stop.cancel();
        self.stop_timer.cancel();
    }
}

fn outcome_label(result: &TaskResult) -> &'static str {
    match result {
        Ok(TaskOutput::Value(_)) => "value",
        Ok(TaskOutput::None) => "none",
        Ok(TaskOutput::Sequence(_)) => "sequence",
        Ok(TaskOutput::Done { .. }) => "done",
        Ok(TaskOutput::Error(_)) => "error_text",
        Err(e) => e.as_label(),
    }
}

fn spawn_result_loop(inner: Weak<Inner>, mut results: mpsc::UnboundedReceiver<Completion>) {
    tokio::spawn(async move {
        while let Some(done) = results.recv().await {
            let Some(sched) = inner.upgrade() else {
                break;
            };
            sched.on_result(done);
        }
    });
}

/// Forwards bus events to the subscriber set until `stop`, then drains and closes it.
fn spawn_listener(bus: Bus, set: SubscriberSet, stop: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                ev = rx.recv() => match ev {
                    Ok(ev) => set.emit(Arc::new(ev)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "subscriber listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(ev) = rx.try_recv() {
                        set.emit(Arc::new(ev));
                    }
                    break;
                }
            }
        }
        set.shutdown().await;
    })
}
