//! # Dedicated-thread worker.
//!
//! Owns one OS thread that runs jobs sent over a channel. The loop side hands over a
//! closure, then awaits a oneshot reply with the configured `thread_timeout`; it never
//! blocks the runtime. The timeout counts from the moment the thread picks the job up,
//! so a call queued behind a late one is not charged for the wait.
//!
//! ```text
//! run(task)
//!   └─► lock.acquire(vip) ─► jobs.send(Run(closure)) ─► started ─► timeout(thread_timeout, reply)
//!                                   │                                ├─ Ok(outcome) ─► Status
//!                                   ▼                                ├─ elapsed     ─► Error("Thread timed out ...")
//!                       worker thread: started.send(())              └─ dropped     ─► Disconnected
//!                                      reply.send(runner.run(call))
//! ```
//!
//! Lazy sequences stay on the worker thread; each fetch is one more VIP job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::{panic_message, CallRunner, Config};
use crate::error::{RuntimeError, TaskError};
use crate::iteration::SequenceSource;
use crate::sync::{OpTracker, PriorityLock, TrackGuard};
use crate::tasks::{Series, TaskRef, ValueIter};
use crate::workers::{InFlight, Status, Worker};

/// Error text reported when the thread never answers.
const THREAD_TIMEOUT_TEXT: &str = "Thread timed out waiting for this call!";

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallError {
    TimedOut,
    Disconnected,
}

struct Shared {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    lock: PriorityLock,
    thread_timeout: Duration,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close(&self) {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = jobs {
            let _ = tx.send(Job::Quit);
        }
    }

    /// Runs `f` on the worker thread, one call at a time.
    async fn call<R, F>(&self, vip: bool, f: F) -> Result<R, CallError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.lock.acquire(vip).await;
        let tx = self.sender().ok_or(CallError::Disconnected)?;
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job::Run(Box::new(move || {
            let _ = started_tx.send(());
            let _ = reply_tx.send(f());
        }));
        tx.send(job).map_err(|_| CallError::Disconnected)?;
        started_rx.await.map_err(|_| CallError::Disconnected)?;
        match tokio::time::timeout(self.thread_timeout, reply_rx).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(_)) => Err(CallError::Disconnected),
            Err(_) => Err(CallError::TimedOut),
        }
    }
}

/// Worker backed by one dedicated OS thread.
pub struct ThreadWorker {
    name: String,
    series: Vec<Series>,
    runner: Arc<CallRunner>,
    shared: Arc<Shared>,
    tracker: OpTracker,
    in_flight: InFlight,
}

impl ThreadWorker {
    /// Starts the worker thread.
    pub fn spawn(name: impl Into<String>, cfg: &Config) -> Result<Self, RuntimeError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(format!("workheap-{name}"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Run(f) => {
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                                tracing::error!(panic = %panic_message(&*panic), "worker thread job panicked");
                            }
                        }
                        Job::Quit => break,
                    }
                }
            })
            .map_err(|e| RuntimeError::Spawn {
                reason: format!("thread {name}: {e}"),
            })?;

        let lock = PriorityLock::new();
        let quit = tx.clone();
        let worker_name = name.clone();
        lock.add_stopper(move || async move {
            let _ = quit.send(Job::Quit);
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => tracing::debug!(worker = %worker_name, "worker thread joined"),
                _ => tracing::warn!(worker = %worker_name, "worker thread ended abnormally"),
            }
        });

        Ok(Self {
            name,
            series: Vec::new(),
            runner: Arc::new(CallRunner::new()),
            shared: Arc::new(Shared {
                jobs: Mutex::new(Some(tx)),
                lock,
                thread_timeout: cfg.thread_timeout,
            }),
            tracker: OpTracker::new(cfg.poll),
            in_flight: InFlight::default(),
        })
    }

    /// Restricts the worker to tasks without a series plus these.
    pub fn with_series(mut self, series: impl IntoIterator<Item = Series>) -> Self {
        self.series = series.into_iter().collect();
        self
    }

    /// Replaces the runner used for subsequent calls.
    pub fn with_runner(mut self, runner: CallRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    /// Returns and clears per-call timings.
    pub fn stats(&self) -> Vec<Duration> {
        self.runner.take_stats()
    }
}

#[async_trait]
impl Worker for ThreadWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn qualifications(&self) -> Vec<Series> {
        self.series.clone()
    }

    async fn run(&self, task: TaskRef) -> Status {
        let _flight = self.in_flight.enter(&task);
        let _busy = self.tracker.guard();
        let runner = Arc::clone(&self.runner);
        let call = task.call().clone();
        match self.shared.call(task.is_rushed(), move || runner.run(&call)).await {
            Ok(outcome) => Status::from_outcome(outcome, |iter| {
                Status::Sequence(Box::new(ThreadSource {
                    shared: Arc::clone(&self.shared),
                    iter: Arc::new(Mutex::new(iter)),
                    _guard: self.tracker.guard(),
                }))
            }),
            Err(CallError::TimedOut) => {
                tracing::warn!(worker = %self.name, task = task.id(), "thread call timed out");
                Status::Error(THREAD_TIMEOUT_TEXT.to_string())
            }
            Err(CallError::Disconnected) => Status::Disconnected,
        }
    }

    async fn stop(&self) {
        self.tracker.defer_to_all(None).await;
        self.shared.lock.stop().await;
        self.shared.close();
    }

    async fn crash(&self) -> Vec<TaskRef> {
        self.tracker.quit_waiting();
        self.shared.close();
        self.in_flight.drain()
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// A sequence living on the worker thread.
struct ThreadSource {
    shared: Arc<Shared>,
    iter: Arc<Mutex<ValueIter>>,
    _guard: TrackGuard,
}

#[async_trait]
impl SequenceSource for ThreadSource {
    async fn fetch(&mut self) -> Result<Option<Value>, TaskError> {
        let iter = Arc::clone(&self.iter);
        let next = move || {
            let mut it = iter.lock().unwrap_or_else(PoisonError::into_inner);
            catch_unwind(AssertUnwindSafe(|| it.next())).map_err(|p| panic_message(&*p))
        };
        match self.shared.call(true, next).await {
            Ok(Ok(item)) => Ok(item),
            Ok(Err(text)) => Err(TaskError::Call { text }),
            Err(CallError::TimedOut) => Err(TaskError::Call {
                text: THREAD_TIMEOUT_TEXT.to_string(),
            }),
            Err(CallError::Disconnected) => Err(TaskError::Disconnected),
        }
    }
}
