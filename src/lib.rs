//! # workheap
//!
//! **workheap** is an in-process priority task scheduler. Callers submit calls with a
//! niceness and an optional series; a dispatch loop hands them, lowest key first, to a
//! roster of heterogeneous workers: the loop itself, dedicated threads, or subprocesses
//! speaking a line-delimited JSON protocol.
//!
//! ## Architecture
//! ```text
//!     submit(TaskSpec)        submit(TaskSpec)        update(Call)
//!           │                       │                      │
//!           ▼                       ▼                      │
//! ┌──────────────────────────────────────────────────┐     │
//! │ TaskScheduler                                    │     │
//! │  - SeriesCounter (key = serial × 2^(nice/10))    │     │
//! │  - AsyncPriorityHeap<TaskRef>                    │     │
//! │  - Bus (broadcast events)                        │     │
//! └──────────────────────┬───────────────────────────┘     │
//!                        ▼                                 │
//!                  DispatchLoop ── take() ── handle(task)  │
//!                        │                                 │
//!                        ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Roster (one task per worker, qualification by series)        │
//! └───────┬──────────────────────┬───────────────────────┬───────┘
//!         ▼                      ▼                       ▼
//!   InLoopWorker           ThreadWorker            ProcessWorker ══ NDJSON ══ WorkerServer
//!   (CallRunner)      (thread + CallRunner)       (child stdio, backoff polling)
//!         │                      │                       │
//!         └──────── Status ──────┴───────────────────────┘
//!                        ▼
//!               result loop: Value / None / Sequence / Error / TimedOut / Disconnected
//!                        │
//!                        ▼
//!                  TaskFuture ──► caller
//! ```
//!
//! ## Results
//! | Worker status | Caller sees |
//! |---|---|
//! | value, chunked string | `Ok(TaskOutput::Value)` |
//! | nothing | `Ok(TaskOutput::None)` |
//! | lazy sequence | `Ok(TaskOutput::Sequence)`, or `Ok(TaskOutput::Done)` through a [`Consumer`] |
//! | call error | per [`FailurePolicy`]: `Err(TaskError::Call)` or `Ok(TaskOutput::Error)` |
//! | timeout | retried once rushed, then `Err(TaskError::Timeout)` |
//! | disconnect | retried at the same priority |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use workheap::{Call, Callable, Config, InLoopWorker, LogWriter, Output, TaskScheduler, TaskSpec};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sched = TaskScheduler::builder(Config::default())
//!         .with_subscriber(Arc::new(LogWriter))
//!         .with_worker(Arc::new(InLoopWorker::new("loop")))
//!         .build()?;
//!
//!     let count = Callable::new("count", |args, _| {
//!         let n = args.first().and_then(|v| v.as_u64()).unwrap_or_default();
//!         Ok(Output::sequence((1..=n).map(|i| json!(i))))
//!     });
//!
//!     let out = sched
//!         .submit(TaskSpec::new(Call::new(count).arg(3)).with_series("demo"))?
//!         .await?;
//!     let items = out.into_sequence().ok_or("no sequence")?.collect().await;
//!     assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
//!
//!     sched.shutdown().await;
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod iteration;
mod policies;
mod subscribers;
mod sync;
mod tasks;
mod threads;
mod workers;

// ---- Public re-exports ----

pub use crate::core::{
    AsyncPriorityHeap, CallRunner, Config, DispatchLoop, Handler, LoopState, Outcome, Priority,
    SchedulerBuilder, Slot, Take, TaskScheduler, WorkerId,
};
pub use error::{PoolError, QueueError, RuntimeError, TaskError, WireError};
pub use events::{Bus, Event, EventKind};
pub use iteration::{
    prefetch, AsyncSequence, Consumer, IterSource, IterationProducer, ListConsumer,
    ProducerHandle, SequenceSource,
};
pub use policies::{BackoffPolicy, FailurePolicy, Niceness};
pub use subscribers::{LoadMonitor, LogWriter, Subscribe, SubscriberSet};
pub use sync::{Delay, LockGuard, OpTracker, PriorityLock, TrackGuard};
pub use tasks::{
    Call, CallFn, CallTable, Callable, Kwargs, Output, Placement, Series, SeriesCounter, Task,
    TaskFuture, TaskOutput, TaskRef, TaskResult, TaskSpec, ValueIter,
};
pub use threads::{
    BlockingItems, BlockingPool, Consumerator, FileChunks, Filerator, OrderedItemProducer,
};
pub use workers::{
    Envelope, InLoopWorker, ProcessWorker, Request, Response, Status, ThreadWorker, Worker,
    WorkerServer,
};
