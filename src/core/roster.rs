//! # Worker roster: the dispatch loop's handler.
//!
//! The roster owns the attached workers and decides which one runs the task the dispatch
//! loop just took from the heap.
//!
//! ```text
//! DispatchLoop ──handle(task)──► Roster
//!                                  ├─ closed?           ─► unhandled list
//!                                  ├─ claim idle, qualified worker (lowest id first)
//!                                  │     none yet ─► wait on `idle` (attach / finish / qualify)
//!                                  └─ spawn dispatch ───► worker.run(task)  ◄── raced against task timeout
//!                                                            │
//!                                     Completion{task, worker, status} ──► results channel
//! ```
//!
//! ## Rules
//! - A worker is handed at most one task at a time; it is busy until its `run` returns,
//!   even when the task already timed out.
//! - A worker with no qualifications takes any task; otherwise it takes tasks without a
//!   series plus tasks of its listed series.
//! - `handle` returns once the task is assigned, so the loop takes the next task only
//!   when the previous one has a worker.
//! - Calls passed to non-ephemeral `update` are replayed on every worker attached later.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::core::dispatch::Handler;
use crate::core::panic_message;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;
use crate::sync::OpTracker;
use crate::tasks::{Call, Series, Task, TaskRef};
use crate::workers::{Status, Worker};

/// Id of an attached worker.
pub type WorkerId = u64;

/// A worker's answer for one task, on its way to the scheduler.
pub(crate) struct Completion {
    pub task: TaskRef,
    pub worker: Arc<str>,
    pub status: Status,
}

struct Handle {
    worker: Arc<dyn Worker>,
    name: Arc<str>,
    series: HashSet<Series>,
    busy: bool,
}

impl Handle {
    fn accepts(&self, series: Option<&Series>) -> bool {
        self.series.is_empty() || series.map_or(true, |s| self.series.contains(s))
    }
}

#[derive(Default)]
struct RosterState {
    workers: BTreeMap<WorkerId, Handle>,
    next_id: WorkerId,
    updates: Vec<Call>,
    closed: bool,
    unhandled: Vec<TaskRef>,
}

enum Claim {
    Got(WorkerId, Arc<dyn Worker>, Arc<str>),
    Wait,
    Closed,
}

struct RosterInner {
    state: Mutex<RosterState>,
    idle: Notify,
    bus: Bus,
    results: mpsc::UnboundedSender<Completion>,
    dispatches: OpTracker,
    stop_timeout: Duration,
}

/// Catalog of attached workers; cheap to clone.
#[derive(Clone)]
pub(crate) struct Roster {
    inner: Arc<RosterInner>,
}

impl Roster {
    pub(crate) fn new(
        bus: Bus,
        results: mpsc::UnboundedSender<Completion>,
        poll: BackoffPolicy,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RosterInner {
                state: Mutex::new(RosterState {
                    next_id: 1,
                    ..RosterState::default()
                }),
                idle: Notify::new(),
                bus,
                results,
                dispatches: OpTracker::new(poll),
                stop_timeout,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RosterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a worker; a busy worker is not dispatched to until released.
    /// Returns its id, its name and the updates it has to replay.
    pub(crate) fn insert(&self, worker: Arc<dyn Worker>, busy: bool) -> (WorkerId, Arc<str>, Vec<Call>) {
        let name: Arc<str> = Arc::from(worker.name());
        let mut st = self.state();
        let id = st.next_id;
        st.next_id += 1;
        let series = worker.qualifications().into_iter().collect();
        st.workers.insert(
            id,
            Handle {
                worker,
                name: Arc::clone(&name),
                series,
                busy,
            },
        );
        self.inner
            .bus
            .publish(Event::new(EventKind::WorkerAttached).with_worker(Arc::clone(&name)));
        tracing::info!(worker = %name, id, "worker attached");
        (id, name, st.updates.clone())
    }

    /// Adds a worker, replays remembered updates on it, then makes it available.
    pub(crate) async fn attach(&self, worker: Arc<dyn Worker>) -> WorkerId {
        let (id, name, updates) = self.insert(Arc::clone(&worker), true);
        for call in updates {
            let (task, _result) = Task::detached(call);
            if let Status::Error(text) = worker.run(task).await {
                tracing::warn!(worker = %name, error = %text, "update replay failed");
            }
        }
        self.release(id);
        id
    }

    /// Removes a worker. It gets `stop_timeout` to stop; after that it is crashed and
    /// the tasks it had in flight are returned.
    pub(crate) async fn detach(&self, id: WorkerId) -> Result<Vec<TaskRef>, RuntimeError> {
        let handle = self
            .state()
            .workers
            .remove(&id)
            .ok_or(RuntimeError::UnknownWorker { id })?;
        Ok(self.retire(handle).await)
    }

    async fn retire(&self, handle: Handle) -> Vec<TaskRef> {
        let Handle { worker, name, .. } = handle;
        match tokio::time::timeout(self.inner.stop_timeout, worker.stop()).await {
            Ok(()) => {
                self.inner
                    .bus
                    .publish(Event::new(EventKind::WorkerDetached).with_worker(name));
                Vec::new()
            }
            Err(_) => {
                let orphans = worker.crash().await;
                tracing::warn!(worker = %name, orphans = orphans.len(), "worker did not stop in time; crashed");
                self.inner.bus.publish(
                    Event::new(EventKind::WorkerCrashed)
                        .with_worker(name)
                        .with_reason(format!("stop timed out; {} task(s) in flight", orphans.len())),
                );
                orphans
            }
        }
    }

    /// Extends a worker's qualifications.
    pub(crate) fn qualify(&self, id: WorkerId, series: Series) -> Result<(), RuntimeError> {
        {
            let mut st = self.state();
            let handle = st
                .workers
                .get_mut(&id)
                .ok_or(RuntimeError::UnknownWorker { id })?;
            handle.series.insert(series);
        }
        self.inner.idle.notify_waiters();
        Ok(())
    }

    /// Runs `call` on every attached worker, outside the heap.
    pub(crate) async fn update(&self, call: Call, ephemeral: bool) -> Vec<Status> {
        let workers: Vec<Arc<dyn Worker>> = {
            let mut st = self.state();
            if !ephemeral {
                st.updates.push(call.clone());
            }
            st.workers.values().map(|h| Arc::clone(&h.worker)).collect()
        };
        let runs = workers.into_iter().map(|w| {
            let (task, _result) = Task::detached(call.clone());
            async move { w.run(task).await }
        });
        futures::future::join_all(runs).await
    }

    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        self.state().workers.keys().copied().collect()
    }

    /// Stops accepting tasks; waiting and later `handle` calls park tasks as unhandled.
    pub(crate) fn close(&self) {
        self.state().closed = true;
        self.inner.idle.notify_waiters();
    }

    /// Detaches every worker, returning tasks from the ones that had to be crashed.
    pub(crate) async fn stop_all(&self) -> Vec<TaskRef> {
        let handles: Vec<Handle> = std::mem::take(&mut self.state().workers)
            .into_values()
            .collect();
        let retired = handles.into_iter().map(|h| self.retire(h));
        futures::future::join_all(retired)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    fn claim(&self, task: &Task) -> Claim {
        let mut st = self.state();
        if st.closed {
            return Claim::Closed;
        }
        let found = st
            .workers
            .iter_mut()
            .find(|(_, h)| !h.busy && h.accepts(task.series()));
        match found {
            Some((id, h)) => {
                h.busy = true;
                Claim::Got(*id, Arc::clone(&h.worker), Arc::clone(&h.name))
            }
            None => Claim::Wait,
        }
    }

    fn release(&self, id: WorkerId) {
        if let Some(h) = self.state().workers.get_mut(&id) {
            h.busy = false;
        }
        self.inner.idle.notify_waiters();
    }

    fn dispatch(&self, id: WorkerId, worker: Arc<dyn Worker>, name: Arc<str>, task: TaskRef) {
        let roster = self.clone();
        self.inner.dispatches.put(async move {
            let inner = &roster.inner;
            inner
                .bus
                .publish(Event::for_task(EventKind::TaskDispatched, &task).with_worker(Arc::clone(&name)));

            let mut run = tokio::spawn({
                let task = TaskRef::clone(&task);
                async move { worker.run(task).await }
            });

            let joined = match task.timeout() {
                Some(limit) => match tokio::time::timeout(limit, &mut run).await {
                    Ok(joined) => Some(joined),
                    Err(_) => None,
                },
                None => Some((&mut run).await),
            };

            let status = match joined {
                Some(Ok(status)) => status,
                Some(Err(e)) if e.is_panic() => {
                    Status::Error(format!("{}: worker panicked: {}", task.name(), panic_message(&*e.into_panic())))
                }
                Some(Err(_)) => Status::Disconnected,
                None => {
                    inner.bus.publish(
                        Event::for_task(EventKind::TimeoutHit, &task)
                            .with_worker(Arc::clone(&name))
                            .with_timeout(task.timeout().unwrap_or_default()),
                    );
                    let _ = inner.results.send(Completion {
                        task: TaskRef::clone(&task),
                        worker: Arc::clone(&name),
                        status: Status::TimedOut,
                    });
                    // The worker stays busy until the late call returns; its result is dropped.
                    let _ = run.await;
                    roster.release(id);
                    return;
                }
            };

            roster.release(id);
            let _ = inner.results.send(Completion {
                task,
                worker: name,
                status,
            });
        });
    }
}

#[async_trait]
impl Handler<TaskRef> for Roster {
    async fn handle(&self, task: TaskRef) -> anyhow::Result<()> {
        if !task.is_live() {
            return Ok(());
        }
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.claim(&task) {
                Claim::Got(id, worker, name) => {
                    self.dispatch(id, worker, name, task);
                    return Ok(());
                }
                Claim::Closed => {
                    self.state().unhandled.push(task);
                    return Ok(());
                }
                Claim::Wait => notified.await,
            }
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Vec<TaskRef> {
        if !self.inner.dispatches.defer_to_all(Some(timeout)).await {
            tracing::warn!(?timeout, "dispatches still running at loop shutdown");
        }
        std::mem::take(&mut self.state().unhandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use crate::policies::Niceness;
    use crate::tasks::{Callable, Output, TaskParts};
    use crate::workers::InLoopWorker;

    fn task(series: Option<&str>) -> TaskRef {
        Task::create(TaskParts {
            call: Call::new(Callable::new("noop", |_, _| Ok(Output::value(1)))),
            series: series.map(Series::from),
            niceness: Niceness::NORMAL,
            priority: Priority(1.0),
            timeout: None,
            failure: None,
            consumer: None,
        })
        .0
    }

    fn roster() -> (Roster, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let r = Roster::new(Bus::new(16), tx, BackoffPolicy::default(), Duration::from_secs(1));
        (r, rx)
    }

    #[tokio::test]
    async fn specialist_takes_only_its_series_and_unseries_tasks() {
        let (r, mut rx) = roster();
        r.attach(Arc::new(InLoopWorker::new("s").with_series([Series::from("a")])))
            .await;

        r.handle(task(None)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().worker.as_ref(), "s");
        r.handle(task(Some("a"))).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().worker.as_ref(), "s");

        // Series "b" waits until someone qualifies.
        let pending = tokio::spawn({
            let r = r.clone();
            async move { r.handle(task(Some("b"))).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        let id = r.worker_ids()[0];
        r.qualify(id, Series::from("b")).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().worker.as_ref(), "s");
    }

    #[tokio::test]
    async fn closed_roster_parks_tasks_as_unhandled() {
        let (r, _rx) = roster();
        let waiting = tokio::spawn({
            let r = r.clone();
            async move { r.handle(task(None)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        r.close();
        waiting.await.unwrap().unwrap();
        r.handle(task(None)).await.unwrap();
        assert_eq!(r.shutdown(Duration::from_secs(1)).await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_worker_is_an_error() {
        let (r, _rx) = roster();
        assert_eq!(r.detach(42).await.unwrap_err().as_label(), "runtime_unknown_worker");
        assert!(r.qualify(42, Series::from("x")).is_err());
    }
}
