//! # Subprocess worker.
//!
//! The loop side of a worker process. Requests go out as NDJSON frames on the child's
//! stdin; a reader task turns stdout lines into [`Response`]s on a channel, and the caller
//! polls that channel with the configured backoff rather than parking on it.
//!
//! Each request carries a fresh `seq`. Replies with any other `seq` belong to an exchange
//! whose caller gave up, and are discarded.
//!
//! ```text
//! ProcessWorker::run(task)
//!   ├─► lock.acquire(vip)
//!   ├─► write {"seq":n,"op":"call",...}
//!   ├─► Delay::poll(try_recv)          (first, first*factor, ... capped at max; skip seq != n)
//!   └─► Value / None / Error           ─► Status
//!       Sequence{id}                   ─► Status::Sequence(RemoteSource{id})
//!       Chunked{id} ─► Next{id}... ─► Status::Chunked(parsed JSON text)
//!       channel closed                 ─► Status::Disconnected
//! ```
//!
//! A remote sequence dropped before its end sends `Release{id}` so the subprocess lets
//! go of it.
//!
//! [`ProcessWorker::connect`] accepts any byte stream, so the same worker also talks to
//! an in-process [`WorkerServer`] over `tokio::io::duplex`.

mod server;
mod wire;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::Config;
use crate::error::{RuntimeError, TaskError, WireError};
use crate::iteration::SequenceSource;
use crate::policies::BackoffPolicy;
use crate::sync::{Delay, OpTracker, PriorityLock, TrackGuard};
use crate::tasks::{Series, TaskRef};
use crate::workers::{InFlight, Status, Worker};

pub use server::{WorkerServer, DEFAULT_CHUNK_SIZE};
pub use wire::{read_frame, write_frame, Envelope, Request, Response};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One request/response channel, used by one exchange at a time.
struct Link {
    lock: PriorityLock,
    writer: tokio::sync::Mutex<Option<Writer>>,
    replies: Mutex<mpsc::UnboundedReceiver<Envelope<Response>>>,
    seq: AtomicU64,
    poll: BackoffPolicy,
}

impl Link {
    fn new(writer: Writer, replies: mpsc::UnboundedReceiver<Envelope<Response>>, poll: BackoffPolicy) -> Self {
        Self {
            lock: PriorityLock::new(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            replies: Mutex::new(replies),
            seq: AtomicU64::new(0),
            poll,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn exchange(&self, vip: bool, req: &Request) -> Result<Response, TaskError> {
        let _guard = self.lock.acquire(vip).await;
        let seq = self.next_seq();
        {
            let mut writer = self.writer.lock().await;
            let w = writer.as_mut().ok_or(TaskError::Disconnected)?;
            if let Err(e) = write_frame(w, &Envelope::new(seq, req)).await {
                tracing::warn!(error = %e, "process worker write failed");
                return Err(TaskError::Disconnected);
            }
        }
        let reply = Delay::new(self.poll).poll(|| self.take_reply(seq)).await;
        reply.unwrap_or(Err(TaskError::Disconnected))
    }

    /// The reply to `seq` if it has arrived. Earlier replies nobody waits for are dropped.
    fn take_reply(&self, seq: u64) -> Option<Result<Response, TaskError>> {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match replies.try_recv() {
                Ok(env) if env.seq == seq || env.seq == 0 => return Some(Ok(env.body)),
                Ok(stale) => tracing::debug!(seq = stale.seq, expected = seq, "discarding stale reply"),
                Err(mpsc::error::TryRecvError::Empty) => return None,
                Err(mpsc::error::TryRecvError::Disconnected) => return Some(Err(TaskError::Disconnected)),
            }
        }
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = write_frame(&mut w, &Envelope::new(self.next_seq(), Request::Quit)).await;
            let _ = w.shutdown().await;
        }
    }
}

/// Worker that runs calls in a subordinate process.
pub struct ProcessWorker {
    name: String,
    series: Vec<Series>,
    link: Arc<Link>,
    child: tokio::sync::Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    tracker: OpTracker,
    in_flight: InFlight,
}

impl ProcessWorker {
    /// Talks to a [`WorkerServer`] over an existing byte stream.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W, cfg: &Config) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_name = name.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(reader);
            loop {
                let resp = match read_frame::<_, Envelope<Response>>(&mut lines).await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(WireError::Codec(e)) => Envelope::new(
                        0,
                        Response::Error {
                            text: format!("bad frame from worker: {e}"),
                        },
                    ),
                    Err(e) => {
                        tracing::warn!(worker = %reader_name, reason = e.as_label(), "process worker stream failed");
                        break;
                    }
                };
                if tx.send(resp).is_err() {
                    break;
                }
            }
            tracing::debug!(worker = %reader_name, "process worker reader ended");
        });

        Self {
            name,
            series: Vec::new(),
            link: Arc::new(Link::new(Box::new(writer), rx, cfg.poll)),
            child: tokio::sync::Mutex::new(None),
            reader: Mutex::new(Some(reader)),
            tracker: OpTracker::new(cfg.poll),
            in_flight: InFlight::default(),
        }
    }

    /// Starts `command` with piped stdio and talks to it.
    pub fn spawn(name: impl Into<String>, mut command: Command, cfg: &Config) -> Result<Self, RuntimeError> {
        let name = name.into();
        let mut child = command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn {
                reason: format!("process {name}: {e}"),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| RuntimeError::Spawn {
            reason: format!("process {name}: stdin not captured"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Spawn {
            reason: format!("process {name}: stdout not captured"),
        })?;
        tracing::info!(worker = %name, pid = child.id(), "worker process started");
        let mut worker = Self::connect(name, stdout, stdin, cfg);
        worker.child = tokio::sync::Mutex::new(Some(child));
        Ok(worker)
    }

    /// Restricts the worker to tasks without a series plus these.
    pub fn with_series(mut self, series: impl IntoIterator<Item = Series>) -> Self {
        self.series = series.into_iter().collect();
        self
    }

    /// Fetches and clears the subprocess runner's call timings.
    pub async fn stats(&self) -> Result<Vec<Duration>, TaskError> {
        match self.link.exchange(true, &Request::Stats).await? {
            Response::Stats { timings } => Ok(timings
                .into_iter()
                .filter_map(|s| Duration::try_from_secs_f64(s).ok())
                .collect()),
            other => Err(unexpected("stats", &other)),
        }
    }

    /// Pulls the pieces of a chunked result and parses the joined JSON text.
    async fn reassemble(&self, id: String) -> Result<Value, TaskError> {
        let mut pieces = RemoteSource::new(Arc::clone(&self.link), id, None);
        let mut text = String::new();
        while let Some(piece) = pieces.fetch().await? {
            match piece {
                Value::String(piece) => text.push_str(&piece),
                other => {
                    return Err(TaskError::Call {
                        text: format!("unexpected chunk: {other}"),
                    })
                }
            }
        }
        serde_json::from_str(&text).map_err(|e| TaskError::Call {
            text: format!("bad chunked value: {e}"),
        })
    }
}

fn unexpected(what: &str, resp: &Response) -> TaskError {
    TaskError::Call {
        text: format!("unexpected reply to {what}: {resp:?}"),
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn qualifications(&self) -> Vec<Series> {
        self.series.clone()
    }

    async fn run(&self, task: TaskRef) -> Status {
        let _flight = self.in_flight.enter(&task);
        let _busy = self.tracker.guard();
        let call = task.call();
        let req = Request::Call {
            callable: call.name().to_string(),
            args: call.args().to_vec(),
            kwargs: call.kwargs().clone(),
        };
        let resp = match self.link.exchange(task.is_rushed(), &req).await {
            Ok(resp) => resp,
            Err(TaskError::Disconnected) => return Status::Disconnected,
            Err(e) => return Status::Error(e.to_string()),
        };
        match resp {
            Response::Value { value } => Status::Value(value),
            Response::None => Status::None,
            Response::Error { text } => Status::Error(text),
            Response::Sequence { id } => Status::Sequence(Box::new(RemoteSource::new(
                Arc::clone(&self.link),
                id,
                Some(self.tracker.guard()),
            ))),
            Response::Chunked { id } => match self.reassemble(id).await {
                Ok(value) => Status::Chunked(value),
                Err(TaskError::Disconnected) => Status::Disconnected,
                Err(e) => Status::Error(e.to_string()),
            },
            other => Status::Error(unexpected("call", &other).to_string()),
        }
    }

    async fn stop(&self) {
        self.tracker.defer_to_all(None).await;
        self.link.lock.stop().await;
        self.link.close().await;
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match child.wait().await {
                Ok(status) => tracing::info!(worker = %self.name, %status, "worker process exited"),
                Err(e) => tracing::warn!(worker = %self.name, error = %e, "waiting for worker process failed"),
            }
        }
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    async fn crash(&self) -> Vec<TaskRef> {
        self.tracker.quit_waiting();
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::warn!(worker = %self.name, error = %e, "failed to kill worker process");
            }
        }
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        drop(self.link.writer.lock().await.take());
        tracing::warn!(worker = %self.name, "process worker crashed");
        self.in_flight.drain()
    }
}

/// A sequence living in the subprocess, pulled with `Next{id}`.
struct RemoteSource {
    link: Arc<Link>,
    /// `None` once the subprocess has dropped its side.
    id: Option<String>,
    guard: Option<TrackGuard>,
}

impl RemoteSource {
    fn new(link: Arc<Link>, id: String, guard: Option<TrackGuard>) -> Self {
        Self {
            link,
            id: Some(id),
            guard,
        }
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let link = Arc::clone(&self.link);
        let guard = self.guard.take();
        handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = link.exchange(true, &Request::Release { id }).await {
                tracing::debug!(error = %e, "releasing remote sequence failed");
            }
        });
    }
}

#[async_trait]
impl SequenceSource for RemoteSource {
    async fn fetch(&mut self) -> Result<Option<Value>, TaskError> {
        let Some(id) = self.id.clone() else {
            return Ok(None);
        };
        match self.link.exchange(true, &Request::Next { id }).await? {
            Response::Item { value, valid: true } => Ok(Some(value)),
            Response::Item { valid: false, .. } => {
                self.id = None;
                Ok(None)
            }
            Response::Error { text } => {
                self.id = None;
                Err(TaskError::Call { text })
            }
            other => Err(unexpected("next", &other)),
        }
    }
}
