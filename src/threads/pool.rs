//! # Explicit pool of blocking threads.
//!
//! [`BlockingPool`] is constructed and passed around by whoever needs it; nothing about it
//! is process-wide. Jobs run on tokio's blocking threads, at most `size` at a time.
//!
//! ```text
//! BlockingPool::new(4) ─► start() ─► run(f) / sequence(iter) ... ─► shutdown(timeout)
//!                                       │
//!                                       └─ permit (semaphore) ─► spawn_blocking(f)
//! ```
//!
//! Jobs submitted before `start()` or after `shutdown()` fail with [`PoolError::NotRunning`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::panic_message;
use crate::error::{PoolError, TaskError};
use crate::iteration::{prefetch, AsyncSequence, SequenceSource};
use crate::policies::BackoffPolicy;
use crate::sync::OpTracker;
use crate::tasks::ValueIter;

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    jobs: OpTracker,
    running: AtomicBool,
}

/// Bounded pool of blocking threads; cheap to clone.
#[derive(Clone)]
pub struct BlockingPool {
    inner: Arc<PoolInner>,
}

impl BlockingPool {
    /// Pool running at most `size` jobs at once (at least one). Not started yet.
    pub fn new(size: usize) -> Self {
        Self::with_poll(size, BackoffPolicy::default())
    }

    /// Like [`BlockingPool::new`], with `poll` used while `shutdown` waits for jobs.
    pub fn with_poll(size: usize, poll: BackoffPolicy) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                jobs: OpTracker::new(poll),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.permits.is_closed() {
            self.inner.running.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Runs `f` on a pool thread once a slot is free.
    pub async fn run<F, R>(&self, f: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::NotRunning)?;
        let guard = self.inner.jobs.guard();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            f()
        })
        .await;
        match joined {
            Ok(r) => Ok(r),
            Err(e) if e.is_panic() => Err(PoolError::Panicked {
                message: panic_message(&*e.into_panic()),
            }),
            Err(_) => Err(PoolError::NotRunning),
        }
    }

    /// Async sequence over a slow blocking iterator; every `next` runs on the pool.
    pub async fn sequence(&self, iter: ValueIter) -> AsyncSequence {
        prefetch(Box::new(PoolSource {
            pool: self.clone(),
            iter: Some(iter),
        }))
        .await
    }

    /// Stops taking jobs and waits up to `timeout` for running ones. Returns `true` when
    /// they all finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.permits.close();
        let done = self.inner.jobs.defer_to_all(Some(timeout)).await;
        if !done {
            tracing::warn!(
                outstanding = self.inner.jobs.outstanding().unwrap_or_default(),
                "blocking pool jobs still running after shutdown timeout"
            );
        }
        done
    }
}

struct PoolSource {
    pool: BlockingPool,
    iter: Option<ValueIter>,
}

#[async_trait]
impl SequenceSource for PoolSource {
    async fn fetch(&mut self) -> Result<Option<Value>, TaskError> {
        let Some(mut iter) = self.iter.take() else {
            return Ok(None);
        };
        let (iter, item) = self
            .pool
            .run(move || {
                let item = iter.next();
                (iter, item)
            })
            .await
            .map_err(|e| TaskError::Call {
                text: e.to_string(),
            })?;
        if item.is_some() {
            self.iter = Some(iter);
        }
        Ok(item)
    }
}
