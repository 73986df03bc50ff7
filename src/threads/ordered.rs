//! # Producer that keeps call order.
//!
//! [`OrderedItemProducer`] writes items to a [`Consumer`] in the order `produce_item` was
//! called, not the order the items became ready. Early finishers wait in a buffer until
//! every item issued before them has been written.
//!
//! ```text
//! produce_item(a) ──────────────┐ ready 3rd
//! produce_item(b) ──────┐ ready 1st    │
//! produce_item(c) ──┐ ready 2nd │       │
//!                   ▼           ▼       ▼
//!            buffer{c}   buffer{b,c}   write a, b, c ─► consumer
//! ```
//!
//! [`OrderedItemProducer::blocking`] pairs the producer with a [`Consumerator`] so a
//! plain blocking function on a [`BlockingPool`] thread iterates the ordered items.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::PoolError;
use crate::iteration::Consumer;
use crate::policies::BackoffPolicy;
use crate::sync::OpTracker;
use crate::threads::{BlockingItems, BlockingPool, Consumerator};

#[derive(Default)]
struct Reorder {
    next: u64,
    ready: BTreeMap<u64, Value>,
}

/// Writes produced items to a consumer in call order.
pub struct OrderedItemProducer {
    consumer: Arc<dyn Consumer>,
    pool: Option<BlockingPool>,
    issued: AtomicU64,
    reorder: tokio::sync::Mutex<Reorder>,
    producing: AtomicBool,
    failure: Mutex<Option<String>>,
    pending: OpTracker,
}

impl OrderedItemProducer {
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        Self {
            consumer,
            pool: None,
            issued: AtomicU64::new(0),
            reorder: tokio::sync::Mutex::new(Reorder::default()),
            producing: AtomicBool::new(true),
            failure: Mutex::new(None),
            pending: OpTracker::new(BackoffPolicy::default()),
        }
    }

    /// Starts `fb` on `pool` over the ordered items. The handle resolves with `fb`'s
    /// result once [`stop`](Self::stop) has ended the iteration.
    pub fn blocking<F, R>(
        pool: &BlockingPool,
        capacity: usize,
        fb: F,
    ) -> Result<(Self, JoinHandle<Result<R, PoolError>>), PoolError>
    where
        F: FnOnce(BlockingItems) -> R + Send + 'static,
        R: Send + 'static,
    {
        let sink = Consumerator::shared(capacity);
        let handle = sink.consume_with(pool, fb)?;
        let mut producer = Self::new(sink);
        producer.pool = Some(pool.clone());
        Ok((producer, handle))
    }

    /// Takes a place in line now, then awaits `item` and writes it after every item
    /// that took its place earlier. Resolves to the item, or `None` once production has
    /// stopped or failed.
    pub fn produce_item<'a, Fut>(&'a self, item: Fut) -> impl Future<Output = Option<Value>> + 'a
    where
        Fut: Future<Output = anyhow::Result<Value>> + 'a,
    {
        let ticket = self
            .is_producing()
            .then(|| (self.issued.fetch_add(1, Ordering::SeqCst), self.pending.guard()));
        async move {
            let (key, _pending) = ticket?;
            let value = match item.await {
                Ok(value) => value,
                Err(e) => {
                    self.fail(format!("item {key}: {e:#}"));
                    return None;
                }
            };
            let mut guard = self.reorder.lock().await;
            let reorder = &mut *guard;
            reorder.ready.insert(key, value.clone());
            while let Some(v) = reorder.ready.remove(&reorder.next) {
                reorder.next += 1;
                if !self.is_producing() {
                    break;
                }
                if let Err(e) = self.consumer.write(v).await {
                    self.fail(format!("{e:#}"));
                    break;
                }
            }
            Some(value)
        }
    }

    /// Runs `f` on the pool given to [`blocking`](Self::blocking) and produces its result.
    pub fn produce_blocking<F>(&self, f: F) -> impl Future<Output = Option<Value>> + '_
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.produce_item(async move {
            let pool = pool.ok_or_else(|| anyhow!("no blocking pool to produce on"))?;
            pool.run(f).await?
        })
    }

    pub fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    /// Waits for outstanding items, writes whatever is still buffered in order, and
    /// finishes the consumer. Reports the first failure, if any.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.pending.defer_to_all(None).await;
        let still_producing = self.producing.swap(false, Ordering::SeqCst);
        let leftover = std::mem::take(&mut self.reorder.lock().await.ready);
        if still_producing && !leftover.is_empty() {
            tracing::debug!(items = leftover.len(), "writing items buffered behind a gap");
            for (_, v) in leftover {
                if let Err(e) = self.consumer.write(v).await {
                    self.fail(format!("{e:#}"));
                    break;
                }
            }
        }
        self.consumer.finish().await;
        match self.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(text) => Err(anyhow!(text)),
            None => Ok(()),
        }
    }

    fn fail(&self, text: String) {
        self.producing.store(false, Ordering::SeqCst);
        tracing::warn!(error = %text, "ordered production stopped");
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(text);
    }
}
