//! # Consumer that feeds blocking code.
//!
//! A [`Consumerator`] is a [`Consumer`] on the loop side and a plain iterator
//! ([`BlockingItems`]) on a pool thread. A bounded channel sits between the two, so a
//! producer writing faster than the blocking side reads waits in `write`.
//!
//! ```text
//! IterationProducer ─► Consumerator::write ─► [bounded channel] ─► BlockingItems ─► f(items) on BlockingPool
//!                      Consumerator::finish ─► channel closed   ─► iterator ends ─► f returns
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PoolError;
use crate::iteration::Consumer;
use crate::threads::BlockingPool;

/// Loop-side half: written items go to the blocking iterator.
pub struct Consumerator {
    tx: Mutex<Option<mpsc::Sender<Value>>>,
    rx: Mutex<Option<mpsc::Receiver<Value>>>,
}

/// Blocking iterator over the items written to a [`Consumerator`].
pub struct BlockingItems {
    rx: mpsc::Receiver<Value>,
}

impl Iterator for BlockingItems {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.rx.blocking_recv()
    }
}

impl Consumerator {
    /// Consumerator buffering at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Shared form, ready for [`crate::TaskSpec::with_consumer`].
    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Hands the item iterator out once.
    pub fn items(&self) -> Result<BlockingItems, PoolError> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| BlockingItems { rx })
            .ok_or(PoolError::AlreadyConsuming)
    }

    /// Runs `f` over the written items on `pool`. The handle resolves with `f`'s result
    /// after [`Consumer::finish`] and once `f` has returned.
    pub fn consume_with<F, R>(
        &self,
        pool: &BlockingPool,
        f: F,
    ) -> Result<JoinHandle<Result<R, PoolError>>, PoolError>
    where
        F: FnOnce(BlockingItems) -> R + Send + 'static,
        R: Send + 'static,
    {
        let items = self.items()?;
        let pool = pool.clone();
        Ok(tokio::spawn(async move { pool.run(move || f(items)).await }))
    }

    fn sender(&self) -> Option<mpsc::Sender<Value>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Consumer for Consumerator {
    async fn write(&self, item: Value) -> anyhow::Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| anyhow!("consumerator already finished"))?;
        tx.send(item)
            .await
            .map_err(|_| anyhow!("blocking consumer stopped reading"))
    }

    async fn finish(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::{IterSource, IterationProducer};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_side_sees_every_item() {
        let pool = BlockingPool::new(1);
        pool.start();
        let sink = Consumerator::shared(1);
        let sum = sink
            .consume_with(&pool, |items| {
                items.map(|v| v.as_i64().unwrap_or_default()).sum::<i64>()
            })
            .unwrap();

        let seq = crate::iteration::prefetch(Box::new(IterSource::new(Box::new(
            (1..=10).map(|i| json!(i)),
        ))))
        .await;
        let written = IterationProducer::new(seq, sink.clone()).run().await.unwrap();

        assert_eq!(written, 10);
        assert_eq!(sum.await.unwrap(), Ok(55));
    }

    #[tokio::test]
    async fn items_handed_out_once() {
        let sink = Consumerator::new(4);
        assert!(sink.items().is_ok());
        assert!(matches!(sink.items(), Err(PoolError::AlreadyConsuming)));
    }

    #[tokio::test]
    async fn write_after_finish_fails() {
        let sink = Consumerator::new(4);
        sink.finish().await;
        assert!(sink.write(json!(1)).await.is_err());
    }
}
