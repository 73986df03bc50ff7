//! # Push adapter: async sequence → consumer.
//!
//! ```text
//! loop {
//!   wait while paused (backoff-polled)
//!   stopped?            ─► break
//!   item = seq.next()   ─► None ─► break
//!   consumer.write(item).await   (backpressure: next fetch waits for this)
//! }
//! consumer.finish()
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::iteration::{AsyncSequence, Consumer};
use crate::policies::BackoffPolicy;
use crate::sync::Delay;

#[derive(Default)]
struct Flags {
    paused: AtomicBool,
    stopped: AtomicBool,
}

/// Controls a running [`IterationProducer`] from the consumer side.
#[derive(Clone, Default)]
pub struct ProducerHandle {
    flags: Arc<Flags>,
}

impl ProducerHandle {
    /// Holds further fetches until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    /// Ends production after the item in progress; remaining items are never fetched.
    pub fn stop(&self) {
        self.flags.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("paused", &self.is_paused())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Drains an [`AsyncSequence`] into a [`Consumer`], one item at a time.
pub struct IterationProducer {
    seq: AsyncSequence,
    consumer: Arc<dyn Consumer>,
    handle: ProducerHandle,
    poll: BackoffPolicy,
}

impl IterationProducer {
    pub fn new(seq: AsyncSequence, consumer: Arc<dyn Consumer>) -> Self {
        Self {
            seq,
            consumer,
            handle: ProducerHandle::default(),
            poll: BackoffPolicy::default(),
        }
    }

    /// Backoff used while paused.
    pub fn with_poll(mut self, poll: BackoffPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn handle(&self) -> ProducerHandle {
        self.handle.clone()
    }

    /// Runs to the end of the sequence (or until stopped) and returns the number of items
    /// written. A failed `write` ends production with that error.
    pub async fn run(mut self) -> anyhow::Result<usize> {
        self.consumer.register(self.handle.clone());
        let delay = Delay::new(self.poll);
        let mut written = 0usize;
        loop {
            if self.handle.is_paused() {
                let flags = &self.handle.flags;
                delay
                    .until(|| {
                        !flags.paused.load(Ordering::SeqCst) || flags.stopped.load(Ordering::SeqCst)
                    })
                    .await;
            }
            if self.handle.is_stopped() {
                break;
            }
            let Some(item) = self.seq.next().await else {
                break;
            };
            self.consumer.write(item).await?;
            written += 1;
        }
        self.consumer.finish().await;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::{IterSource, ListConsumer};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn seq(n: i64) -> AsyncSequence {
        let iter = (1..=n).map(Value::from);
        AsyncSequence::with_head(json!(0), Box::new(IterSource::new(Box::new(iter))))
    }

    #[tokio::test]
    async fn delivers_every_item_in_order() {
        let list = ListConsumer::new();
        let n = IterationProducer::new(seq(3), Arc::new(list.clone()))
            .run()
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(list.items(), vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    /// Stops the producer after taking two items.
    #[derive(Default)]
    struct TakeTwo {
        handle: Mutex<Option<ProducerHandle>>,
        seen: Mutex<Vec<Value>>,
        finished: AtomicBool,
    }

    #[async_trait]
    impl Consumer for TakeTwo {
        async fn write(&self, item: Value) -> anyhow::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(item);
            if seen.len() == 2 {
                if let Some(h) = self.handle.lock().unwrap().as_ref() {
                    h.stop();
                }
            }
            Ok(())
        }

        fn register(&self, producer: ProducerHandle) {
            *self.handle.lock().unwrap() = Some(producer);
        }

        async fn finish(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn consumer_can_stop_the_producer() {
        let consumer = Arc::new(TakeTwo::default());
        let n = IterationProducer::new(seq(10), consumer.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(consumer.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn paused_producer_waits_for_resume() {
        let list = ListConsumer::new();
        let producer = IterationProducer::new(seq(2), Arc::new(list.clone()));
        let handle = producer.handle();
        handle.pause();
        let run = tokio::spawn(producer.run());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(list.is_empty());
        handle.resume();
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 3);
    }

    struct Failing;

    #[async_trait]
    impl Consumer for Failing {
        async fn write(&self, _item: Value) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn write_error_ends_production() {
        let err = IterationProducer::new(seq(3), Arc::new(Failing))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }
}
