//! # Push-style consumers.
//!
//! A [`Consumer`] receives the items of a sequence one at a time. The producer awaits each
//! `write` before fetching the next item, so a slow consumer throttles the worker.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::iteration::ProducerHandle;

/// Receiver side of the push adapter.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Accepts one item. Returning an error stops the producer.
    async fn write(&self, item: Value) -> anyhow::Result<()>;

    /// Called once before the first item, with a handle to pause or stop the producer.
    fn register(&self, _producer: ProducerHandle) {}

    /// Called after the last item was written.
    async fn finish(&self) {}
}

/// Collects everything written to it.
#[derive(Clone, Debug, Default)]
pub struct ListConsumer {
    items: Arc<Mutex<Vec<Value>>>,
}

impl ListConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the items received so far.
    pub fn items(&self) -> Vec<Value> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Consumer for ListConsumer {
    async fn write(&self, item: Value) -> anyhow::Result<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        Ok(())
    }
}
