//! # Dispatch loop: heap → handler.
//!
//! [`DispatchLoop`] is one spawned task that repeatedly takes the next item from an
//! [`AsyncPriorityHeap`] and awaits [`Handler::handle`] on it.
//!
//! ```text
//! Running ──request_shutdown()──► Draining ──sentinel taken──► Stopped
//!
//! loop {
//!   ├─► item = heap.take().await
//!   │     ├─ Sentinel / QueueError ─► break
//!   │     └─ Item(t) ─► handler.handle(t).await
//!   │                     ├─ Ok        ─► continue
//!   │                     ├─ Err(e)    ─► warn!, continue
//!   │                     └─ panic     ─► error!, continue
//!   └─ on exit: unhandled = handler.shutdown(timeout).await; heap.shutdown()
//! }
//! ```
//!
//! The loop never stops because of a handler outcome; only the sentinel ends it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::core::heap::{AsyncPriorityHeap, Slot};

/// Receives items taken from the heap.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    /// Handles one item. Errors are logged by the loop and otherwise ignored.
    async fn handle(&self, item: T) -> anyhow::Result<()>;

    /// Called once when the loop exits; returns items that were never handled.
    async fn shutdown(&self, timeout: Duration) -> Vec<T>;
}

/// Lifecycle of a [`DispatchLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Taking and handling items.
    Running,
    /// Sentinel queued; items ahead of it are still handled.
    Draining,
    /// Exited.
    Stopped,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Running,
            1 => LoopState::Draining,
            _ => LoopState::Stopped,
        }
    }
}

/// Handle to the spawned dispatch task.
pub struct DispatchLoop<T: Send + 'static> {
    heap: Arc<AsyncPriorityHeap<T>>,
    state: Arc<AtomicU8>,
    join: Mutex<Option<JoinHandle<Vec<T>>>>,
}

impl<T: Send + 'static> DispatchLoop<T> {
    /// Spawns the loop. `shutdown_timeout` is handed to [`Handler::shutdown`].
    pub fn spawn(
        heap: Arc<AsyncPriorityHeap<T>>,
        handler: Arc<dyn Handler<T>>,
        shutdown_timeout: Duration,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(LoopState::Running as u8));
        let join = tokio::spawn(Self::run(
            Arc::clone(&heap),
            handler,
            shutdown_timeout,
            Arc::clone(&state),
        ));
        Self {
            heap,
            state,
            join: Mutex::new(Some(join)),
        }
    }

    async fn run(
        heap: Arc<AsyncPriorityHeap<T>>,
        handler: Arc<dyn Handler<T>>,
        shutdown_timeout: Duration,
        state: Arc<AtomicU8>,
    ) -> Vec<T> {
        loop {
            let item = match heap.take().await {
                Ok(Slot::Item(item)) => item,
                Ok(Slot::Sentinel) => break,
                Err(e) => {
                    tracing::debug!(reason = e.as_label(), "dispatch loop: heap closed");
                    break;
                }
            };
            let outcome = std::panic::AssertUnwindSafe(handler.handle(item))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), "dispatch handler failed"),
                Err(_) => tracing::error!("dispatch handler panicked"),
            }
        }

        let unhandled = handler.shutdown(shutdown_timeout).await;
        heap.shutdown();
        state.store(LoopState::Stopped as u8, Ordering::SeqCst);
        unhandled
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Queues the sentinel and waits for the loop to exit, returning what the handler's
    /// shutdown returned. Later calls return an empty list.
    pub async fn request_shutdown(&self) -> Vec<T> {
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(join) = join else {
            return Vec::new();
        };
        let _ = self.state.compare_exchange(
            LoopState::Running as u8,
            LoopState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.heap.put_sentinel();
        match join.await {
            Ok(unhandled) => unhandled,
            Err(e) => {
                tracing::error!(error = %e, "dispatch loop task failed");
                self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
                Vec::new()
            }
        }
    }
}
