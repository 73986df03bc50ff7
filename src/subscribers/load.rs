//! # Load monitor.
//!
//! [`LoadMonitor`] follows `LoadChanged` events and republishes the number of
//! submitted-but-unresolved tasks on a `watch` channel, so callers can await a level
//! instead of polling.
//!
//! ```rust,no_run
//! # async fn demo(sched: workheap::TaskScheduler, monitor: workheap::LoadMonitor) {
//! let mut load = monitor.watch();
//! while *load.borrow() > 100 {
//!     if load.changed().await.is_err() { break; }
//! }
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Latest scheduler load; cheap to clone.
#[derive(Clone, Debug)]
pub struct LoadMonitor {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Load as of the last event processed.
    pub fn current(&self) -> usize {
        *self.tx.borrow()
    }

    /// Receiver notified on every change.
    pub fn watch(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Subscribe for LoadMonitor {
    async fn on_event(&self, event: &Event) {
        if let (EventKind::LoadChanged, Some(load)) = (event.kind, event.load) {
            self.tx.send_replace(load);
        }
    }

    fn name(&self) -> &'static str {
        "load"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn follows_load_events_only() {
        let monitor = LoadMonitor::new();
        let mut rx = monitor.watch();
        monitor
            .on_event(&Event::new(EventKind::LoadChanged).with_load(4))
            .await;
        monitor.on_event(&Event::new(EventKind::TaskQueued)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 4);
        assert_eq!(monitor.current(), 4);
    }
}
