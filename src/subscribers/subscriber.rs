//! # Event subscriber trait.
//!
//! [`Subscribe`] is the extension point for plugging event handlers into a scheduler.
//!
//! Each subscriber gets its own bounded queue and worker task inside a
//! [`SubscriberSet`](crate::SubscriberSet):
//!
//! ```text
//! SubscriberSet ──► [bounded queue] ──► worker task ──► subscriber.on_event()
//!                                    └─► panic caught → EventKind::SubscriberPanicked
//! ```
//!
//! ## Rules
//! - A slow subscriber only fills its own queue.
//! - Overflow drops the event for that subscriber only and publishes
//!   `EventKind::SubscriberOverflow`.
//! - Events reach one subscriber in FIFO order.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use workheap::{Event, EventKind, Subscribe};
//!
//! struct Retries;
//!
//! #[async_trait]
//! impl Subscribe for Retries {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::RetryScheduled) {
//!             // count it, alert, ...
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "retries" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
///
/// Use async I/O, handle errors internally and do not panic; a panic is caught and
/// published as `SubscriberPanicked`, and the worker moves on to the next event.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event, called from the subscriber's own worker task.
    async fn on_event(&self, event: &Event);

    /// Name used in logs and in overflow/panic events.
    ///
    /// The default uses `type_name::<Self>()`; override it with something short.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Queue capacity, clamped to at least 1. Default: 1024.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
