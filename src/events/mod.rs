//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `TaskScheduler` (submission, results, retries, shutdown), the worker
//!   roster (dispatch, attach/detach, timeouts) and `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the scheduler's subscriber listener, which fans out to `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
