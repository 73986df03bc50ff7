//! Cooperative synchronization primitives.
//!
//! - [`Delay`]       backoff polling for conditions that cannot be awaited directly
//! - [`PriorityLock`] single-holder lock with a VIP lane and drain-then-stop
//! - [`OpTracker`]   counter of outstanding async operations with all/any/fewer waits
//!
//! Every wait here yields to the runtime; none blocks a thread.

mod delay;
mod lock;
mod tracker;

pub use delay::Delay;
pub use lock::{LockGuard, PriorityLock};
pub use tracker::{OpTracker, TrackGuard};
