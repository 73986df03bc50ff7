//! Scheduling and failure policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how polling intervals grow (first / factor / max)
//! - [`Niceness`]      UNIX-style priority bias turned into a heap-key weight
//! - [`FailurePolicy`] what a call error does to the scheduler (stop / warn / return)
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → first=1ms, factor=1.10, max=1s.
//! - `Niceness::NORMAL` → 0, weight 1.0.
//! - `FailurePolicy::Stop` (fail-fast).

mod backoff;
mod failure;
mod niceness;

pub use backoff::BackoffPolicy;
pub use failure::FailurePolicy;
pub use niceness::Niceness;
