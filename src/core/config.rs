//! # Scheduler configuration.
//!
//! [`Config`] is plain data with public fields. It is read in two places:
//! 1. **Scheduler creation**: `SchedulerBuilder::new(config)` / `TaskScheduler::new(config)`
//! 2. **Submission defaults**: `TaskSpec::with_defaults(call, &config)`
//!
//! Worker back-ends take `&Config` at construction for their transport settings.
//!
//! ## Sentinel values
//! - `timeout = 0s` → no default per-task timeout
//! - `stop_grace = 0s` → an error-triggered stop happens on the next tick

use std::time::Duration;

use crate::error::RuntimeError;
use crate::policies::{BackoffPolicy, FailurePolicy};

/// Settings for a [`TaskScheduler`](crate::TaskScheduler) and its workers.
#[derive(Clone, Debug)]
pub struct Config {
    /// What a failed call does to the scheduler and to its caller.
    pub failure: FailurePolicy,

    /// Delay between a failed call (under [`FailurePolicy::Stop`]) and the shutdown it triggers.
    pub stop_grace: Duration,

    /// Default per-task timeout; `Duration::ZERO` means none.
    ///
    /// A task that times out is retried once, rushed. A second timeout is terminal.
    pub timeout: Duration,

    /// How long a thread worker waits for its thread to answer a call.
    pub thread_timeout: Duration,

    /// How long `detach_worker` waits for a worker to stop before crashing it.
    pub worker_stop_timeout: Duration,

    /// Handed to the roster's shutdown when the dispatch loop exits.
    pub loop_shutdown_timeout: Duration,

    /// Backoff for polling waits (tracker waits, process transport replies).
    pub poll: BackoffPolicy,

    /// Process workers: string results longer than this travel in chunks.
    pub chunk_size: usize,

    /// Capacity of the event bus ring buffer (min 1).
    pub bus_capacity: usize,
}

impl Config {
    /// Default per-task timeout as an `Option`.
    #[inline]
    pub fn default_timeout(&self) -> Option<Duration> {
        if self.timeout == Duration::ZERO {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Rejects values no scheduler can run with.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.poll.validate()?;
        if self.thread_timeout == Duration::ZERO {
            return Err(RuntimeError::InvalidConfig {
                reason: "thread_timeout must be positive".into(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    /// - `failure = Stop`, `stop_grace = 1s`
    /// - `timeout = 0s` (none), `thread_timeout = 60s`
    /// - `worker_stop_timeout = 30s`, `loop_shutdown_timeout = 30s`
    /// - `poll = BackoffPolicy::default()` (1ms × 1.10, capped at 1s)
    /// - `chunk_size = 64 KiB`, `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            stop_grace: Duration::from_secs(1),
            timeout: Duration::ZERO,
            thread_timeout: Duration::from_secs(60),
            worker_stop_timeout: Duration::from_secs(30),
            loop_shutdown_timeout: Duration::from_secs(30),
            poll: BackoffPolicy::default(),
            chunk_size: 64 * 1024,
            bus_capacity: 1024,
        }
    }
}
