//! # Task submission specification.
//!
//! [`TaskSpec`] bundles everything a caller chooses when submitting a call:
//! niceness, series, rush/relax, timeout, a failure policy override, and an optional
//! push consumer for sequence results. Pass it to [`TaskScheduler::submit`](crate::TaskScheduler::submit).
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use workheap::{Call, Callable, Config, Output, TaskSpec};
//!
//! let noop = Callable::new("noop", |_, _| Ok(Output::none()));
//!
//! let spec = TaskSpec::new(Call::new(noop.clone()))
//!     .with_series("reports")
//!     .with_niceness(5)
//!     .with_timeout(Duration::from_secs(2));
//! assert_eq!(spec.niceness(), 5);
//!
//! // Inherit the default timeout from config (`0s` is treated as none). Specs that
//! // never call `with_timeout` get the scheduler's default on submit as well.
//! let spec2 = TaskSpec::with_defaults(Call::new(noop), &Config::default());
//! assert!(spec2.timeout().is_none());
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::core::Config;
use crate::iteration::Consumer;
use crate::policies::FailurePolicy;
use crate::tasks::{Call, Series};

/// Forced placement in the heap, overriding the computed key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
    /// Key from series serial and niceness.
    #[default]
    Normal,
    /// Ahead of everything.
    Rush,
    /// Behind everything.
    Relax,
}

/// What to run and how to schedule it.
#[derive(Clone)]
pub struct TaskSpec {
    call: Call,
    niceness: i32,
    series: Option<Series>,
    placement: Placement,
    timeout: Option<Duration>,
    failure: Option<FailurePolicy>,
    consumer: Option<Arc<dyn Consumer>>,
}

/// A spec resolved against the scheduler config.
pub(crate) struct SpecParts {
    pub call: Call,
    pub niceness: i32,
    pub series: Option<Series>,
    pub placement: Placement,
    pub timeout: Option<Duration>,
    pub failure: Option<FailurePolicy>,
    pub consumer: Option<Arc<dyn Consumer>>,
}

impl TaskSpec {
    /// Normal niceness, anonymous series, the scheduler's default timeout.
    pub fn new(call: Call) -> Self {
        Self {
            call,
            niceness: 0,
            series: None,
            placement: Placement::Normal,
            timeout: None,
            failure: None,
            consumer: None,
        }
    }

    /// Like [`new`](Self::new), with the timeout taken from `cfg`.
    pub fn with_defaults(call: Call, cfg: &Config) -> Self {
        Self {
            timeout: cfg.default_timeout(),
            ..Self::new(call)
        }
    }

    /// UNIX-style niceness, validated on submit (`-20..=20`).
    pub fn with_niceness(mut self, niceness: i32) -> Self {
        self.niceness = niceness;
        self
    }

    pub fn with_series(mut self, series: impl Into<Series>) -> Self {
        self.series = Some(series.into());
        self
    }

    /// Serve next, ahead of everything queued.
    pub fn rush(mut self) -> Self {
        self.placement = Placement::Rush;
        self
    }

    /// Serve after everything queued.
    pub fn relax(mut self) -> Self {
        self.placement = Placement::Relax;
        self
    }

    /// Per-attempt timeout; a zero duration means none, even if the scheduler has a
    /// default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the scheduler's [`FailurePolicy`] for this task alone.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure = Some(policy);
        self
    }

    /// Pushes a sequence result into `consumer` instead of returning it.
    pub fn with_consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn niceness(&self) -> i32 {
        self.niceness
    }

    pub fn series(&self) -> Option<&Series> {
        self.series.as_ref()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// The explicit timeout, if one was set and is non-zero.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    pub fn failure_policy(&self) -> Option<FailurePolicy> {
        self.failure
    }

    /// Fills unset fields from `cfg`.
    pub(crate) fn into_parts(self, cfg: &Config) -> SpecParts {
        let timeout = match self.timeout {
            Some(t) => (!t.is_zero()).then_some(t),
            None => cfg.default_timeout(),
        };
        SpecParts {
            call: self.call,
            niceness: self.niceness,
            series: self.series,
            placement: self.placement,
            timeout,
            failure: self.failure,
            consumer: self.consumer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Callable;
    use crate::tasks::Output;

    fn noop() -> Call {
        Call::new(Callable::new("noop", |_, _| Ok(Output::none())))
    }

    #[test]
    fn unset_timeout_falls_back_to_config() {
        let cfg = Config {
            timeout: Duration::from_millis(300),
            ..Config::default()
        };
        let parts = TaskSpec::new(noop()).into_parts(&cfg);
        assert_eq!(parts.timeout, Some(Duration::from_millis(300)));

        let parts = TaskSpec::new(noop()).with_timeout(Duration::ZERO).into_parts(&cfg);
        assert_eq!(parts.timeout, None);

        let parts = TaskSpec::new(noop())
            .with_timeout(Duration::from_millis(20))
            .into_parts(&cfg);
        assert_eq!(parts.timeout, Some(Duration::from_millis(20)));
    }

    #[test]
    fn failure_policy_is_carried() {
        let parts = TaskSpec::new(noop())
            .with_failure_policy(FailurePolicy::Return)
            .into_parts(&Config::default());
        assert_eq!(parts.failure, Some(FailurePolicy::Return));
    }
}
