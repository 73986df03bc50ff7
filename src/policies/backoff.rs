//! # Backoff policy for polling waits.
//!
//! [`BackoffPolicy`] controls how the interval between two checks of a condition grows
//! while a cooperative wait is in progress (see [`Delay`](crate::sync::Delay)).
//! It is parameterized by:
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::first`] the initial interval;
//! - [`BackoffPolicy::max`] the interval cap.
//!
//! The interval before check `n` is `first × factor^n`, clamped to `max`. The interval is
//! derived purely from the check number, so rounding never accumulates across checks.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use workheap::BackoffPolicy;
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 1.25,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(1), Duration::from_millis(125));
//! assert_eq!(backoff.next(1000), Duration::from_secs(10));
//! ```

use std::time::Duration;

use crate::error::RuntimeError;

/// Polling backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Interval before the first re-check.
    pub first: Duration,
    /// Maximum interval between checks.
    pub max: Duration,
    /// Multiplicative growth factor, kept within `1.0..=1.3`.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `first = 1ms`;
    /// - `factor = 1.10`;
    /// - `max = 1s`.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(1),
            max: Duration::from_secs(1),
            factor: 1.10,
        }
    }
}

impl BackoffPolicy {
    /// Lowest accepted growth factor.
    pub const MIN_FACTOR: f64 = 1.0;
    /// Highest accepted growth factor.
    pub const MAX_FACTOR: f64 = 1.3;

    /// Computes the interval before check `attempt` (0-indexed).
    ///
    /// The result is `first × factor^attempt`, clamped to [`BackoffPolicy::max`].
    /// Non-finite or negative intermediate values clamp to `max` as well.
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }

    /// Rejects factors outside `1.0..=1.3` and a zero cap.
    ///
    /// Factors below 1 make the wait spin faster the longer it lasts; factors above 1.3
    /// make slow responses wait far longer than they took.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !(Self::MIN_FACTOR..=Self::MAX_FACTOR).contains(&self.factor) {
            return Err(RuntimeError::InvalidConfig {
                reason: format!(
                    "unworkable backoff factor {:.3}, keep it in 1.0-1.3 range",
                    self.factor
                ),
            });
        }
        if self.max.is_zero() {
            return Err(RuntimeError::InvalidConfig {
                reason: "backoff max interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}
