//! # What the scheduler does when a submitted call fails.
//!
//! - [`FailurePolicy::Stop`] log the failure, hand the caller the formatted text, and stop the
//!   whole scheduler after `Config::stop_grace` (default, fail-fast).
//! - [`FailurePolicy::Warn`] log the failure and hand the caller the formatted text.
//! - [`FailurePolicy::Return`] resolve the caller's future with [`TaskError::Call`](crate::TaskError::Call).

/// Policy for call errors reported by workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, then schedule a full scheduler stop (default).
    #[default]
    Stop,
    /// Log only; the scheduler keeps running.
    Warn,
    /// Surface a typed failure to the caller; nothing is logged above `debug`.
    Return,
}

impl FailurePolicy {
    /// Whether an error under this policy schedules a scheduler stop.
    #[inline]
    pub fn stops_scheduler(self) -> bool {
        matches!(self, FailurePolicy::Stop)
    }
}
