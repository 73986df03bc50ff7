//! # Backoff polling.
//!
//! [`Delay`] waits for a condition that cannot be awaited directly by checking it
//! repeatedly, sleeping between checks for an interval that grows by
//! [`BackoffPolicy::factor`] up to [`BackoffPolicy::max`].
//!
//! ```text
//! check ─► ready? ── yes ─► done
//!            │ no
//!            ▼
//!      yield once ─► check ─► ready? ── yes ─► done
//!                               │ no
//!                               ▼
//!                   timed out? ── yes ─► give up
//!                               │ no
//!                               ▼
//!                      sleep(policy.next(n)), n += 1, check again
//! ```
//!
//! The first re-check happens after a bare yield, so very fast events cost almost nothing.

use std::time::Duration;

use tokio::time::Instant;

use crate::policies::BackoffPolicy;

/// Growing-interval poller with an optional overall timeout.
#[derive(Clone, Copy, Debug)]
pub struct Delay {
    policy: BackoffPolicy,
    timeout: Option<Duration>,
}

impl Delay {
    /// Creates a poller without a timeout.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            timeout: None,
        }
    }

    /// Returns a copy that gives up after `timeout` (`None` waits forever).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Polls `check` until it yields a value, or returns `None` on timeout.
    pub async fn poll<T>(&self, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        if let Some(v) = check() {
            return Some(v);
        }
        let started = Instant::now();
        tokio::task::yield_now().await;

        let mut attempt: u32 = 0;
        loop {
            if let Some(v) = check() {
                return Some(v);
            }
            let mut wait = self.policy.next(attempt);
            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return None;
                }
                wait = wait.min(limit - elapsed);
            }
            tokio::time::sleep(wait).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Polls `event` until it is true. Returns `false` if the timeout hit first.
    pub async fn until(&self, mut event: impl FnMut() -> bool) -> bool {
        self.poll(|| event().then_some(())).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn already_true_returns_without_waiting() {
        let delay = Delay::new(BackoffPolicy::default());
        assert!(delay.until(|| true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let delay = Delay::new(BackoffPolicy::default())
            .with_timeout(Some(Duration::from_millis(200)));
        let t0 = Instant::now();
        assert!(!delay.until(|| false).await);
        assert!(t0.elapsed() >= Duration::from_millis(200));
        assert!(t0.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_the_checked_value() {
        let calls = AtomicU32::new(0);
        let delay = Delay::new(BackoffPolicy::default());
        let got = delay
            .poll(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                (n >= 5).then_some(n * 10)
            })
            .await;
        assert_eq!(got, Some(50));
    }
}
