//! # Counting outstanding async operations.
//!
//! [`OpTracker`] lets unrelated code wait for "all", "any" or "all but n" of a set of
//! operations to finish, without holding the operations themselves. The waits are
//! backoff-polled ([`Delay`]) against a shared counter.
//!
//! ```text
//!   put(fut) / track(fut) / guard()      count += 1
//!        └── future resolves / guard drops   count -= 1
//!
//!   defer_to_all         ─► wait until count == 0
//!   defer_to_any         ─► wait until count < count_at_call
//!   defer_until_fewer(n) ─► wait until count < n
//!   quit_waiting         ─► count = quit; every wait returns true at once
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::policies::BackoffPolicy;
use crate::sync::Delay;

/// Shared counter of outstanding operations. `None` once quit.
#[derive(Clone, Debug)]
pub struct OpTracker {
    count: Arc<Mutex<Option<usize>>>,
    poll: BackoffPolicy,
}

impl Default for OpTracker {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl OpTracker {
    /// Creates a tracker whose waits poll with `poll`.
    pub fn new(poll: BackoffPolicy) -> Self {
        Self {
            count: Arc::new(Mutex::new(Some(0))),
            poll,
        }
    }

    fn count(&self) -> MutexGuard<'_, Option<usize>> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outstanding operations, or `None` after [`quit_waiting`](Self::quit_waiting).
    pub fn outstanding(&self) -> Option<usize> {
        *self.count()
    }

    /// Counts one operation until the returned guard drops.
    pub fn guard(&self) -> TrackGuard {
        if let Some(n) = self.count().as_mut() {
            *n += 1;
        }
        TrackGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Wraps `fut` so it is counted while pending. The output is passed through untouched.
    pub fn track<F>(&self, fut: F) -> impl Future<Output = F::Output> + Send
    where
        F: Future + Send,
    {
        let guard = self.guard();
        async move {
            let out = fut.await;
            drop(guard);
            out
        }
    }

    /// Spawns `fut` and counts it until it resolves.
    pub fn put<F>(&self, fut: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let tracked = self.track(fut);
        tokio::spawn(async move {
            let _ = tracked.await;
        });
    }

    /// Waits until nothing is outstanding. Returns `false` on timeout.
    pub async fn defer_to_all(&self, timeout: Option<Duration>) -> bool {
        self.wait(timeout, |n| n == 0).await
    }

    /// Waits until at least one operation outstanding now has finished.
    /// Returns `true` at once when nothing is outstanding.
    pub async fn defer_to_any(&self, timeout: Option<Duration>) -> bool {
        let start = match self.outstanding() {
            None | Some(0) => return true,
            Some(n) => n,
        };
        self.wait(timeout, move |n| n < start).await
    }

    /// Waits until fewer than `n` operations are outstanding.
    pub async fn defer_until_fewer(&self, n: usize, timeout: Option<Duration>) -> bool {
        self.wait(timeout, move |c| c < n).await
    }

    /// Makes every current and future wait return `true` immediately.
    pub fn quit_waiting(&self) {
        *self.count() = None;
    }

    async fn wait(&self, timeout: Option<Duration>, ready: impl Fn(usize) -> bool) -> bool {
        Delay::new(self.poll)
            .with_timeout(timeout)
            .until(|| match *self.count() {
                None => true,
                Some(n) => ready(n),
            })
            .await
    }
}

/// Keeps one operation counted until dropped.
#[derive(Debug)]
pub struct TrackGuard {
    count: Arc<Mutex<Option<usize>>>,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = count.as_mut() {
            *n = n.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn track_passes_value_through() {
        let tracker = OpTracker::default();
        let fut = tracker.track(async { 41 + 1 });
        assert_eq!(tracker.outstanding(), Some(1));
        assert_eq!(fut.await, 42);
        assert_eq!(tracker.outstanding(), Some(0));
    }

    #[tokio::test]
    async fn defer_to_all_waits_for_every_put() {
        let tracker = OpTracker::default();
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();
        tracker.put(rx1);
        tracker.put(rx2);
        assert_eq!(tracker.outstanding(), Some(2));

        assert!(!tracker.defer_to_all(Some(Duration::from_millis(20))).await);
        tx1.send(()).unwrap();
        assert!(tracker.defer_to_any(Some(Duration::from_secs(1))).await);
        assert!(tracker.defer_until_fewer(2, Some(Duration::from_secs(1))).await);
        drop(tx2);
        assert!(tracker.defer_to_all(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn quit_releases_all_waits() {
        let tracker = OpTracker::default();
        let _held = tracker.guard();
        let t = tracker.clone();
        let waiting = tokio::spawn(async move { t.defer_to_all(None).await });
        tokio::task::yield_now().await;
        tracker.quit_waiting();
        assert!(waiting.await.unwrap());
        assert_eq!(tracker.outstanding(), None);
    }

    #[tokio::test]
    async fn counter_never_goes_negative() {
        let tracker = OpTracker::default();
        let g = tracker.guard();
        tracker.quit_waiting();
        drop(g);
        assert_eq!(tracker.outstanding(), None);
    }
}
