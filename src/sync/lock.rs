//! # Priority-aware mutual exclusion with a VIP lane and graceful stop.
//!
//! [`PriorityLock`] serializes access to a single-task resource (a worker). While it is
//! held, requesters queue in one of two FIFO lanes; the VIP lane is always served first.
//!
//! ```text
//!               acquire(vip=true)             acquire(vip=false)
//!                      │                             │
//!                      ▼                             ▼
//!   release ──► [ VIP1 VIP2 ... ] ──then──► [ N1 N2 N3 ... ]
//! ```
//!
//! ## Stop
//! [`PriorityLock::stop`] marks the lock not running, so every later `acquire` resolves at
//! once with a no-op guard. It then queues behind everyone already waiting, runs the
//! registered stoppers in order once it holds the lock, and releases for the last time.
//!
//! ## Cancellation
//! Dropping a pending `acquire` future is safe: if the lock was already handed to it,
//! the hand-off is passed on to the next waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

type Stopper = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct LockState {
    locked: bool,
    running: bool,
    vip: VecDeque<oneshot::Sender<()>>,
    normal: VecDeque<oneshot::Sender<()>>,
    stoppers: Vec<Stopper>,
}

/// Lock with a VIP fast lane; cheap to clone (shared state).
#[derive(Clone)]
pub struct PriorityLock {
    state: Arc<Mutex<LockState>>,
}

impl Default for PriorityLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PriorityLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("PriorityLock")
            .field("locked", &st.locked)
            .field("running", &st.running)
            .field("vip", &st.vip.len())
            .field("normal", &st.normal.len())
            .finish()
    }
}

impl PriorityLock {
    /// Creates an unlocked, running lock.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                locked: false,
                running: true,
                vip: VecDeque::new(),
                normal: VecDeque::new(),
                stoppers: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock, queueing in the VIP lane when `vip` is set.
    ///
    /// On a stopped lock this returns immediately with a guard whose drop does nothing.
    pub async fn acquire(&self, vip: bool) -> LockGuard {
        let rx = {
            let mut st = self.state();
            if !st.running {
                return LockGuard { lock: None };
            }
            if !st.locked {
                st.locked = true;
                return LockGuard {
                    lock: Some(self.clone()),
                };
            }
            let (tx, rx) = oneshot::channel();
            if vip {
                st.vip.push_back(tx);
            } else {
                st.normal.push_back(tx);
            }
            rx
        };
        Waiter {
            rx: Some(rx),
            lock: self.clone(),
        }
        .wait()
        .await
    }

    /// Registers a callback to run (awaited, in registration order) when the lock stops.
    pub fn add_stopper<F, Fut>(&self, stopper: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.state()
            .stoppers
            .push(Box::new(move || stopper().boxed()));
    }

    /// Drains the current holder and every queued requester, runs the stoppers, then
    /// stops gate-keeping entirely. A second call returns at once.
    pub async fn stop(&self) {
        let rx = {
            let mut st = self.state();
            if !st.running {
                return;
            }
            st.running = false;
            if st.locked {
                let (tx, rx) = oneshot::channel();
                st.normal.push_back(tx);
                Some(rx)
            } else {
                st.locked = true;
                None
            }
        };
        let guard = match rx {
            Some(rx) => {
                Waiter {
                    rx: Some(rx),
                    lock: self.clone(),
                }
                .wait()
                .await
            }
            None => LockGuard {
                lock: Some(self.clone()),
            },
        };

        let stoppers = std::mem::take(&mut self.state().stoppers);
        for stopper in stoppers {
            stopper().await;
        }
        drop(guard);
    }

    /// Whether the lock still gate-keeps (has not begun stopping).
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Whether some holder currently owns the lock.
    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Number of queued requesters across both lanes.
    pub fn waiting(&self) -> usize {
        let st = self.state();
        st.vip.len() + st.normal.len()
    }

    /// Passes ownership to the next live waiter, or unlocks.
    fn hand_off(&self) {
        let mut st = self.state();
        loop {
            let next = match st.vip.pop_front() {
                Some(tx) => Some(tx),
                None => st.normal.pop_front(),
            };
            match next {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    st.locked = false;
                    return;
                }
            }
        }
    }
}

/// Ownership of a [`PriorityLock`]; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: Option<PriorityLock>,
}

impl LockGuard {
    /// Releases explicitly (same as dropping).
    pub fn release(self) {}

    /// Whether this guard came from a stopped lock and guards nothing.
    pub fn is_noop(&self) -> bool {
        self.lock.is_none()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.hand_off();
        }
    }
}

struct Waiter {
    rx: Option<oneshot::Receiver<()>>,
    lock: PriorityLock,
}

impl Waiter {
    async fn wait(mut self) -> LockGuard {
        let granted = match self.rx.as_mut() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        };
        self.rx = None;
        if granted {
            LockGuard {
                lock: Some(self.lock.clone()),
            }
        } else {
            LockGuard { lock: None }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.lock.hand_off();
            }
        }
    }
}
