//! # Asynchronous priority heap.
//!
//! [`AsyncPriorityHeap`] is a min-heap of items keyed by [`Priority`] whose `take` is a
//! future: it resolves immediately when an item is available, otherwise the request
//! itself is queued and served by a later `put`.
//!
//! ```text
//! put(p, item) ──► heap ──► waiter pending? ── no ──► stays queued
//!                               │ yes
//!                               ▼
//!                 pop most recent waiter, hand it the heap MINIMUM
//!                 (not necessarily the item just inserted)
//! ```
//!
//! ## Rules
//! - Lower keys come out first; equal keys come out in insertion order.
//! - The shutdown sentinel sorts after every real item, including [`Priority::RELAX`].
//! - Pending takes are served most-recent-first.
//! - A dropped `take` future is skipped; the item goes to the next waiter or stays queued.
//! - After [`shutdown`](AsyncPriorityHeap::shutdown) pending and future takes on an
//!   empty heap fail with [`QueueError::Shutdown`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::QueueError;

/// Sort key of a heap entry. Lower is served sooner.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Priority(pub f64);

impl Priority {
    /// Ahead of everything.
    pub const RUSH: Priority = Priority(f64::NEG_INFINITY);
    /// Behind every real task.
    pub const RELAX: Priority = Priority(f64::INFINITY);

    /// Raw key value.
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::RUSH {
            f.write_str("rush")
        } else if *self == Self::RELAX {
            f.write_str("relax")
        } else {
            write!(f, "{:.3}", self.0)
        }
    }
}

/// What a take yields: a real item, or the loop-stopping sentinel.
#[derive(Debug, PartialEq)]
pub enum Slot<T> {
    /// A queued item.
    Item(T),
    /// The shutdown sentinel.
    Sentinel,
}

struct Entry<T> {
    sentinel: bool,
    priority: Priority,
    seq: u64,
    slot: Slot<T>,
}

impl<T> Entry<T> {
    fn key(&self) -> (bool, Priority, u64) {
        (self.sentinel, self.priority, self.seq)
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; reverse so the smallest key surfaces.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct HeapState<T> {
    entries: BinaryHeap<Entry<T>>,
    waiters: Vec<oneshot::Sender<Slot<T>>>,
    next_seq: u64,
    closed: bool,
}

/// Min-heap with asynchronous take.
pub struct AsyncPriorityHeap<T> {
    state: Mutex<HeapState<T>>,
}

impl<T> Default for AsyncPriorityHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AsyncPriorityHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("AsyncPriorityHeap")
            .field("len", &st.entries.len())
            .field("waiters", &st.waiters.len())
            .field("closed", &st.closed)
            .finish()
    }
}

impl<T> AsyncPriorityHeap<T> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                entries: BinaryHeap::new(),
                waiters: Vec::new(),
                next_seq: 0,
                closed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HeapState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the minimum item. The request is registered before this returns, so
    /// ordering between several takes follows call order, not poll order.
    pub fn take(&self) -> Take<T> {
        let mut st = self.state();
        if let Some(entry) = st.entries.pop() {
            return Take::ready(Ok(entry.slot));
        }
        if st.closed {
            return Take::ready(Err(QueueError::Shutdown));
        }
        let (tx, rx) = oneshot::channel();
        st.waiters.push(tx);
        Take::pending(rx)
    }

    /// Queues `item` under `priority` and serves a pending take if there is one.
    pub fn put(&self, priority: Priority, item: T) {
        self.push(false, priority, Slot::Item(item));
    }

    /// Queues the sentinel behind every real item.
    pub fn put_sentinel(&self) {
        self.push(true, Priority::RELAX, Slot::Sentinel);
    }

    fn push(&self, sentinel: bool, priority: Priority, slot: Slot<T>) {
        let mut st = self.state();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.entries.push(Entry {
            sentinel,
            priority,
            seq,
            slot,
        });
        Self::serve_waiters(&mut st);
    }

    fn serve_waiters(st: &mut HeapState<T>) {
        while !st.entries.is_empty() {
            let Some(waiter) = st.waiters.pop() else {
                return;
            };
            let Some(entry) = st.entries.pop() else {
                return;
            };
            let Entry {
                sentinel,
                priority,
                seq,
                slot,
            } = entry;
            if let Err(slot) = waiter.send(slot) {
                // Waiter went away; put the entry back with its original order.
                st.entries.push(Entry {
                    sentinel,
                    priority,
                    seq,
                    slot,
                });
            }
        }
    }

    /// Removes every queued item matching `predicate`; returns them. The sentinel is kept.
    pub fn cancel(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut st = self.state();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut st.entries)
            .into_vec()
            .into_iter()
            .partition(|e| match &e.slot {
                Slot::Item(item) => predicate(item),
                Slot::Sentinel => false,
            });
        st.entries = BinaryHeap::from(kept);
        removed
            .into_iter()
            .filter_map(|e| match e.slot {
                Slot::Item(item) => Some(item),
                Slot::Sentinel => None,
            })
            .collect()
    }

    /// Fails every pending take. Idempotent.
    pub fn shutdown(&self) {
        let mut st = self.state();
        st.closed = true;
        st.waiters.clear();
    }

    /// Number of queued entries, sentinel included.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of takes waiting for an item.
    pub fn pending_takes(&self) -> usize {
        self.state().waiters.len()
    }
}

/// Future returned by [`AsyncPriorityHeap::take`].
#[must_use = "a take does nothing unless awaited; dropping it gives up the request"]
pub struct Take<T> {
    inner: TakeInner<T>,
}

enum TakeInner<T> {
    Ready(Option<Result<Slot<T>, QueueError>>),
    Pending(oneshot::Receiver<Slot<T>>),
}

impl<T> Take<T> {
    fn ready(result: Result<Slot<T>, QueueError>) -> Self {
        Self {
            inner: TakeInner::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<Slot<T>>) -> Self {
        Self {
            inner: TakeInner::Pending(rx),
        }
    }

    /// Whether the take was served synchronously.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, TakeInner::Ready(_))
    }
}

impl<T> Unpin for Take<T> {}

impl<T> Future for Take<T> {
    type Output = Result<Slot<T>, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            TakeInner::Ready(result) => match result.take() {
                Some(r) => Poll::Ready(r),
                None => Poll::Ready(Err(QueueError::Shutdown)),
            },
            TakeInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| QueueError::Shutdown)),
        }
    }
}
