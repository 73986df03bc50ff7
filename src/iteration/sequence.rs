//! # Async sequences over worker-local iterators.
//!
//! A lazy sequence produced by a callable lives where the call ran: on the loop, on a
//! worker thread, or in a subprocess. [`SequenceSource`] is the one-item-at-a-time fetch
//! a worker back-end offers for it, and [`AsyncSequence`] is what callers hold.
//!
//! ```text
//! AsyncSequence::next()
//!     └─► head? (prefetched item) ─► yield it
//!     └─► source.fetch().await
//!            ├─ in-loop:  iterator.next() right here
//!            ├─ thread:   iterator.next() as a VIP job on the worker thread
//!            └─ process:  Next{id} request / Item{value, valid} reply
//! ```
//!
//! A fetch failure ends the sequence; it is logged, not raised.

use std::fmt;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::core::panic_message;
use crate::error::TaskError;
use crate::sync::TrackGuard;
use crate::tasks::ValueIter;

/// One-at-a-time access to a sequence held by some worker.
#[async_trait]
pub trait SequenceSource: Send + 'static {
    /// Fetches the next item; `Ok(None)` at the end.
    async fn fetch(&mut self) -> Result<Option<Value>, TaskError>;
}

/// Source over an iterator owned by the current task.
pub struct IterSource {
    iter: Option<ValueIter>,
    _guard: Option<TrackGuard>,
}

impl IterSource {
    pub fn new(iter: ValueIter) -> Self {
        Self {
            iter: Some(iter),
            _guard: None,
        }
    }

    /// Keeps `guard` counted on its tracker until the sequence ends or is dropped.
    pub fn tracked(mut self, guard: TrackGuard) -> Self {
        self._guard = Some(guard);
        self
    }
}

#[async_trait]
impl SequenceSource for IterSource {
    async fn fetch(&mut self) -> Result<Option<Value>, TaskError> {
        let Some(iter) = self.iter.as_mut() else {
            return Ok(None);
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| iter.next())) {
            Ok(Some(v)) => Ok(Some(v)),
            Ok(None) => {
                self.iter = None;
                self._guard = None;
                Ok(None)
            }
            Err(panic) => {
                self.iter = None;
                self._guard = None;
                Err(TaskError::Call {
                    text: format!("iterator panicked: {}", panic_message(&*panic)),
                })
            }
        }
    }
}

/// Caller-side handle to a lazily produced sequence.
pub struct AsyncSequence {
    head: Option<Value>,
    source: Option<Box<dyn SequenceSource>>,
}

impl AsyncSequence {
    /// A sequence that is already over.
    pub fn empty() -> Self {
        Self {
            head: None,
            source: None,
        }
    }

    pub(crate) fn with_head(head: Value, source: Box<dyn SequenceSource>) -> Self {
        Self {
            head: Some(head),
            source: Some(source),
        }
    }

    /// Next item, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<Value> {
        if let Some(v) = self.head.take() {
            return Some(v);
        }
        let source = self.source.as_mut()?;
        match source.fetch().await {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                self.source = None;
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "sequence fetch failed; ending sequence");
                self.source = None;
                None
            }
        }
    }

    /// Whether the end has been reached.
    pub fn is_done(&self) -> bool {
        self.head.is_none() && self.source.is_none()
    }

    /// Drains every remaining item.
    pub async fn collect(mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = self.next().await {
            out.push(v);
        }
        out
    }

    /// Adapts into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Value> + Send {
        futures::stream::unfold(self, |mut seq| async move {
            let item = seq.next().await?;
            Some((item, seq))
        })
    }
}

impl fmt::Debug for AsyncSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSequence")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::OpTracker;
    use futures::StreamExt;
    use serde_json::json;

    fn source(items: Vec<Value>) -> Box<dyn SequenceSource> {
        Box::new(IterSource::new(Box::new(items.into_iter())))
    }

    #[tokio::test]
    async fn head_then_source_then_end() {
        let mut seq = AsyncSequence::with_head(json!(1), source(vec![json!(2), json!(3)]));
        assert_eq!(seq.next().await, Some(json!(1)));
        assert_eq!(seq.next().await, Some(json!(2)));
        assert_eq!(seq.next().await, Some(json!(3)));
        assert_eq!(seq.next().await, None);
        assert!(seq.is_done());
        assert_eq!(seq.next().await, None);
    }

    #[tokio::test]
    async fn stream_adapter_yields_all_items() {
        let seq = AsyncSequence::with_head(json!("a"), source(vec![json!("b")]));
        let items: Vec<Value> = seq.into_stream().collect().await;
        assert_eq!(items, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn guard_released_when_iterator_ends() {
        let tracker = OpTracker::default();
        let src = IterSource::new(Box::new(vec![json!(1)].into_iter())).tracked(tracker.guard());
        let seq = AsyncSequence::with_head(json!(0), Box::new(src));
        assert_eq!(tracker.outstanding(), Some(1));
        assert_eq!(seq.collect().await, vec![json!(0), json!(1)]);
        assert_eq!(tracker.outstanding(), Some(0));
    }

    #[tokio::test]
    async fn panicking_iterator_ends_sequence() {
        let iter = (0..3).map(|i| if i == 1 { panic!("bad item") } else { json!(i) });
        let seq = AsyncSequence::with_head(json!("h"), Box::new(IterSource::new(Box::new(iter))));
        assert_eq!(seq.collect().await, vec![json!("h"), json!(0)]);
    }
}
