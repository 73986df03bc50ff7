//! # Prefetch stage.
//!
//! [`prefetch`] asks a [`SequenceSource`] for its first item before the sequence is handed
//! to anyone. A source that fails or is empty collapses to [`AsyncSequence::empty`], so
//! callers never see an error from a sequence that could not even start.

use crate::iteration::{AsyncSequence, SequenceSource};

/// Confirms `source` yields at least one item and wraps it.
pub async fn prefetch(mut source: Box<dyn SequenceSource>) -> AsyncSequence {
    match source.fetch().await {
        Ok(Some(first)) => AsyncSequence::with_head(first, source),
        Ok(None) => AsyncSequence::empty(),
        Err(e) => {
            tracing::debug!(error = %e, "prefetch failed; returning an empty sequence");
            AsyncSequence::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::iteration::IterSource;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Broken;

    #[async_trait]
    impl SequenceSource for Broken {
        async fn fetch(&mut self) -> Result<Option<Value>, TaskError> {
            Err(TaskError::Disconnected)
        }
    }

    #[tokio::test]
    async fn failure_collapses_to_empty() {
        let seq = prefetch(Box::new(Broken)).await;
        assert!(seq.is_done());
    }

    #[tokio::test]
    async fn empty_iterator_collapses_to_empty() {
        let seq = prefetch(Box::new(IterSource::new(Box::new(std::iter::empty())))).await;
        assert!(seq.is_done());
    }

    #[tokio::test]
    async fn first_item_is_kept() {
        let src = IterSource::new(Box::new(vec![json!(1), json!(2)].into_iter()));
        let seq = prefetch(Box::new(src)).await;
        assert!(!seq.is_done());
        assert_eq!(seq.collect().await, vec![json!(1), json!(2)]);
    }
}
