//! Iterator bridge: worker-local lazy sequences as caller-side async sequences.
//!
//! ```text
//! worker iterator ──► SequenceSource ──prefetch()──► AsyncSequence ──► caller .next()
//!                                                          │
//!                                                          └─► IterationProducer ──► Consumer
//! ```

mod consumer;
mod prefetch;
mod producer;
mod sequence;

pub use consumer::{Consumer, ListConsumer};
pub use prefetch::prefetch;
pub use producer::{IterationProducer, ProducerHandle};
pub use sequence::{AsyncSequence, IterSource, SequenceSource};
