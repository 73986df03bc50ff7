//! Blocking-thread helpers: an explicit [`BlockingPool`], the [`Consumerator`] that
//! feeds blocking code from an async sequence, the [`OrderedItemProducer`] that feeds it
//! in call order, and the [`Filerator`] that turns writes into an iterator.

mod consumerator;
mod filerator;
mod ordered;
mod pool;

pub use consumerator::{BlockingItems, Consumerator};
pub use filerator::{FileChunks, Filerator};
pub use ordered::OrderedItemProducer;
pub use pool::BlockingPool;
