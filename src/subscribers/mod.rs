//! # Event subscribers.
//!
//! ```text
//! Bus ──► subscriber listener ──► SubscriberSet ──┬──► LogWriter   (tracing)
//!                                                 ├──► LoadMonitor (watch channel)
//!                                                 └──► your own Subscribe impls
//! ```

mod load;
mod log;
mod subscriber;
mod subscriber_set;

pub use load::LoadMonitor;
pub use log::LogWriter;
pub use subscriber::Subscribe;
pub use subscriber_set::SubscriberSet;
