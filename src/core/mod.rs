//! Runtime core: the heap, the dispatch loop, the roster and the scheduler over them.
//!
//! - `heap`: min-priority heap with awaitable takes and a shutdown sentinel;
//! - `dispatch`: loop moving items from the heap to a [`Handler`];
//! - `roster`: the handler that assigns tasks to idle, qualified workers;
//! - `runner`: invokes one call and turns its output into an [`Outcome`];
//! - `scheduler`: submission, result classification, retries and shutdown.

mod builder;
mod config;
mod dispatch;
mod heap;
mod roster;
mod runner;
mod scheduler;

pub use builder::SchedulerBuilder;
pub use config::Config;
pub use dispatch::{DispatchLoop, Handler, LoopState};
pub use heap::{AsyncPriorityHeap, Priority, Slot, Take};
pub use roster::WorkerId;
pub(crate) use runner::panic_message;
pub use runner::{CallRunner, Outcome};
pub use scheduler::TaskScheduler;
