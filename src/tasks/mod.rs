//! Task model: what callers submit and what workers run.
//!
//! ## Contents
//! - [`Callable`], [`Call`], [`Output`], [`CallTable`] functions over JSON values
//! - [`TaskSpec`] submission options (niceness, series, rush/relax, timeout, consumer)
//! - [`Task`], [`TaskRef`], [`TaskFuture`], [`TaskOutput`] the scheduled unit and its result
//! - [`Series`], [`SeriesCounter`] per-series serials behind the heap key

mod call;
mod series;
mod spec;
mod task;

pub use call::{Call, CallFn, CallTable, Callable, Kwargs, Output, ValueIter};
pub use series::{Series, SeriesCounter};
pub use spec::{Placement, TaskSpec};
pub(crate) use task::TaskParts;
pub use task::{Task, TaskFuture, TaskOutput, TaskRef, TaskResult};
