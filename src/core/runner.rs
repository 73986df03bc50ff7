//! # Run one call and classify its outcome.
//!
//! [`CallRunner`] is shared by every worker back-end, on whichever side of the transport
//! the call actually executes.
//!
//! ```text
//! call.invoke()
//!   ├─ panic                       ─► Error("<name>: panicked: <msg>")
//!   ├─ Err(e)                      ─► Error("<name>: <e:#>")
//!   ├─ Ok(Value(Null))             ─► None
//!   ├─ Ok(Value(v))                ─► Value(v)
//!   └─ Ok(Sequence(it))
//!         ├─ raw mode              ─► Value([..it])
//!         └─ otherwise             ─► Sequence(it)
//! ```
//!
//! ## Rules
//! - Errors leave the runner as text only; nothing live crosses a worker boundary.
//! - Timing (when enabled) covers the call itself, not the draining of a sequence.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::tasks::{Call, Output, ValueIter};

/// Classified result of one call.
pub enum Outcome {
    Value(Value),
    None,
    /// Formatted diagnostic.
    Error(String),
    Sequence(ValueIter),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Value(_) => "value",
            Outcome::None => "none",
            Outcome::Error(_) => "error",
            Outcome::Sequence(_) => "sequence",
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::None => f.write_str("None"),
            Outcome::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Outcome::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// Executes calls and optionally records how long each took.
#[derive(Default)]
pub struct CallRunner {
    raw: bool,
    timed: bool,
    stats: Mutex<Vec<Duration>>,
}

impl CallRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// In raw mode a sequence result is collected into a JSON array.
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Records wall time per call, readable with [`take_stats`](Self::take_stats).
    pub fn timed(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
    }

    pub fn is_timed(&self) -> bool {
        self.timed
    }

    /// Runs `call` on the current thread.
    pub fn run(&self, call: &Call) -> Outcome {
        let started = self.timed.then(Instant::now);
        let result = catch_unwind(AssertUnwindSafe(|| call.invoke()));
        if let Some(t0) = started {
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(t0.elapsed());
        }

        match result {
            Err(panic) => Outcome::Error(format!(
                "{}: panicked: {}",
                call.name(),
                panic_message(&*panic)
            )),
            Ok(Err(e)) => Outcome::Error(format!("{}: {e:#}", call.name())),
            Ok(Ok(Output::Value(Value::Null))) => Outcome::None,
            Ok(Ok(Output::Value(v))) => Outcome::Value(v),
            Ok(Ok(Output::Sequence(iter))) if self.raw => {
                match catch_unwind(AssertUnwindSafe(|| iter.collect::<Vec<_>>())) {
                    Ok(items) => Outcome::Value(Value::Array(items)),
                    Err(panic) => Outcome::Error(format!(
                        "{}: panicked: {}",
                        call.name(),
                        panic_message(&*panic)
                    )),
                }
            }
            Ok(Ok(Output::Sequence(iter))) => Outcome::Sequence(iter),
        }
    }

    /// Returns and clears the recorded timings.
    pub fn take_stats(&self) -> Vec<Duration> {
        std::mem::take(&mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl fmt::Debug for CallRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRunner")
            .field("raw", &self.raw)
            .field("timed", &self.timed)
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Callable;
    use serde_json::json;

    fn call(f: impl Fn(&[Value]) -> anyhow::Result<Output> + Send + Sync + 'static) -> Call {
        Call::new(Callable::new("f", move |args, _| f(args)))
    }

    #[test]
    fn classifies_values_and_none() {
        let runner = CallRunner::new();
        let square = call(|a| {
            let x = a[0].as_i64().unwrap_or(0);
            Ok(Output::value(x * x))
        })
        .arg(5);
        assert!(matches!(runner.run(&square), Outcome::Value(v) if v == json!(25)));
        assert!(matches!(runner.run(&call(|_| Ok(Output::none()))), Outcome::None));
    }

    #[test]
    fn errors_become_text_with_context() {
        let failing = call(|_| {
            Err(anyhow::anyhow!("root cause").context("while loading"))
        });
        match CallRunner::new().run(&failing) {
            Outcome::Error(text) => assert_eq!(text, "f: while loading: root cause"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panics_become_text() {
        let boom = call(|_| panic!("kaboom"));
        match CallRunner::new().run(&boom) {
            Outcome::Error(text) => assert!(text.contains("kaboom"), "{text}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn raw_mode_collects_sequences() {
        let gen = call(|_| Ok(Output::sequence(vec![json!(1), json!(2)])));
        assert!(matches!(CallRunner::new().run(&gen), Outcome::Sequence(_)));
        match CallRunner::new().raw(true).run(&gen) {
            Outcome::Value(v) => assert_eq!(v, json!([1, 2])),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timing_is_opt_in_and_drained() {
        let noop = call(|_| Ok(Output::none()));
        let plain = CallRunner::new();
        plain.run(&noop);
        assert!(plain.take_stats().is_empty());

        let timed = CallRunner::new().timed(true);
        timed.run(&noop);
        timed.run(&noop);
        assert_eq!(timed.take_stats().len(), 2);
        assert!(timed.take_stats().is_empty());
    }
}
