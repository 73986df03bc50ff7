//! # Callables and calls.
//!
//! A [`Callable`] is a named, synchronous function over JSON values. Values are
//! [`serde_json::Value`] so every argument and result is self-contained and can cross a
//! thread or process boundary unchanged. A [`Call`] binds a callable to its arguments.
//!
//! A callable returns an [`Output`]: either one value or a lazily produced sequence.
//! `Value::Null` means "no result".
//!
//! ## Example
//! ```rust
//! use serde_json::json;
//! use workheap::{Call, Callable, Output};
//!
//! let square = Callable::new("square", |args, _kw| {
//!     let x = args.first().and_then(|v| v.as_i64()).unwrap_or_default();
//!     Ok(Output::value(x * x))
//! });
//! let call = Call::new(square).arg(json!(5));
//! assert_eq!(call.name(), "square");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Keyword arguments.
pub type Kwargs = Map<String, Value>;

/// A lazily produced sequence of values.
pub type ValueIter = Box<dyn Iterator<Item = Value> + Send>;

/// Signature of every callable.
pub type CallFn = dyn Fn(&[Value], &Kwargs) -> anyhow::Result<Output> + Send + Sync;

/// What a callable hands back.
pub enum Output {
    /// One value; `Value::Null` means no result.
    Value(Value),
    /// Items produced on demand.
    Sequence(ValueIter),
}

impl Output {
    /// One value.
    pub fn value(v: impl Into<Value>) -> Self {
        Output::Value(v.into())
    }

    /// No result.
    pub fn none() -> Self {
        Output::Value(Value::Null)
    }

    /// A lazy sequence.
    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Output::Sequence(Box::new(items.into_iter()))
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Output::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// Named function over JSON values; cheap to clone.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    func: Arc<CallFn>,
}

impl Callable {
    /// Wraps `func` under `name`. The name is how a subprocess worker finds it.
    pub fn new<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> anyhow::Result<Output> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the function on the current thread.
    pub fn invoke(&self, args: &[Value], kwargs: &Kwargs) -> anyhow::Result<Output> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish()
    }
}

/// A callable bound to its positional and keyword arguments.
#[derive(Clone, Debug)]
pub struct Call {
    callable: Callable,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl Call {
    /// A call with no arguments yet.
    pub fn new(callable: Callable) -> Self {
        Self {
            callable,
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    /// Appends one positional argument.
    pub fn arg(mut self, v: impl Into<Value>) -> Self {
        self.args.push(v.into());
        self
    }

    /// Replaces the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets one keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, v: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), v.into());
        self
    }

    /// Replaces the keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn name(&self) -> &str {
        self.callable.name()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Runs the call on the current thread.
    pub fn invoke(&self) -> anyhow::Result<Output> {
        self.callable.invoke(&self.args, &self.kwargs)
    }
}

/// Name → callable lookup used on the far side of a process boundary.
#[derive(Clone, Default)]
pub struct CallTable {
    entries: HashMap<Arc<str>, Callable>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a callable under its own name.
    pub fn register(&mut self, callable: Callable) -> &mut Self {
        self.entries.insert(Arc::clone(&callable.name), callable);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, callable: Callable) -> Self {
        self.register(callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(|k| k.as_ref()).collect();
        names.sort_unstable();
        f.debug_struct("CallTable").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_builder_binds_arguments() {
        let echo = Callable::new("echo", |args, kw| {
            Ok(Output::value(json!({ "args": args, "kw": kw })))
        });
        let call = Call::new(echo).arg(1).arg("two").kwarg("k", true);
        match call.invoke().unwrap() {
            Output::Value(v) => assert_eq!(v, json!({"args": [1, "two"], "kw": {"k": true}})),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn table_finds_by_name() {
        let table = CallTable::new()
            .with(Callable::new("a", |_, _| Ok(Output::none())))
            .with(Callable::new("b", |_, _| Ok(Output::none())));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("b").map(Callable::name), Some("b"));
        assert!(table.get("c").is_none());
    }
}
