//! # Series and the per-series serial counter.
//!
//! Every task belongs to a series (or to the anonymous series). Each series numbers its
//! tasks 1, 2, 3, ... and the heap key is `serial × niceness.weight()`, so equal-niceness
//! tasks of one series come out in submission order and independent series interleave
//! instead of one starving the others.
//!
//! A series seen for the first time starts at the highest serial any series has reached,
//! so a newcomer joins the current round rather than jumping ahead of it.
//!
//! ```text
//! A: 1 2 3 4 5 ...            (niceness 0,  weight 1)
//! B:     4 5 6 ...            (first seen when max serial was 3)
//! C: 2 4 6 8 ...              (niceness 10, weight 2: half the rate)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::Priority;
use crate::policies::Niceness;

/// Opaque series tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Series(Arc<str>);

impl Series {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Series {
    fn from(s: &str) -> Self {
        Series(Arc::from(s))
    }
}

impl From<String> for Series {
    fn from(s: String) -> Self {
        Series(Arc::from(s))
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serial numbers per series, `None` being the anonymous series.
#[derive(Debug, Default)]
pub struct SeriesCounter {
    serials: HashMap<Option<Series>, u64>,
}

impl SeriesCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances `series` and returns the heap key for its next task.
    pub fn key(&mut self, series: Option<&Series>, niceness: Niceness) -> Priority {
        let serial = self.next_serial(series);
        Priority(serial as f64 * niceness.weight())
    }

    fn next_serial(&mut self, series: Option<&Series>) -> u64 {
        let key = series.cloned();
        if !self.serials.contains_key(&key) {
            let start = self.serials.values().copied().max().unwrap_or(0);
            self.serials.insert(key.clone(), start);
        }
        let serial = self.serials.entry(key).or_insert(0);
        *serial += 1;
        *serial
    }
}
