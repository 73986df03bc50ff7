//! # Niceness: UNIX `nice`-style scheduling bias.
//!
//! A task's heap key is `serial × weight(niceness)`, where `serial` counts tasks within
//! the task's series. `weight` doubles for every +10 of niceness, so a series running at
//! niceness `n + 10` is served at about half the rate of a series at `n`.
//!
//! ```text
//! niceness:  -20   -10    0    +10   +20
//! weight:    0.25  0.5   1.0   2.0   4.0
//! ```

use crate::error::TaskError;

/// Validated niceness in `-20..=20`. Lower is served sooner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Niceness(i8);

impl Niceness {
    /// Most favoured niceness.
    pub const MIN: i32 = -20;
    /// Least favoured niceness.
    pub const MAX: i32 = 20;
    /// Normal niceness.
    pub const NORMAL: Niceness = Niceness(0);

    /// Validates `value`, returning [`TaskError::InvalidNiceness`] outside `-20..=20`.
    pub fn new(value: i32) -> Result<Self, TaskError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value as i8))
        } else {
            Err(TaskError::InvalidNiceness { niceness: value })
        }
    }

    /// Returns the raw value.
    #[inline]
    pub fn get(self) -> i32 {
        i32::from(self.0)
    }

    /// Multiplier applied to a series serial number.
    #[inline]
    pub fn weight(self) -> f64 {
        2f64.powf(f64::from(self.0) / 10.0)
    }
}

impl TryFrom<i32> for Niceness {
    type Error = TaskError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Niceness::new(value)
    }
}
