//! Logical simulation time.

use std::fmt;
use std::ops::Add;

/// A point in logical simulation time, in seconds.
///
/// Wraps an `f64` with a total order (`f64::total_cmp`) so times can key
/// ordered collections. Times are provided by schedulers and message
/// envelopes and are never NaN in a well-formed simulation; a NaN would
/// still order consistently rather than poison comparisons.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SimTime(f64);

impl SimTime {
    /// The start of the simulation epoch.
    pub const ZERO: Self = Self(0.0);

    /// Sentinel used when requesting a time advance with an empty local
    /// queue and during the termination drain. No simulation event is ever
    /// scheduled at or beyond this time.
    pub const END_OF_TIME: Self = Self(1_000_000.0);

    pub fn from_secs(secs: f64) -> Self {
        debug_assert!(secs.is_finite(), "non-finite simulation time");
        Self(secs)
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    /// This time shifted forward by `secs`.
    pub fn offset(&self, secs: f64) -> Self {
        Self(self.0 + secs)
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add<f64> for SimTime {
    type Output = Self;

    fn add(self, rhs: f64) -> Self {
        self.offset(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}", self.0)
    }
}
