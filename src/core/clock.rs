//! Logical time.

use std::{fmt, ops::Add};

pub use time::Duration;

/// A point on the engine's logical clock, measured from the moment the owning scheduler was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The origin of the logical clock.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Creates a timestamp from an offset since the origin.
    pub fn from_offset(offset: Duration) -> Self {
        debug_assert!(!offset.is_negative());
        Self(offset)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from_offset(secs_f64(secs))
    }

    /// Returns the offset since the origin.
    pub fn offset(&self) -> Duration {
        self.0
    }

    /// Returns the time elapsed between `earlier` and `self`, which is negative if `earlier` is
    /// actually later.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        self.0 - earlier.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        // Never step back past the origin.
        Timestamp((self.0 + rhs).max(Duration::ZERO))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{:?}", self.0)
    }
}

/// Converts fractional seconds to a duration, rounded to the nearest nanosecond.
///
/// Configuration carries durations as `f64` seconds; rounding keeps values such as `0.001`
/// from landing one nanosecond short.
pub fn secs_f64(secs: f64) -> Duration {
    Duration::nanoseconds((secs * 1e9).round() as i64)
}

/// Clamps a possibly negative delay to zero.
pub(crate) fn non_negative(delay: Duration) -> Duration {
    delay.max(Duration::ZERO)
}
