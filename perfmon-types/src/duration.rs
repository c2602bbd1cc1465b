//! Duration representation for serialization.
//!
//! Timer durations are measured with `Instant` and stored as whole
//! microseconds so snapshots serialize identically across formats.

use core::iter::Sum;
use core::ops::{Add, AddAssign};
use core::time::Duration;

/// Duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
#[cfg_attr(feature = "minicbor", cbor(transparent))]
pub struct Microseconds(#[cfg_attr(feature = "minicbor", n(0))] pub u64);

impl Microseconds {
    /// Zero duration.
    pub const ZERO: Microseconds = Microseconds(0);

    /// Create from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Create from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1000)
    }

    /// Get the value in microseconds.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get the value in milliseconds (truncated).
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get the value in fractional milliseconds.
    pub fn as_millis_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Convert to a standard Duration.
    pub const fn to_duration(&self) -> Duration {
        Duration::from_micros(self.0)
    }

    pub const fn saturating_sub(self, rhs: Microseconds) -> Microseconds {
        Microseconds(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for Microseconds {
    fn from(d: Duration) -> Self {
        Self(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
    }
}

impl From<Microseconds> for Duration {
    fn from(m: Microseconds) -> Self {
        Duration::from_micros(m.0)
    }
}

impl Add for Microseconds {
    type Output = Microseconds;

    fn add(self, rhs: Microseconds) -> Microseconds {
        Microseconds(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Microseconds {
    fn add_assign(&mut self, rhs: Microseconds) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Microseconds {
    fn sum<I: Iterator<Item = Microseconds>>(iter: I) -> Self {
        iter.fold(Microseconds::ZERO, Add::add)
    }
}
