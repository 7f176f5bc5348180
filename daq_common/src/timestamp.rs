//! Timestamp carried by every data frame.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds/nanoseconds pair, as produced by `clock_gettime`.
///
/// The control loop supplies it on every tick; `Timestamp::ZERO` is used
/// when the caller has no clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the epoch of the producing clock.
    pub sec: i64,
    /// Nanoseconds within the second (`0..1_000_000_000`).
    pub nsec: u32,
}

impl Timestamp {
    /// The "no timestamp" value.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Create a timestamp, normalizing `nsec` overflow into `sec`.
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self {
            sec: sec + (nsec / 1_000_000_000) as i64,
            nsec: nsec % 1_000_000_000,
        }
    }

    /// Current wall-clock time. Not for use inside the real-time tick.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from)
            .unwrap_or(Self::ZERO)
    }

    /// Total nanoseconds.
    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * 1_000_000_000 + self.nsec as i128
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos(),
        }
    }
}
