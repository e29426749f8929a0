//! Wall-clock timestamps for last-writer-wins ordering.
//!
//! A [`Timestamp`] is milliseconds since the Unix epoch. Comparing timestamps
//! produced on two different devices is only meaningful if their clocks are
//! roughly in sync; there is no logical clock here.
//!
//! [`WallClock`] hands out timestamps for local writes. It never issues the
//! same value twice, so two writes landing in the same millisecond still
//! order correctly on the peer instead of looking like a duplicate.
//!
//! # Example
//!
//! ```
//! use pairsync::clock::{Timestamp, WallClock};
//!
//! let mut clock = WallClock::with_time_source(|| 1_000);
//!
//! let t1 = clock.now();
//! let t2 = clock.now();
//! assert_eq!(t1, Timestamp::from_millis(1_000));
//! assert!(t2 > t1);
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
///
/// Serializes as a bare integer so that any peer, whatever its language,
/// can compare two timestamps numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch itself.
    pub const EPOCH: Self = Self(0);

    /// Wrap a raw millisecond count.
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Raw millisecond count.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(ms: u64) -> Self {
        Self(ms)
    }
}

fn system_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Source of local write timestamps.
///
/// Defaults to `SystemTime`. Use [`with_time_source`](Self::with_time_source)
/// to plug in a deterministic source for tests.
#[derive(Clone)]
pub struct WallClock {
    last: Option<Timestamp>,
    physical_time_fn: fn() -> u64,
}

impl WallClock {
    /// Create a clock backed by the system time.
    pub fn new() -> Self {
        Self::with_time_source(system_time_ms)
    }

    /// Create a clock with a custom physical time source in milliseconds.
    pub fn with_time_source(time_fn: fn() -> u64) -> Self {
        Self {
            last: None,
            physical_time_fn: time_fn,
        }
    }

    /// Timestamp for a local write.
    ///
    /// Strictly greater than every timestamp this clock issued before, even
    /// if the physical clock stalls or steps backward.
    pub fn now(&mut self) -> Timestamp {
        let pt = Timestamp((self.physical_time_fn)());
        let next = match self.last {
            Some(last) if pt <= last => Timestamp(last.0.saturating_add(1)),
            _ => pt,
        };
        self.last = Some(next);
        next
    }

    /// The last timestamp handed out, if any.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WallClock")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
