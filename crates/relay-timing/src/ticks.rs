use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::Duration;

/// Millisecond deadline on the engine's monotonic clock.
///
/// `ETERNITY` means "no deadline". It sorts after every real tick, so
/// `min` combines deadlines the way the session FSM needs: the first
/// one to fire wins and a missing deadline never does.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ETERNITY: Ticks = Ticks(u64::MAX);
    pub const ZERO: Ticks = Ticks(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Ticks(ms)
    }

    #[inline]
    pub const fn is_set(self) -> bool {
        self.0 != u64::MAX
    }

    /// Whether this deadline has fired at `now`. An unset deadline
    /// never expires.
    #[inline]
    pub fn expired(self, now: Ticks) -> bool {
        self.is_set() && self <= now
    }

    /// Earliest of two deadlines; `ETERNITY` loses to anything set.
    #[inline]
    pub fn first(self, other: Ticks) -> Ticks {
        self.min(other)
    }

    /// `now + dur`, or `ETERNITY` when `dur` itself is unset.
    #[inline]
    pub fn add_ifset(self, dur: Duration) -> Ticks {
        if dur.is_set() {
            self + dur
        } else {
            Ticks::ETERNITY
        }
    }

    /// Milliseconds until this deadline, `None` when unset.
    #[inline]
    pub fn until(self, now: Ticks) -> Option<u64> {
        if self.is_set() {
            Some(self.0.saturating_sub(now.0))
        } else {
            None
        }
    }
}

impl Add<Duration> for Ticks {
    type Output = Ticks;

    #[inline]
    fn add(self, rhs: Duration) -> Ticks {
        Ticks(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Duration> for Ticks {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Ticks {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Ticks) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for Ticks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_set() {
            write!(f, "{}ms", self.0)
        } else {
            write!(f, "eternity")
        }
    }
}
