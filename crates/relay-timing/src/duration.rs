use std::{ops::{Add, Mul, Sub}, str::FromStr};

use humantime::DurationError as HumanDurationError;
use serde::{Deserializer, Serialize};

/// Millisecond span used for configured timeouts.
///
/// `NONE` stands for an unconfigured timeout (the classic "no timeout"
/// setting). Deserialises from either a bare millisecond count or a
/// humantime string (`150ms`, `2s`, `5m`, `1h`, ...).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct Duration(pub u64);

impl Duration {
    pub const NONE: Duration = Duration(u64::MAX);
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Duration(s * 1_000)
    }

    #[inline]
    pub const fn from_mins(m: u64) -> Self {
        Duration(m * 60_000)
    }

    #[inline]
    pub const fn is_set(self) -> bool {
        self.0 != u64::MAX
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Duration) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u64> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u64) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_set() {
            return write!(f, "none");
        }
        if self.0 == 0 {
            write!(f, "0ms")
        } else if self.0 % 3_600_000 == 0 {
            write!(f, "{}h", self.0 / 3_600_000)
        } else if self.0 % 60_000 == 0 {
            write!(f, "{}m", self.0 / 60_000)
        } else if self.0 % 1_000 == 0 {
            write!(f, "{}s", self.0 / 1_000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl From<Duration> for std::time::Duration {
    #[inline]
    fn from(value: Duration) -> Self {
        std::time::Duration::from_millis(if value.is_set() { value.0 } else { 0 })
    }
}

impl From<std::time::Duration> for Duration {
    #[inline]
    fn from(value: std::time::Duration) -> Self {
        Duration(value.as_millis() as u64)
    }
}

impl FromStr for Duration {
    type Err = HumanDurationError;

    /// Accepts the usual suffixes (`us`, `ms`, `s`, `m`, `h`, `d`).
    /// Sub-millisecond values round up to 1ms so that a configured
    /// timeout never silently becomes "none".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d: std::time::Duration = s.trim().parse::<humantime::Duration>()?.into();
        let ms = d.as_millis() as u64;
        if ms == 0 && !d.is_zero() {
            return Ok(Duration(1));
        }
        Ok(Duration(ms))
    }
}

impl<'de> serde::Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer of milliseconds or a string with a duration suffix")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Duration(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom(format!("duration cannot be negative, got {value}")));
                }
                Ok(Duration(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Duration::from_str(value).map_err(|e| {
                    E::custom(format!("failed to parse '{value}' as a duration: {e}"))
                })
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
