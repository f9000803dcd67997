//! Unit-of-time scales for producer timestamps.
//!
//! Points are always stored at nanosecond resolution; the unit records the
//! producer's intended scale so replies can be converted back for display.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp scale carried alongside readings.
///
/// The wire encoding is the numeric discriminant; zero (or an absent value)
/// is treated as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum UnitOfTime {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
}

impl UnitOfTime {
    /// Nanoseconds per tick at this scale.
    pub fn nanos_per_tick(self) -> i64 {
        match self {
            UnitOfTime::Nanoseconds => 1,
            UnitOfTime::Microseconds => 1_000,
            UnitOfTime::Milliseconds => 1_000_000,
            UnitOfTime::Seconds => 1_000_000_000,
        }
    }
}

impl From<UnitOfTime> for u8 {
    fn from(uot: UnitOfTime) -> u8 {
        match uot {
            UnitOfTime::Nanoseconds => 1,
            UnitOfTime::Microseconds => 2,
            UnitOfTime::Milliseconds => 3,
            UnitOfTime::Seconds => 4,
        }
    }
}

impl TryFrom<u8> for UnitOfTime {
    type Error = TimeConversionError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            // zero means "unset"; callers default it to seconds
            0 | 4 => Ok(UnitOfTime::Seconds),
            1 => Ok(UnitOfTime::Nanoseconds),
            2 => Ok(UnitOfTime::Microseconds),
            3 => Ok(UnitOfTime::Milliseconds),
            other => Err(TimeConversionError::UnknownUnit(other)),
        }
    }
}

/// Errors converting timestamps between scales.
#[derive(Debug, Error)]
pub enum TimeConversionError {
    /// The converted timestamp does not fit in an `i64`.
    #[error("timestamp {0} overflows at the requested scale")]
    Overflow(i64),

    /// An unrecognized numeric unit discriminant.
    #[error("unknown unit of time discriminant {0}")]
    UnknownUnit(u8),
}

/// Convert a timestamp between scales, truncating toward zero on downscale.
pub fn convert_time(
    time: i64,
    from: UnitOfTime,
    to: UnitOfTime,
) -> Result<i64, TimeConversionError> {
    let nanos = (time as i128) * (from.nanos_per_tick() as i128);
    let scaled = nanos / (to.nanos_per_tick() as i128);
    i64::try_from(scaled).map_err(|_| TimeConversionError::Overflow(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_to_nanos_and_back() {
        let ns = convert_time(1_700_000_000, UnitOfTime::Seconds, UnitOfTime::Nanoseconds)
            .expect("convert");
        assert_eq!(ns, 1_700_000_000_000_000_000);
        let s = convert_time(ns, UnitOfTime::Nanoseconds, UnitOfTime::Seconds).expect("convert");
        assert_eq!(s, 1_700_000_000);
    }

    #[test]
    fn overflow_is_reported() {
        assert!(convert_time(i64::MAX, UnitOfTime::Seconds, UnitOfTime::Nanoseconds).is_err());
    }

    #[test]
    fn zero_discriminant_defaults_to_seconds() {
        assert_eq!(UnitOfTime::try_from(0u8).unwrap(), UnitOfTime::Seconds);
    }
}
