//! Implements a portable wrapper for the Windows FILETIME representation.
//!
//! Absolute timestamps are written to events as FILETIME ticks: the number of 100ns intervals
//! since January 1, 1601 (UTC).
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wrapper for [FILETIME](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-filetime) ticks
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileTime(i64);

const SECONDS_BETWEEN_1601_AND_1970: i64 = 11_644_473_600;
const NS_IN_SECOND: i64 = 1_000_000_000;
const MS_IN_SECOND: i64 = 1_000;
const TICKS_IN_SECOND: i64 = 10_000_000;
const NS_IN_TICK: i128 = 100;

impl FileTime {
    /// The current system time
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub const fn from_quad(quad: i64) -> Self {
        FileTime(quad)
    }

    /// Raw tick count, this is what gets encoded in events
    pub const fn as_quad(&self) -> i64 {
        self.0
    }

    /// Builds a FileTime from a unix timestamp with nanosecond granularity.
    ///
    /// Values outside of the representable range saturate.
    pub fn from_unix_timestamp_nanos(nanos: i128) -> Self {
        let ticks = nanos.div_euclid(NS_IN_TICK)
            + (SECONDS_BETWEEN_1601_AND_1970 as i128 * TICKS_IN_SECOND as i128);
        let clamped = ticks.clamp(i64::MIN as i128, i64::MAX as i128);
        FileTime(clamped as i64)
    }

    /// Converts to a unix timestamp with millisecond granularity.
    pub fn as_unix_timestamp(&self) -> i64 {
        self.0.div_euclid(10_000) - (SECONDS_BETWEEN_1601_AND_1970 * MS_IN_SECOND)
    }

    /// Converts to a unix timestamp with nanosecond granularity.
    pub fn as_unix_timestamp_nanos(&self) -> i128 {
        self.0 as i128 * NS_IN_TICK - (SECONDS_BETWEEN_1601_AND_1970 as i128 * NS_IN_SECOND as i128)
    }

    /// Converts to OffsetDateTime
    #[cfg(feature = "time_rs")]
    pub fn as_date_time(&self) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp_nanos(self.as_unix_timestamp_nanos()).ok()
    }
}

impl From<SystemTime> for FileTime {
    fn from(time: SystemTime) -> Self {
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_nanos() as i128,
            Err(before) => -(before.duration().as_nanos() as i128),
        };
        FileTime::from_unix_timestamp_nanos(nanos)
    }
}

impl From<FileTime> for SystemTime {
    fn from(file_time: FileTime) -> Self {
        let nanos = file_time.as_unix_timestamp_nanos();
        let magnitude = Duration::from_nanos(nanos.unsigned_abs().min(u64::MAX as u128) as u64);
        if nanos >= 0 {
            UNIX_EPOCH + magnitude
        } else {
            UNIX_EPOCH - magnitude
        }
    }
}

#[cfg(feature = "time_rs")]
impl From<time::OffsetDateTime> for FileTime {
    fn from(date_time: time::OffsetDateTime) -> Self {
        FileTime::from_unix_timestamp_nanos(date_time.unix_timestamp_nanos())
    }
}
