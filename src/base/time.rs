//! Wall clock time.
//!
//! Signature validity, key timing metadata and trust anchor hold-down
//! timers are all expressed in seconds since the Unix epoch. Scheduling
//! inside a running process uses the monotonic clock of the runtime
//! instead, see [`crate::zone::timers`].

use super::serial::Serial;
use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[cfg(test)]
use mock_instant::thread_local::{SystemTime, UNIX_EPOCH};

#[cfg(not(test))]
use std::time::{SystemTime, UNIX_EPOCH};

//------------ UnixTime ------------------------------------------------------

/// Seconds since the Unix epoch.
///
/// The value is 32 bits wide which is what RRSIG and KEYDATA records
/// carry on the wire.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct UnixTime(u32);

impl UnixTime {
    pub const EPOCH: Self = Self(0);

    /// Returns the current time.
    ///
    /// A clock set before the epoch reads as the epoch.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(u32::try_from(secs).unwrap_or(u32::MAX))
    }

    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }

    pub fn is_epoch(self) -> bool {
        self.0 == 0
    }

    /// Returns the time `duration` after `self`, saturating at the maximum.
    pub fn add(self, duration: Duration) -> Self {
        let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX);
        Self(self.0.saturating_add(secs))
    }

    /// Returns the time `duration` before `self`, saturating at the epoch.
    pub fn sub(self, duration: Duration) -> Self {
        let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX);
        Self(self.0.saturating_sub(secs))
    }

    /// Returns how long after `earlier` this time is.
    ///
    /// Returns zero if `earlier` is actually later.
    pub fn since(self, earlier: UnixTime) -> Duration {
        Duration::from_secs(u64::from(self.0.saturating_sub(earlier.0)))
    }

    /// Converts the time into an RRSIG timestamp.
    pub fn to_serial(self) -> Serial {
        Serial(self.0)
    }

    /// Converts an RRSIG timestamp into a time.
    ///
    /// Timestamps are serial numbers relative to `now`; a timestamp more
    /// than 68 years in the past is taken to be in the future.
    pub fn from_serial(serial: Serial, now: UnixTime) -> Self {
        let delta = serial.0.wrapping_sub(now.0) as i32;
        Self(now.0.wrapping_add(delta as u32))
    }
}

//--- From

impl From<u32> for UnixTime {
    fn from(secs: u32) -> Self {
        Self(secs)
    }
}

//--- Display

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match OffsetDateTime::from_unix_timestamp(i64::from(self.0)) {
            Ok(t) => write!(
                f,
                "{:04}{:02}{:02}{:02}{:02}{:02}",
                t.year(),
                u8::from(t.month()),
                t.day(),
                t.hour(),
                t.minute(),
                t.second()
            ),
            Err(_) => write!(f, "{}", self.0),
        }
    }
}

//============ Testing =======================================================
