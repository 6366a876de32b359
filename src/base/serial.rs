//! Serial numbers.
//!
//! DNS uses 32 bit serial numbers in various places that are conceptionally
//! viewed as the 32 bit modulus of a larger number space. Because of that,
//! special rules apply when processing these values. This module provides
//! the type [`Serial`] that implements these rules.
//!
//! Zone maintenance relies on these rules in two places: deciding whether
//! an upstream has newer data than the local copy of a zone and generating
//! the next serial after a change has been made locally.

use super::time::UnixTime;
use chrono::{DateTime, Datelike};
use core::cmp::Ordering;
use core::{cmp, fmt, str};
use octseq::parse::{Parser, ShortInput};
use serde::{Deserialize, Serialize};

//------------ Serial --------------------------------------------------------

/// A serial number.
///
/// Since these numbers are only 32 bits long, they can wrap. [RFC 1982]
/// defined the semantics for doing arithmetics in the face of these
/// wrap-arounds. This type implements these semantics atop a native `u32`.
///
/// For addition, the amount added can only be a positive number of up to
/// `2^31 - 1`. Because of this, we don't implement the `Add` trait but
/// rather have a dedicated method `add`.
///
/// Serial numbers only implement a partial ordering. That is, there are
/// pairs of values that are not equal but there still isn’t one value
/// larger than the other. Since this is neatly implemented by the
/// `PartialOrd` trait, the type implements that.
///
/// [RFC 1982]: https://tools.ietf.org/html/rfc1982
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Serial(pub u32);

impl Serial {
    /// Returns the serial number as a raw integer.
    pub fn into_int(self) -> u32 {
        self.0
    }

    /// Add `other` to `self`.
    ///
    /// Values larger than `2^31 - 1` are not allowed by RFC 1982. They are
    /// clamped to that value rather than causing a panic.
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: u32) -> Self {
        Serial(self.0.wrapping_add(other.min(0x7FFF_FFFF)))
    }

    /// Returns whether `self` is strictly greater than `other`.
    ///
    /// Pairs of serials without a defined order are not greater.
    pub fn is_newer_than(self, other: Serial) -> bool {
        matches!(self.partial_cmp(&other), Some(Ordering::Greater))
    }

    /// Returns the serial that follows `self` under the given method.
    ///
    /// The result is always greater than `self` in serial number
    /// arithmetics. A value of zero is skipped since some software treats
    /// it as "unset".
    pub fn next(self, method: SerialUpdateMethod, now: UnixTime) -> Self {
        let candidate = match method {
            SerialUpdateMethod::Increment => self.add(1),
            SerialUpdateMethod::UnixTime => Serial(now.as_secs()),
            SerialUpdateMethod::Date => Self::date_based(now),
        };
        let res = if candidate.is_newer_than(self) {
            candidate
        } else {
            self.add(1)
        };
        if res.0 == 0 {
            Serial(1)
        } else {
            res
        }
    }

    /// Returns the `YYYYMMDD00` serial for the given time.
    fn date_based(now: UnixTime) -> Self {
        match DateTime::from_timestamp(i64::from(now.as_secs()), 0) {
            Some(date) => Serial(
                (date.year() as u32)
                    .wrapping_mul(1_000_000)
                    .wrapping_add(date.month() * 10_000)
                    .wrapping_add(date.day() * 100),
            ),
            None => Serial(0),
        }
    }
}

/// # Parsing and Composing
///
impl Serial {
    pub const COMPOSE_LEN: u16 = 4;

    pub fn parse(parser: &mut Parser<[u8]>) -> Result<Self, ShortInput> {
        parser.parse_u32_be().map(Serial)
    }

    pub fn compose(&self, target: &mut impl bytes::BufMut) {
        target.put_u32(self.0)
    }
}

//--- From and FromStr

impl From<u32> for Serial {
    fn from(value: u32) -> Serial {
        Serial(value)
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}

impl str::FromStr for Serial {
    type Err = <u32 as str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <u32 as str::FromStr>::from_str(s).map(Into::into)
    }
}

//--- Display

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--- PartialOrd

impl cmp::PartialOrd for Serial {
    fn partial_cmp(&self, other: &Serial) -> Option<cmp::Ordering> {
        match self.0.cmp(&other.0) {
            Ordering::Equal => Some(Ordering::Equal),
            Ordering::Less => {
                let sub = other.0 - self.0;
                match sub.cmp(&0x8000_0000) {
                    Ordering::Less => Some(Ordering::Less),
                    Ordering::Greater => Some(Ordering::Greater),
                    Ordering::Equal => None,
                }
            }
            Ordering::Greater => {
                let sub = self.0 - other.0;
                match sub.cmp(&0x8000_0000) {
                    Ordering::Less => Some(Ordering::Greater),
                    Ordering::Greater => Some(Ordering::Less),
                    Ordering::Equal => None,
                }
            }
        }
    }
}

//------------ SerialUpdateMethod --------------------------------------------

/// How a zone generates a new serial after a local change.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SerialUpdateMethod {
    /// Add one to the current serial.
    #[default]
    Increment,

    /// Use the current Unix time if that is newer.
    UnixTime,

    /// Use the `YYYYMMDDnn` convention if that is newer.
    Date,
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn good_addition() {
        assert_eq!(Serial(0).add(4), Serial(4));
        assert_eq!(
            Serial(0xFF00_0000).add(0x0F00_0000),
            Serial(
                ((0xFF00_0000u64 + 0x0F00_0000u64) % 0x1_0000_0000) as u32
            )
        );
        assert_eq!(Serial(0).add(0x8000_0000), Serial(0x7FFF_FFFF));
    }

    #[test]
    fn comparison() {
        use core::cmp::Ordering::*;

        assert_eq!(Serial(12).partial_cmp(&Serial(12)), Some(Equal));
        assert_eq!(Serial(12).partial_cmp(&Serial(13)), Some(Less));
        assert_eq!(
            Serial(3_000_000_012).partial_cmp(&Serial(12)),
            Some(Less)
        );
        assert_eq!(
            Serial(12).partial_cmp(&Serial(3_000_000_012)),
            Some(Greater)
        );
        assert_eq!(Serial(13).partial_cmp(&Serial(12)), Some(Greater));
        assert_eq!(Serial(1).partial_cmp(&Serial(0x8000_0001)), None);
        assert_eq!(Serial(0x8000_0001).partial_cmp(&Serial(1)), None);
    }

    #[test]
    fn wraparound_newer() {
        assert!(Serial(2).is_newer_than(Serial(4_294_967_295)));
        assert!(!Serial(2).is_newer_than(Serial(1_000_000_002)));
        assert!(!Serial(1).is_newer_than(Serial(0x8000_0001)));
        assert!(!Serial(7).is_newer_than(Serial(7)));
    }

    #[test]
    fn next_serial() {
        let now = UnixTime::from_secs(1_700_000_000);
        assert_eq!(
            Serial(10).next(SerialUpdateMethod::Increment, now),
            Serial(11)
        );
        assert_eq!(
            Serial(u32::MAX).next(SerialUpdateMethod::Increment, now),
            Serial(1)
        );
        assert_eq!(
            Serial(10).next(SerialUpdateMethod::UnixTime, now),
            Serial(1_700_000_000)
        );
        assert_eq!(
            Serial(1_800_000_000).next(SerialUpdateMethod::UnixTime, now),
            Serial(1_800_000_001)
        );
        // 2023-11-14
        assert_eq!(
            Serial(10).next(SerialUpdateMethod::Date, now),
            Serial(2023111400)
        );
        assert_eq!(
            Serial(2023111400).next(SerialUpdateMethod::Date, now),
            Serial(2023111401)
        );
    }
}
