// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations in Argus NVR's internal format.
//!
//! All media and wall times are kept in 90 kHz units: the common RTP clock
//! rate for video, convenient for MP4 muxing, and fine enough that rounding
//! never matters at camera frame rates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// A time specified as 90,000ths of a second since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    pub fn new(unix_secs: i64, subsec_nanos: i32) -> Self {
        Time(unix_secs * TIME_UNITS_PER_SEC + i64::from(subsec_nanos) * 9 / 100_000)
    }

    pub fn from_unix_secs(secs: i64) -> Self {
        Time(secs * TIME_UNITS_PER_SEC)
    }

    /// The number of whole seconds since epoch, rounding toward negative infinity.
    pub fn unix_secs(self) -> i64 {
        self.0.div_euclid(TIME_UNITS_PER_SEC)
    }

    pub fn subsec_ticks(self) -> i32 {
        (self.0.rem_euclid(TIME_UNITS_PER_SEC)) as i32
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Write both the raw value and the humanized form.
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let nanos = (i64::from(self.subsec_ticks()) * 100_000 / 9) as i32;
        let ts = match jiff::Timestamp::new(self.unix_secs(), nanos) {
            Ok(ts) => ts,
            Err(_) => return write!(f, "{}", self.0),
        };
        write!(f, "{ts}")
    }
}

/// A duration specified in 1/90,000ths of a second.
///
/// Typically non-negative, but subtracting two `Time`s may legitimately
/// yield a negative value (e.g. a realtime clock stepping backward).
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_secs(secs: i64) -> Self {
        Duration(secs * TIME_UNITS_PER_SEC)
    }

    pub fn from_millis(millis: i64) -> Self {
        Duration(millis * TIME_UNITS_PER_SEC / 1_000)
    }

    pub fn whole_secs(self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }

    /// Converts to a `std::time::Duration`; negative durations clamp to zero.
    pub fn to_std(self) -> std::time::Duration {
        if self.0 <= 0 {
            return std::time::Duration::ZERO;
        }
        let secs = (self.0 / TIME_UNITS_PER_SEC) as u64;
        let nanos = ((self.0 % TIME_UNITS_PER_SEC) * 100_000 / 9) as u32;
        std::time::Duration::new(secs, nanos)
    }

    pub fn from_std(d: std::time::Duration) -> Self {
        Duration(d.as_secs() as i64 * TIME_UNITS_PER_SEC + i64::from(d.subsec_nanos()) * 9 / 100_000)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ticks = self.0;
        if ticks < 0 {
            f.write_str("-")?;
            ticks = -ticks;
        }
        let secs = ticks / TIME_UNITS_PER_SEC;
        let subsec = ticks % TIME_UNITS_PER_SEC;
        if subsec == 0 {
            write!(f, "{secs}s")
        } else {
            write!(f, "{secs}.{:05}s", subsec * 100_000 / TIME_UNITS_PER_SEC)
        }
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0;
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Duration;
    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_display() {
        assert_eq!(Duration(0).to_string(), "0s");
        assert_eq!(Duration::from_secs(60).to_string(), "60s");
        assert_eq!(Duration(90_000 + 45_000).to_string(), "1.50000s");
        assert_eq!(Duration(-90_000).to_string(), "-1s");
    }

    #[test]
    fn time_round_trip() {
        let t = Time::new(1_700_000_000, 500_000_000);
        assert_eq!(t.unix_secs(), 1_700_000_000);
        assert_eq!(t.subsec_ticks(), 45_000);
    }

    #[test]
    fn std_conversion() {
        let d = Duration::from_millis(1_500);
        assert_eq!(d.to_std(), std::time::Duration::from_millis(1_500));
        assert_eq!(Duration::from_std(std::time::Duration::from_secs(2)), Duration::from_secs(2));
    }
}
