//! Calendar time as seen by the logger
//!
//! The logger works at minute granularity: snapshots, upload slots and file
//! names are all derived from the current minute, so [`DateTime`] carries no
//! seconds. Ordering is chronological (fields compare year first).

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Minutes in one calendar day
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// A validated calendar minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl DateTime {
    /// Build a calendar minute, rejecting impossible dates and times.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8) -> Option<Self> {
        if !(1..=12).contains(&month) || hour > 23 || minute > 59 {
            return None;
        }
        if day == 0 || day > days_in_month(year, month) {
            return None;
        }
        Some(Self {
            year,
            month,
            day,
            hour,
            minute,
        })
    }

    /// Minutes elapsed since local midnight (0..1440)
    pub const fn minute_of_day(&self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    /// Whether both values fall on the same calendar day.
    pub fn same_day(&self, other: &DateTime) -> bool {
        self.year == other.year && self.month == other.month && self.day == other.day
    }

    /// Advance by `minutes`, carrying into hours, days, months and years.
    pub fn plus_minutes(self, minutes: u32) -> Self {
        let total = self.minute_of_day() as u32 + minutes;
        let mut days = total / MINUTES_PER_DAY as u32;
        let rest = total % MINUTES_PER_DAY as u32;

        let mut next = Self {
            hour: (rest / 60) as u8,
            minute: (rest % 60) as u8,
            ..self
        };

        while days > 0 {
            if next.day < days_in_month(next.year, next.month) {
                next.day += 1;
            } else if next.month < 12 {
                next.day = 1;
                next.month += 1;
            } else {
                next.day = 1;
                next.month = 1;
                next.year += 1;
            }
            days -= 1;
        }

        next
    }

    /// Parse the quoted timestamp of a `+CCLK` response.
    ///
    /// The modem reports `"yy/MM/dd,hh:mm:ss±zz"` in local time; the zone
    /// offset and seconds are dropped.
    pub fn from_cclk(text: &str) -> Option<Self> {
        let text = text.trim().trim_matches('"');
        let (date, time) = text.split_once(',')?;

        let mut date_parts = date.split('/');
        let year: u16 = date_parts.next()?.parse().ok()?;
        let month: u8 = date_parts.next()?.parse().ok()?;
        let day: u8 = date_parts.next()?.parse().ok()?;

        let mut time_parts = time.get(..5)?.split(':');
        let hour: u8 = time_parts.next()?.parse().ok()?;
        let minute: u8 = time_parts.next()?.parse().ok()?;

        Self::new(2000 + year, month, day, hour, minute)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

pub const fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("clock has not been set")]
    NotSet,
    #[error("clock lost power and needs resynchronising")]
    LostPower,
    #[error("clock could not be reached")]
    Bus,
}

/// Wall-clock source.
///
/// Implementations report whole minutes with explicit date fields; the core
/// never infers a day change from a minute wrapping around.
pub trait Clock {
    fn now(&mut self) -> Result<DateTime, ClockError>;

    /// Replace the current time, e.g. with network time after registration.
    fn set(&mut self, time: DateTime) -> Result<(), ClockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_dates() {
        assert!(DateTime::new(2024, 2, 29, 0, 0).is_some());
        assert!(DateTime::new(2023, 2, 29, 0, 0).is_none());
        assert!(DateTime::new(2024, 13, 1, 0, 0).is_none());
        assert!(DateTime::new(2024, 1, 1, 24, 0).is_none());
        assert!(DateTime::new(2024, 1, 1, 0, 60).is_none());
    }

    #[test]
    fn test_ordering_is_chronological() {
        let late_evening = DateTime::new(2024, 1, 15, 23, 59).unwrap();
        let next_morning = DateTime::new(2024, 1, 16, 0, 0).unwrap();
        assert!(late_evening < next_morning);
        assert!(late_evening.minute_of_day() > next_morning.minute_of_day());
    }

    #[test]
    fn test_plus_minutes_rolls_over_year() {
        let t = DateTime::new(2023, 12, 31, 23, 58).unwrap();
        assert_eq!(t.plus_minutes(3), DateTime::new(2024, 1, 1, 0, 1).unwrap());
    }

    #[test]
    fn test_plus_minutes_across_leap_day() {
        let t = DateTime::new(2024, 2, 28, 12, 0).unwrap();
        assert_eq!(
            t.plus_minutes(2 * 24 * 60),
            DateTime::new(2024, 3, 1, 12, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_cclk() {
        let t = DateTime::from_cclk("\"24/01/15,00:20:05+00\"").unwrap();
        assert_eq!(t, DateTime::new(2024, 1, 15, 0, 20).unwrap());
        assert!(DateTime::from_cclk("\"24/13/15,00:20:05+00\"").is_none());
        assert!(DateTime::from_cclk("garbage").is_none());
    }
}
