//! Wall clock kept in software
//!
//! The board has no battery-backed RTC. Time is set from the cellular
//! network after registration and then advanced from the monotonic timer.
//! Until the first sync the clock reports [`ClockError::NotSet`].

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use embedded_sdmmc::{TimeSource, Timestamp};

use flowlog_core::time::{Clock, ClockError, DateTime};

/// Wall time at a monotonic instant
#[derive(Clone, Copy)]
struct Anchor {
    time: DateTime,
    at: Instant,
}

pub struct SoftClock {
    anchor: Mutex<CriticalSectionRawMutex, Cell<Option<Anchor>>>,
}

impl SoftClock {
    pub const fn new() -> Self {
        Self {
            anchor: Mutex::new(Cell::new(None)),
        }
    }

    pub fn read(&self) -> Option<DateTime> {
        let anchor = self.anchor.lock(Cell::get)?;
        let minutes = Instant::now().duration_since(anchor.at).as_secs() / 60;
        Some(anchor.time.plus_minutes(minutes as u32))
    }

    pub fn write(&self, time: DateTime) {
        self.anchor.lock(|anchor| {
            anchor.set(Some(Anchor {
                time,
                at: Instant::now(),
            }))
        });
    }
}

impl Default for SoftClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for &SoftClock {
    fn now(&mut self) -> Result<DateTime, ClockError> {
        self.read().ok_or(ClockError::NotSet)
    }

    fn set(&mut self, time: DateTime) -> Result<(), ClockError> {
        self.write(time);
        Ok(())
    }
}

/// FAT timestamps for files written before the first sync fall back to the
/// FAT epoch.
impl TimeSource for &SoftClock {
    fn get_timestamp(&self) -> Timestamp {
        let Some(now) = self.read() else {
            return Timestamp {
                year_since_1970: 10,
                zero_indexed_month: 0,
                zero_indexed_day: 0,
                hours: 0,
                minutes: 0,
                seconds: 0,
            };
        };

        Timestamp {
            year_since_1970: now.year.saturating_sub(1970) as u8,
            zero_indexed_month: now.month - 1,
            zero_indexed_day: now.day - 1,
            hours: now.hour,
            minutes: now.minute,
            seconds: 0,
        }
    }
}
