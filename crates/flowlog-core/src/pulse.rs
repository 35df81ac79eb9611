//! Debounced flow-meter pulse counting
//!
//! Edges arrive on an interrupt-like context while the control loop samples
//! the count on its own schedule, possibly after being blocked for a long
//! modem exchange. The two sides share exactly two pieces of state:
//!
//! - the pulse count, an `AtomicU32` that the edge path increments and
//!   [`PulseAccumulator::sample`] swaps back to zero, so an edge landing
//!   during a sample is counted in either the closing or the next window and
//!   never lost;
//! - the candidate edge, written only by the edge path inside a critical
//!   section a few instructions long.
//!
//! An edge is only a candidate until the line has held its new level for
//! `min_pulse_width_ms`. It is confirmed by the next edge arriving after
//! that, or by [`PulseAccumulator::settle`] once the width has elapsed with
//! no further edge. An edge inside the width cancels the candidate and is
//! dropped with it, so an isolated spike counts nothing.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::config::Calibration;
use crate::time::DateTime;

/// A calibrated reading for one sampling window. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// End of the window the reading covers
    pub timestamp: DateTime,
    /// Debounced pulses counted in the window
    pub pulses: u32,
    /// Calibrated quantity for the window
    pub value: f32,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{:.2}", self.timestamp, self.pulses, self.value)
    }
}

/// Hold-time debouncer and pulse counter.
///
/// Timestamps are free-running milliseconds and may wrap.
pub struct PulseAccumulator {
    min_pulse_width_ms: u32,
    count: AtomicU32,
    candidate_ms: Mutex<CriticalSectionRawMutex, Cell<Option<u32>>>,
}

impl PulseAccumulator {
    pub const fn new(min_pulse_width_ms: u32) -> Self {
        Self {
            min_pulse_width_ms,
            count: AtomicU32::new(0),
            candidate_ms: Mutex::new(Cell::new(None)),
        }
    }

    /// Record a raw transition. Returns `false` if it was line noise.
    ///
    /// A transition inside the hold window of the pending candidate cancels
    /// that candidate; neither is counted and the noise does not start a new
    /// window. Safe to call from an interrupt handler or a dedicated task.
    pub fn on_edge(&self, timestamp_ms: u32) -> bool {
        let (confirmed, accepted) = self.candidate_ms.lock(|candidate| match candidate.get() {
            Some(since) if timestamp_ms.wrapping_sub(since) < self.min_pulse_width_ms => {
                candidate.set(None);
                (false, false)
            }
            previous => {
                candidate.set(Some(timestamp_ms));
                (previous.is_some(), true)
            }
        });

        if confirmed {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        accepted
    }

    /// Confirm the pending candidate if it has held for the full width by
    /// `now_ms`. Returns whether a pulse was counted.
    pub fn settle(&self, now_ms: u32) -> bool {
        let confirmed = self.candidate_ms.lock(|candidate| match candidate.get() {
            Some(since) if now_ms.wrapping_sub(since) >= self.min_pulse_width_ms => {
                candidate.set(None);
                true
            }
            _ => false,
        });

        if confirmed {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        confirmed
    }

    pub fn min_pulse_width_ms(&self) -> u32 {
        self.min_pulse_width_ms
    }

    /// Confirmed pulses since the last sample.
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Close the current window and start a new one.
    ///
    /// Calibration runs here rather than per edge to keep the edge path short.
    /// A candidate still inside its hold window is left for the next window.
    pub fn sample(&self, window_end: DateTime, calibration: Calibration) -> Reading {
        let pulses = self.count.swap(0, Ordering::AcqRel);
        Reading {
            timestamp: window_end,
            pulses,
            value: calibration(pulses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::five_units_per_pulse;

    fn window_end() -> DateTime {
        DateTime::new(2024, 1, 15, 0, 2).unwrap()
    }

    #[test]
    fn test_counts_edges_at_or_above_min_width() {
        let acc = PulseAccumulator::new(100);
        for i in 0..10u32 {
            assert!(acc.on_edge(i * 100));
        }
        // The last edge waits for its hold time
        assert_eq!(acc.pending(), 9);
        assert!(acc.settle(1000));
        assert_eq!(acc.pending(), 10);

        let acc = PulseAccumulator::new(100);
        let mut t = 5u32;
        for gap in [100, 250, 101, 1000, 100] {
            t += gap;
            acc.on_edge(t);
        }
        acc.settle(t + 100);
        assert_eq!(acc.pending(), 5);
    }

    #[test]
    fn test_isolated_glitch_counts_nothing() {
        let acc = PulseAccumulator::new(100);
        assert!(acc.on_edge(10_000));
        assert!(!acc.on_edge(10_005));
        assert!(!acc.settle(20_000));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_settle_waits_for_full_width() {
        let acc = PulseAccumulator::new(100);
        acc.on_edge(500);
        assert!(!acc.settle(599));
        assert_eq!(acc.pending(), 0);
        assert!(acc.settle(600));
        assert!(!acc.settle(700));
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_bounce_counts_once() {
        let acc = PulseAccumulator::new(100);
        // Contact closes, bounces open, closes again and holds
        assert!(acc.on_edge(0));
        assert!(!acc.on_edge(3));
        assert!(acc.on_edge(6));
        acc.settle(106);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_noise_does_not_extend_window() {
        let acc = PulseAccumulator::new(100);
        assert!(acc.on_edge(0));
        assert!(!acc.on_edge(30));
        // The noise edge is dropped, so the next edge opens a fresh window
        assert!(acc.on_edge(60));
        assert!(acc.on_edge(160));
        assert_eq!(acc.pending(), 1);
        acc.settle(260);
        assert_eq!(acc.pending(), 2);
    }

    #[test]
    fn test_timestamp_wraparound() {
        let acc = PulseAccumulator::new(100);
        assert!(acc.on_edge(u32::MAX - 10));
        assert!(!acc.settle(50));
        assert!(acc.settle(89));

        assert!(acc.on_edge(u32::MAX - 5));
        assert!(!acc.on_edge(20));
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_sample_calibrates_and_resets() {
        let acc = PulseAccumulator::new(100);
        for i in 0..4u32 {
            acc.on_edge(i * 500);
        }
        acc.settle(2000);

        let reading = acc.sample(window_end(), five_units_per_pulse);
        assert_eq!(reading.pulses, 4);
        assert_eq!(reading.value, 20.0);
        assert_eq!(reading.timestamp, window_end());

        let empty = acc.sample(window_end(), five_units_per_pulse);
        assert_eq!(empty.pulses, 0);
        assert_eq!(empty.value, 0.0);
    }

    #[test]
    fn test_candidate_survives_sampling() {
        let acc = PulseAccumulator::new(100);
        acc.on_edge(1000);
        assert_eq!(acc.sample(window_end(), five_units_per_pulse).pulses, 0);
        // The held edge lands in the next window instead of being lost
        assert!(acc.settle(1100));
        assert_eq!(acc.sample(window_end(), five_units_per_pulse).pulses, 1);
    }

    #[test]
    fn test_reading_display() {
        let reading = Reading {
            timestamp: window_end(),
            pulses: 3,
            value: 15.0,
        };
        let line = alloc::format!("{reading}");
        assert_eq!(line, "2024-01-15 00:02,3,15.00");
    }
}
