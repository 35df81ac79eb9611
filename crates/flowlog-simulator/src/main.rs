//! Desktop simulator for the flowlog pulse logger.
//!
//! Runs the core orchestrator minute by minute against a simulated SIM800
//! modem, a manual clock and in-memory storage, feeding it synthetic flow
//! pulses. A few link faults are injected along the way so the retry and
//! backlog paths show up in the log.
//!
//! `RUST_LOG=info` (or `debug`) controls how much is printed.
//!
//! # Scenario
//!
//! | Day | What happens                                         |
//! |-----|------------------------------------------------------|
//! | 1   | Normal operation, first file sealed at midnight       |
//! | 2   | Weak signal all day: uploads wait in the backlog      |
//! | 3   | Two failed store sessions, then the data channel drops|
//! | 4   | Clean day, the backlog drains                         |

use embassy_futures::block_on;
use log::{info, warn};

use flowlog_core::modem::LinkController;
use flowlog_core::orchestrator::{JobOutcome, TickReport};
use flowlog_core::sim::{NoopDelay, SimBattery, SimClock, SimModem, sim_config};
use flowlog_core::storage::MemoryStorage;
use flowlog_core::{DateTime, PulseAccumulator, UploadOrchestrator};

// ---------------------------------------------------------------------------
// Scenario constants
// ---------------------------------------------------------------------------

/// Simulated days, each starting at midnight.
const DAYS: u32 = 4;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Signal quality of a healthy cell
const GOOD_SIGNAL: u8 = 18;

/// Below the default admission threshold of 11
const WEAK_SIGNAL: u8 = 6;

// ---------------------------------------------------------------------------
// Synthetic flow
// ---------------------------------------------------------------------------

/// Generates meter pulses with a daily demand curve plus switch bounce.
struct FlowGenerator {
    /// Free-running milliseconds, as a GPIO edge task would see them
    clock_ms: u32,
}

impl FlowGenerator {
    fn new() -> Self {
        Self { clock_ms: 0 }
    }

    /// Pulses per minute at the given minute of the day: quiet at night,
    /// peaks in the morning and evening.
    fn rate(minute_of_day: u32) -> u32 {
        let hour = minute_of_day as f64 / 60.0;
        let morning = (-((hour - 7.5) / 1.5).powi(2)).exp();
        let evening = (-((hour - 19.0) / 2.0).powi(2)).exp();
        (2.0 + 40.0 * morning + 25.0 * evening) as u32
    }

    /// Feed one minute of edges into the accumulator. Every fifth pulse
    /// bounces open and closed again, and every seventh minute carries an
    /// isolated spike; the debouncer should count neither.
    fn run_minute(&mut self, minute_of_day: u32, pulses: &PulseAccumulator) -> u32 {
        let count = Self::rate(minute_of_day);
        let start = self.clock_ms;
        let spacing = 60_000 / (count + 1);

        if minute_of_day % 7 == 0 {
            pulses.on_edge(start.wrapping_add(spacing / 2));
            pulses.on_edge(start.wrapping_add(spacing / 2 + 5));
        }

        for n in 0..count {
            let edge = start.wrapping_add(spacing * (n + 1));
            pulses.on_edge(edge);
            if n % 5 == 0 {
                pulses.on_edge(edge.wrapping_add(3));
                pulses.on_edge(edge.wrapping_add(6));
            }
        }

        self.clock_ms = start.wrapping_add(60_000);
        pulses.settle(self.clock_ms);
        count
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Steer the modem at the start of each simulated day.
fn apply_day_conditions(day: u32, modem: &SimModem) {
    match day {
        1 => {
            warn!("Day {}: signal degraded to {}", day + 1, WEAK_SIGNAL);
            modem.set_signal(WEAK_SIGNAL);
        }
        2 => {
            info!("Day {}: signal restored, store sessions flaky", day + 1);
            modem.set_signal(GOOD_SIGNAL);
            modem.fail_store_sessions(2);
            modem.drop_channel_after(900);
        }
        _ => modem.set_signal(GOOD_SIGNAL),
    }
}

fn log_tick(report: &TickReport) {
    if let Some(sealed) = &report.sealed {
        info!("Sealed {}", sealed);
    }
    let Some(window) = &report.window else {
        return;
    };

    match &window.link {
        Ok(()) => info!(
            "Window: {} jobs finished, {} status lines sent",
            window.finished.len(),
            window.status_lines
        ),
        Err(e) => warn!("Window: link not available ({})", e),
    }
    for job in &window.finished {
        match job.outcome {
            JobOutcome::Succeeded => info!(
                "  {} uploaded, {} bytes, {} attempts",
                job.file, job.committed, job.attempts
            ),
            outcome => warn!(
                "  {} ended {:?} after {} attempts ({} bytes committed)",
                job.file, outcome, job.attempts, job.committed
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let config = sim_config();
    info!(
        "Starting flowlog simulator: unit {}, {} days, server {}:{}",
        config.unit_id, DAYS, config.ftp.host, config.ftp.port
    );

    let start = match DateTime::new(2024, 3, 1, 0, 0) {
        Some(start) => start,
        None => {
            log::error!("Invalid simulation start date");
            return;
        }
    };

    let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
    let modem = SimModem::new();
    modem.set_signal(GOOD_SIGNAL);
    modem.set_network_time(Some(start));
    let clock = SimClock::new(None);

    let link = LinkController::new(modem.clone(), modem.power(), NoopDelay, &config);
    let battery = SimBattery::default();
    let mut orchestrator = match UploadOrchestrator::new(
        &config,
        &pulses,
        MemoryStorage::new(),
        clock.clone(),
        link,
        battery,
    ) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("Configuration rejected: {}", e);
            return;
        }
    };

    // Boot: the clock is unset, so the first window fetches network time
    if let Some(window) = block_on(orchestrator.start()) {
        info!("Boot window: link {:?}", window.link.map(|_| "up"));
    }
    info!("Clock after boot: {:?}", clock.time());

    let mut flow = FlowGenerator::new();
    let mut generated: u64 = 0;

    for day in 0..DAYS {
        apply_day_conditions(day, &modem);

        for minute in 0..MINUTES_PER_DAY {
            generated += flow.run_minute(minute, &pulses) as u64;
            let report = block_on(orchestrator.tick());
            log_tick(&report);
            clock.advance(1);
        }
    }

    // ---------------------------------------------------------------------
    // Summary
    // ---------------------------------------------------------------------
    info!("Simulated {} days, {} pulses generated", DAYS, generated);
    info!("Backlog left: {} jobs", orchestrator.backlog().len());

    let storage = orchestrator.storage();
    for name in storage.file_names() {
        let size = storage.contents(name).map_or(0, <[u8]>::len);
        info!("Local  {:>16} {:>8} bytes", name, size);
    }
    for path in modem.remote_files() {
        let size = modem.remote_file(&path).map_or(0, |bytes| bytes.len());
        info!("Remote {:>30} {:>8} bytes", path, size);
    }

    if let Some(errors) = storage.contents(config.error_log_file) {
        for line in String::from_utf8_lossy(errors).lines() {
            warn!("ERROR.LOG: {}", line);
        }
    }

    info!("Simulator exiting");
}
