//! Top-level control loop
//!
//! [`UploadOrchestrator::tick`] runs once per scheduling tick:
//!
//! 1. Read the clock and evaluate the schedule.
//! 2. On a snapshot, sample the pulse count and append the reading to the
//!    open data file, then check for rollover. A sealed file becomes an
//!    upload job.
//! 3. On the upload slot, a freshly sealed file or a hardware fault in the
//!    previous tick, register the link, upload the backlog oldest first and
//!    flush queued status lines.
//! 4. Power the link down.
//!
//! State is checkpointed once the tick's local work is done, before the link
//! comes up, and again as each upload attempt finishes, so a reset in the
//! middle of a window neither repeats the minute's reading nor resends data
//! the server already acknowledged.
//!
//! Faults the loop cannot absorb go to the local error log; it never stops
//! ticking because of one.

pub mod error_log;
pub mod jobs;
mod uploader;

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};

use crate::battery::BatteryMonitor;
use crate::config::{Calibration, Config, ConfigError, FileName, VoltageFormula};
use crate::filename::FilenameSequencer;
use crate::modem::{LinkController, ModemPower, ModemTransport, RegisteredLink};
use crate::pulse::{PulseAccumulator, Reading};
use crate::schedule::{ScheduleEvaluator, ScheduleState};
use crate::storage::{Checkpoint, DebugLog, PersistedState, Storage};
use crate::text;
use crate::time::{Clock, DateTime};

pub use error_log::{ErrorLog, FaultKind, Stamp, StatusKind, StatusLine, StatusQueue};
pub use jobs::{BACKLOG_CAPACITY, Backlog, Enqueued, JobOutcome, UploadJob};
pub use uploader::{WindowReport, remote_name};

use uploader::Uploader;

/// Longest CSV line a reading renders to
pub const READING_LINE_CAPACITY: usize = 96;

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// `None` when the clock could not be read
    pub now: Option<DateTime>,
    pub reading: Option<Reading>,
    pub sealed: Option<FileName>,
    pub window: Option<WindowReport>,
}

pub struct UploadOrchestrator<'a, S, C, T, P, D, B> {
    calibration: Calibration,
    battery_voltage: VoltageFormula,
    sync_clock: bool,
    upload_on_seal: bool,
    evaluator: ScheduleEvaluator,
    schedule: ScheduleState,
    sequencer: FilenameSequencer,
    pulses: &'a PulseAccumulator,
    storage: S,
    clock: C,
    link: LinkController<'a, T, P, D>,
    battery: B,
    uploader: Uploader<'a>,
    checkpoint: Checkpoint,
    debug_log: Option<&'a DebugLog>,
    debug_log_file: Option<&'a str>,
    /// A file was sealed since the last window
    sealed_pending: bool,
    /// The last window hit a hardware fault
    retry_next_tick: bool,
    clock_fault_reported: bool,
}

impl<'a, S, C, T, P, D, B> UploadOrchestrator<'a, S, C, T, P, D, B>
where
    S: Storage,
    C: Clock,
    T: ModemTransport,
    P: ModemPower,
    D: DelayNs,
    B: BatteryMonitor,
{
    pub fn new(
        config: &Config<'a>,
        pulses: &'a PulseAccumulator,
        storage: S,
        clock: C,
        link: LinkController<'a, T, P, D>,
        battery: B,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            calibration: config.calibration,
            battery_voltage: config.battery_voltage,
            sync_clock: config.sync_clock_from_network,
            upload_on_seal: config.upload_on_seal,
            evaluator: ScheduleEvaluator::new(config),
            schedule: ScheduleState::default(),
            sequencer: FilenameSequencer::new(config),
            pulses,
            storage,
            clock,
            link,
            battery,
            uploader: Uploader::new(config),
            checkpoint: Checkpoint::new(),
            debug_log: None,
            debug_log_file: config.debug_log_file,
            sealed_pending: false,
            retry_next_tick: false,
            clock_fault_reported: false,
        })
    }

    /// Mirror queued log lines into the configured debug log file after
    /// every tick.
    pub fn with_debug_log(mut self, sink: &'a DebugLog) -> Self {
        self.debug_log = Some(sink);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn link(&self) -> &LinkController<'a, T, P, D> {
        &self.link
    }

    pub fn backlog(&self) -> &Backlog {
        &self.uploader.backlog
    }

    pub fn status_queue(&self) -> &StatusQueue {
        &self.uploader.status
    }

    pub fn schedule_state(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn sequencer(&self) -> &FilenameSequencer {
        &self.sequencer
    }

    /// Restore persisted state and announce the boot.
    ///
    /// The link is brought up once when the clock still needs network time
    /// or when status lines are uploaded, so the boot line goes out early.
    pub async fn start(&mut self) -> Option<WindowReport> {
        self.restore();

        let now = self.clock.now().ok();
        info!(
            "Starting with {} queued uploads, clock {}",
            self.uploader.backlog.len(),
            Stamp(now.as_ref())
        );
        let volts = match self.battery.volts(self.battery_voltage) {
            Ok(volts) => {
                info!("Battery at {:.2} V", volts);
                Some(volts)
            }
            Err(error) => {
                warn!("Battery not readable: {}", error);
                None
            }
        };
        self.uploader.boot(now.as_ref(), volts);

        let needs_time = self.sync_clock && now.is_none();
        let window = if needs_time || !self.uploader.status.is_empty() {
            Some(self.upload_window(now).await)
        } else {
            None
        };

        let now = match self.clock.now() {
            Ok(now) => Some(now),
            Err(error) => {
                self.clock_fault_reported = true;
                self.fault(
                    None,
                    FaultKind::ClockFault,
                    format_args!("clock unavailable after start: {}", error),
                );
                None
            }
        };
        self.persist(now.as_ref());
        self.flush_debug_log();
        window
    }

    pub async fn tick(&mut self) -> TickReport {
        let report = self.run_tick().await;
        self.flush_debug_log();
        report
    }

    async fn run_tick(&mut self) -> TickReport {
        let mut report = TickReport {
            now: None,
            reading: None,
            sealed: None,
            window: None,
        };

        let now = match self.clock.now() {
            Ok(now) => now,
            Err(error) => {
                if !self.clock_fault_reported {
                    self.clock_fault_reported = true;
                    self.fault(
                        None,
                        FaultKind::ClockFault,
                        format_args!("clock read failed: {}", error),
                    );
                }
                return report;
            }
        };
        self.clock_fault_reported = false;
        report.now = Some(now);

        let decision = self.evaluator.evaluate(&now, &self.schedule);
        if decision.clock_regressed {
            warn!("Clock moved back to {}", now);
        }
        self.schedule = decision.next;

        if decision.snapshot {
            let reading = self.pulses.sample(now, self.calibration);
            debug!("Reading {}", reading);
            // Appended before the rollover check so it lands in the file
            // its window belongs to
            self.store_reading(&reading);
            report.reading = Some(reading);

            match self.sequencer.check_rollover(&now) {
                Ok(Some(sealed)) => {
                    self.enqueue(&now, sealed.name.clone());
                    report.sealed = Some(sealed.name);
                }
                Ok(None) => {}
                Err(error) => self.fault(
                    Some(&now),
                    FaultKind::from(&error),
                    format_args!("no data file name at {}: {}", now, error),
                ),
            }
        }

        self.persist(Some(&now));

        if decision.upload || (self.upload_on_seal && self.sealed_pending) || self.retry_next_tick {
            report.window = Some(self.upload_window(Some(now)).await);
            self.persist(Some(&now));
        }

        report
    }

    fn store_reading(&mut self, reading: &Reading) {
        let at = reading.timestamp;

        let file = match self.sequencer.ensure_open(&at) {
            Ok(file) => file,
            Err(error) => {
                self.fault(
                    Some(&at),
                    FaultKind::from(&error),
                    format_args!("reading {} lost, no data file: {}", reading, error),
                );
                return;
            }
        };

        let Ok(line) = text::render::<READING_LINE_CAPACITY>(format_args!("{}\n", reading)) else {
            self.fault(
                Some(&at),
                FaultKind::StorageFault,
                format_args!("reading {} lost, line too long", reading),
            );
            return;
        };

        if let Err(error) = self.storage.append(&file, line.as_bytes()) {
            self.fault(
                Some(&at),
                FaultKind::StorageFault,
                format_args!("reading {} lost, {} not writable: {}", reading, file, error),
            );
        }
    }

    fn enqueue(&mut self, at: &DateTime, file: FileName) {
        if self.sequencer.open_name() == Some(&file) {
            warn!("Not queueing {} while it is open", file);
            return;
        }

        match self.uploader.backlog.enqueue(file) {
            Enqueued::Added => self.sealed_pending = true,
            Enqueued::Duplicate => debug!("Sealed file already queued"),
            Enqueued::Evicted(job) => {
                self.sealed_pending = true;
                self.fault(
                    Some(at),
                    FaultKind::UploadAbandoned,
                    format_args!("{} evicted from a full backlog", job.file),
                );
            }
        }
    }

    async fn upload_window(&mut self, at: Option<DateTime>) -> WindowReport {
        let was_retry = self.retry_next_tick;
        self.sealed_pending = false;
        self.retry_next_tick = false;

        let base = self.persisted_state();
        let mut report = WindowReport::new();
        match self.link.ensure_registered().await {
            Ok(mut link) => {
                if self.sync_clock {
                    sync_clock(&mut link, &mut self.clock).await;
                }
                self.uploader
                    .run(
                        &mut link,
                        &mut self.storage,
                        at.as_ref(),
                        &mut report,
                        &mut self.checkpoint,
                        &base,
                    )
                    .await;
            }
            Err(error) => report.link = Err(error),
        }

        if let Err(error) = &report.link {
            let kind = FaultKind::from(error);
            if kind == FaultKind::HardwareFault && !was_retry {
                self.retry_next_tick = true;
            }
            if kind.is_escalated() {
                self.fault(at.as_ref(), kind, format_args!("upload window: {}", error));
            } else {
                warn!("Upload window skipped: {}", error);
            }
        }

        self.link.power_down().await;
        report
    }

    fn restore(&mut self) {
        match self.checkpoint.load(&mut self.storage) {
            Ok(Some(state)) => {
                self.schedule = state.schedule;
                self.sequencer
                    .restore(state.open_file.clone(), state.opened_at, state.sealed.iter());
                self.uploader.backlog.restore(&state.backlog);
            }
            Ok(None) => {}
            Err(error) => self.fault(
                None,
                FaultKind::StorageFault,
                format_args!("saved state unreadable: {}", error),
            ),
        }
    }

    fn flush_debug_log(&mut self) {
        let (Some(sink), Some(file)) = (self.debug_log, self.debug_log_file) else {
            return;
        };
        if let Err(error) = sink.flush(&mut self.storage, file) {
            warn!("Debug log not written to {}: {}", file, error);
        }
    }

    fn persisted_state(&self) -> PersistedState {
        let mut state = PersistedState {
            schedule: self.schedule,
            open_file: self.sequencer.open_name().cloned(),
            opened_at: self.sequencer.opened_at(),
            sealed: heapless::Vec::new(),
            backlog: self.uploader.backlog.persisted(),
        };
        for name in self.sequencer.sealed_names() {
            let _ = state.sealed.push(name.clone());
        }
        state
    }

    fn persist(&mut self, at: Option<&DateTime>) {
        let state = self.persisted_state();
        if let Err(error) = self.checkpoint.save(&mut self.storage, state) {
            self.fault(at, FaultKind::StorageFault, format_args!("state not saved: {}", error));
        }
    }

    fn fault(&mut self, at: Option<&DateTime>, kind: FaultKind, detail: core::fmt::Arguments<'_>) {
        self.uploader.fault(&mut self.storage, at, kind, detail);
    }
}

async fn sync_clock<T: ModemTransport, C: Clock>(link: &mut RegisteredLink<'_, T>, clock: &mut C) {
    match link.network_time().await {
        Ok(Some(time)) => match clock.set(time) {
            Ok(()) => info!("Clock set from network: {}", time),
            Err(e) => warn!("Could not set clock: {}", e),
        },
        Ok(None) => debug!("Network time not available"),
        Err(e) => debug!("Network time query failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteNaming;
    use crate::modem::LinkError;
    use crate::sim::{NoopDelay, SimBattery, SimClock, SimModem, SimPower, sim_config};
    use crate::modem::ftp::DATA_CHUNK;
    use crate::storage::{DebugLine, DebugLog, MemoryStorage, StorageError};
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use embassy_futures::block_on;

    type Orchestrator<'a> =
        UploadOrchestrator<'a, MemoryStorage, SimClock, SimModem, SimPower, NoopDelay, SimBattery>;

    fn at(day: u8, hour: u8, minute: u8) -> DateTime {
        DateTime::new(2024, 1, day, hour, minute).unwrap()
    }

    /// No boot window and no clock sync, so tests see only their own traffic.
    fn quiet_config() -> Config<'static> {
        let mut config = sim_config();
        config.ftp.status_logging = false;
        config.sync_clock_from_network = false;
        config
    }

    fn build<'a>(
        config: &Config<'a>,
        pulses: &'a PulseAccumulator,
        modem: &SimModem,
        clock: &SimClock,
        storage: MemoryStorage,
    ) -> Orchestrator<'a> {
        let link = LinkController::new(modem.clone(), modem.power(), NoopDelay, config);
        UploadOrchestrator::new(config, pulses, storage, clock.clone(), link, SimBattery::default())
            .unwrap()
    }

    /// Card that keeps a copy of itself as it stood when store session
    /// number `cut_at` began reading its file, which is what a reset in the
    /// middle of that transfer leaves behind. Nothing reaches the card or
    /// the server after the cut.
    struct PowerCut {
        card: MemoryStorage,
        modem: SimModem,
        cut_at: usize,
        frozen: Rc<RefCell<Option<MemoryStorage>>>,
    }

    impl PowerCut {
        fn powered(&mut self) -> Result<(), StorageError> {
            let mut frozen = self.frozen.borrow_mut();
            if frozen.is_some() {
                return Err(StorageError::Device);
            }
            if self.modem.count_commands("AT+FTPPUT=1") >= self.cut_at {
                *frozen = Some(self.card.clone());
                return Err(StorageError::Device);
            }
            Ok(())
        }
    }

    impl Storage for PowerCut {
        fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.powered()?;
            self.card.append(name, bytes)
        }

        fn exists(&mut self, name: &str) -> bool {
            self.card.exists(name)
        }

        fn len(&mut self, name: &str) -> Result<u32, StorageError> {
            self.card.len(name)
        }

        fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
            self.powered()?;
            self.card.read_at(name, offset, buf)
        }

        fn remove(&mut self, name: &str) -> Result<(), StorageError> {
            self.powered()?;
            self.card.remove(name)
        }
    }

    /// Run the 23:58 and midnight ticks on a card that loses power during
    /// store session `cut_at`, and return the card as it was at that moment.
    fn cut_power_during_rollover(
        config: &Config<'static>,
        modem: &SimModem,
        clock: &SimClock,
        card: MemoryStorage,
        cut_at: usize,
    ) -> MemoryStorage {
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let frozen = Rc::new(RefCell::new(None));
        let storage = PowerCut {
            card,
            modem: modem.clone(),
            cut_at,
            frozen: Rc::clone(&frozen),
        };
        let link = LinkController::new(modem.clone(), modem.power(), NoopDelay, config);
        let mut orchestrator = UploadOrchestrator::new(
            config,
            &pulses,
            storage,
            clock.clone(),
            link,
            SimBattery::default(),
        )
        .unwrap();

        block_on(orchestrator.tick());
        clock.advance(2);
        assert!(block_on(orchestrator.tick()).window.is_some());

        frozen.borrow_mut().take().expect("store session never started")
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn error_log(orchestrator: &Orchestrator<'_>) -> String {
        orchestrator
            .storage()
            .contents("ERROR.LOG")
            .map(text)
            .unwrap_or_default()
    }

    #[test]
    fn test_snapshot_appends_reading_once_per_minute() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 0, 2)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        assert_eq!(block_on(orchestrator.start()), None);
        for ms in [0, 200, 400] {
            pulses.on_edge(ms);
        }
        pulses.settle(500);

        let report = block_on(orchestrator.tick());
        let reading = report.reading.unwrap();
        assert_eq!(reading.pulses, 3);
        assert_eq!(reading.value, 15.0);
        assert_eq!(
            orchestrator.storage().contents("24011520.DAT").unwrap(),
            b"2024-01-15 00:02,3,15.00\n"
        );

        let again = block_on(orchestrator.tick());
        assert_eq!(again.reading, None);
        assert_eq!(modem.commands().len(), 0);
    }

    #[test]
    fn test_rollover_seals_once_and_uploads() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());
        block_on(orchestrator.start());

        assert_eq!(block_on(orchestrator.tick()).sealed, None);

        clock.advance(2);
        let report = block_on(orchestrator.tick());
        assert_eq!(report.sealed.as_deref(), Some("24011520.DAT"));
        let window = report.window.unwrap();
        assert_eq!(window.link, Ok(()));
        assert_eq!(window.finished.len(), 1);
        assert_eq!(window.finished[0].outcome, JobOutcome::Succeeded);
        assert_eq!(window.finished[0].attempts, 1);

        // The 00:00 reading closes the old day's file
        let local = orchestrator.storage().contents("24011520.DAT").unwrap().to_vec();
        assert_eq!(
            text(&local),
            "2024-01-15 23:58,0,0.00\n2024-01-16 00:00,0,0.00\n"
        );
        assert_eq!(modem.remote_file("/shared/data/20.data").unwrap(), local);
        assert!(!modem.is_powered());
        assert!(orchestrator.backlog().is_empty());

        clock.advance(2);
        let report = block_on(orchestrator.tick());
        assert_eq!(report.sealed, None);
        assert_eq!(report.window, None);
        assert_eq!(modem.count_commands("AT+FTPPUT=1"), 1);
    }

    #[test]
    fn test_store_failures_retried_within_job_bound() {
        let mut config = quiet_config();
        config.state_retries = 1;
        config.job_attempts = 3;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.fail_store_sessions(2);
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        let window = block_on(orchestrator.tick()).window.unwrap();

        let job = &window.finished[0];
        assert_eq!(job.outcome, JobOutcome::Succeeded);
        assert_eq!(job.attempts, 3);
        // Every job attempt restarts from connect
        assert_eq!(modem.count_commands("AT+FTPSERV"), 3);
        assert_eq!(error_log(&orchestrator), "");
    }

    #[test]
    fn test_job_abandoned_after_bound() {
        let mut config = quiet_config();
        config.state_retries = 1;
        config.job_attempts = 3;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.fail_store_sessions(10);
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        let window = block_on(orchestrator.tick()).window.unwrap();

        let job = &window.finished[0];
        assert_eq!(job.outcome, JobOutcome::Failed(FaultKind::ProtocolError));
        assert_eq!(job.attempts, 3);
        assert_eq!(modem.count_commands("AT+FTPPUT=1"), 3);
        assert!(orchestrator.backlog().is_empty());
        assert!(error_log(&orchestrator).contains(",UploadAbandoned,24011520.DAT after 3 attempts"));

        // The slot window does not pick the abandoned file up again
        clock.set_time(Some(at(16, 0, 20)));
        let window = block_on(orchestrator.tick()).window.unwrap();
        assert!(window.finished.is_empty());
        assert_eq!(modem.count_commands("AT+FTPPUT=1"), 3);
    }

    #[test]
    fn test_weak_signal_defers_to_next_slot() {
        let mut config = quiet_config();
        config.max_retries = 2;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.set_signal(5);
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        let window = block_on(orchestrator.tick()).window.unwrap();
        assert_eq!(
            window.link,
            Err(LinkError::InsufficientSignal {
                quality: 5,
                threshold: 11
            })
        );
        assert_eq!(orchestrator.backlog().len(), 1);
        assert!(!modem.is_powered());
        assert_eq!(error_log(&orchestrator), "");

        modem.set_signal(20);
        clock.advance(2);
        assert_eq!(block_on(orchestrator.tick()).window, None);

        clock.set_time(Some(at(16, 0, 20)));
        let window = block_on(orchestrator.tick()).window.unwrap();
        assert_eq!(window.succeeded().count(), 1);
        assert!(orchestrator.backlog().is_empty());
    }

    #[test]
    fn test_backlog_uploads_oldest_first() {
        let mut config = quiet_config();
        config.max_retries = 1;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.set_signal(3);
        let clock = SimClock::new(Some(at(15, 12, 0)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        for day in 15..=17 {
            clock.set_time(Some(at(day, 12, 0)));
            block_on(orchestrator.tick());
            clock.set_time(Some(at(day + 1, 0, 0)));
            assert!(block_on(orchestrator.tick()).sealed.is_some());
        }
        assert_eq!(orchestrator.backlog().len(), 3);

        modem.set_signal(20);
        clock.set_time(Some(at(18, 0, 20)));
        let window = block_on(orchestrator.tick()).window.unwrap();

        let order: Vec<&str> = window.finished.iter().map(|job| job.file.as_str()).collect();
        assert_eq!(order, ["24011520.DAT", "24011620.DAT", "24011720.DAT"]);

        let mut expected = Vec::new();
        for name in order {
            expected.extend_from_slice(orchestrator.storage().contents(name).unwrap());
        }
        assert_eq!(modem.remote_file("/shared/data/20.data").unwrap(), expected);
    }

    #[test]
    fn test_per_file_naming_overwrites_under_local_name() {
        let mut config = quiet_config();
        config.ftp.naming = RemoteNaming::PerFile;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        block_on(orchestrator.tick());

        assert_eq!(modem.count_commands("AT+FTPPUTOPT=\"STOR\""), 1);
        assert_eq!(
            modem.remote_file("/shared/data/24011520.DAT").as_deref(),
            orchestrator.storage().contents("24011520.DAT")
        );
    }

    #[test]
    fn test_unstorable_reading_is_recorded() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 0, 2)));
        let mut storage = MemoryStorage::new();
        storage.set_read_only("24011520.DAT", true);
        let mut orchestrator = build(&config, &pulses, &modem, &clock, storage);

        pulses.on_edge(0);
        pulses.settle(100);
        block_on(orchestrator.tick());

        assert_eq!(
            error_log(&orchestrator),
            "2024-01-15 00:02,StorageFault,reading 2024-01-15 00:02,1,5.00 lost, \
             24011520.DAT not writable: storage device error\n"
        );
    }

    #[test]
    fn test_oversized_remote_path_is_not_retried() {
        let mut config = quiet_config();
        config.ftp.data_path = "/a/remote/directory/path/that/is/much/longer/than/the/buffer/";
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        let window = block_on(orchestrator.tick()).window.unwrap();

        assert_eq!(window.finished[0].outcome, JobOutcome::Failed(FaultKind::CommandTooLong));
        assert_eq!(window.finished[0].attempts, 1);
        assert_eq!(modem.count_commands("AT+FTP"), 0);
        assert!(error_log(&orchestrator).contains(",CommandTooLong,upload of 24011520.DAT abandoned"));
    }

    #[test]
    fn test_hardware_fault_retried_next_tick_once() {
        let mut config = quiet_config();
        config.max_retries = 2;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.set_responsive(false);
        let clock = SimClock::new(Some(at(15, 0, 20)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        let window = block_on(orchestrator.tick()).window.unwrap();
        assert_eq!(window.link, Err(LinkError::HardwareFault { checks: 2 }));
        assert!(error_log(&orchestrator).contains(",HardwareFault,"));

        clock.advance(1);
        assert!(block_on(orchestrator.tick()).window.is_some());
        clock.advance(1);
        assert_eq!(block_on(orchestrator.tick()).window, None);
    }

    #[test]
    fn test_clock_failure_logged_once() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 0, 2)));
        clock.set_failing(true);
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        assert_eq!(block_on(orchestrator.tick()).now, None);
        assert_eq!(block_on(orchestrator.tick()).now, None);
        assert_eq!(error_log(&orchestrator).matches("ClockFault").count(), 1);

        clock.set_failing(false);
        assert!(block_on(orchestrator.tick()).reading.is_some());
    }

    #[test]
    fn test_state_survives_restart() {
        let mut config = quiet_config();
        config.max_retries = 1;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.set_signal(0);
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        block_on(orchestrator.tick());
        clock.advance(2);
        block_on(orchestrator.tick());
        assert_eq!(orchestrator.backlog().len(), 1);

        let storage = orchestrator.storage().clone();
        let mut restarted = build(&config, &pulses, &modem, &clock, storage);
        block_on(restarted.start());

        assert_eq!(restarted.backlog().len(), 1);
        assert_eq!(
            restarted.sequencer().open_name().map(|n| n.as_str()),
            Some("24011620.DAT")
        );
        assert!(restarted.sequencer().is_sealed("24011520.DAT"));
        // Same minute as before the reset: nothing fires twice
        let report = block_on(restarted.tick());
        assert_eq!(report.reading, None);
        assert_eq!(report.window, None);
    }

    #[test]
    fn test_boot_syncs_clock_and_posts_status() {
        let config = sim_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.set_network_time(Some(at(15, 0, 20)));
        let clock = SimClock::new(None);
        let mut orchestrator = build(&config, &pulses, &modem, &clock, MemoryStorage::new());

        let window = block_on(orchestrator.start()).unwrap();
        assert_eq!(window.link, Ok(()));
        assert_eq!(window.status_lines, 1);
        assert_eq!(clock.time(), Some(at(15, 0, 20)));
        assert_eq!(
            text(&modem.remote_file("/shared/log/20.log").unwrap()),
            "0000-00-00 00:00,20,BOOT,backlog 0,battery 4.05V\n"
        );
        assert!(orchestrator.status_queue().is_empty());
        assert!(!modem.is_powered());
    }

    #[test]
    fn test_boot_line_without_battery_reading() {
        let mut config = sim_config();
        config.sync_clock_from_network = false;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 0, 20)));
        let link = LinkController::new(modem.clone(), modem.power(), NoopDelay, &config);
        let battery = SimBattery::new(None);
        let mut orchestrator = UploadOrchestrator::new(
            &config,
            &pulses,
            MemoryStorage::new(),
            clock.clone(),
            link,
            battery,
        )
        .unwrap();

        block_on(orchestrator.start()).unwrap();
        assert_eq!(
            text(&modem.remote_file("/shared/log/20.log").unwrap()),
            "2024-01-15 00:20,20,BOOT,backlog 0,battery unknown\n"
        );
    }

    #[test]
    fn test_tick_flushes_debug_log_to_card() {
        let config = quiet_config();
        let sink = DebugLog::new();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 12, 0)));
        let mut orchestrator =
            build(&config, &pulses, &modem, &clock, MemoryStorage::new()).with_debug_log(&sink);

        sink.push_line(DebugLine::try_from("INFO  first").unwrap());
        block_on(orchestrator.tick());
        sink.push_line(DebugLine::try_from("WARN  second").unwrap());
        clock.set_time(None);
        block_on(orchestrator.tick());

        assert!(sink.is_empty());
        assert_eq!(
            text(orchestrator.storage().contents("DEBUG.LOG").unwrap()),
            "INFO  first\nWARN  second\n"
        );
    }

    #[test]
    fn test_faults_reach_remote_error_log() {
        let mut config = sim_config();
        config.sync_clock_from_network = false;
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 0, 2)));
        let mut storage = MemoryStorage::new();
        storage.set_read_only("24011520.DAT", true);
        let mut orchestrator = build(&config, &pulses, &modem, &clock, storage);

        block_on(orchestrator.start());
        block_on(orchestrator.tick());
        assert_eq!(orchestrator.status_queue().len(), 1);

        orchestrator.storage_mut().set_read_only("24011520.DAT", false);
        clock.set_time(Some(at(15, 0, 20)));
        let window = block_on(orchestrator.tick()).window.unwrap();
        assert_eq!(window.status_lines, 1);
        let remote = text(&modem.remote_file("/shared/log/20.err").unwrap());
        assert!(remote.starts_with("2024-01-15 00:02,20,StorageFault,reading"));
    }

    #[test]
    fn test_reset_mid_window_does_not_repeat_the_minute() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let card = cut_power_during_rollover(&config, &modem, &clock, MemoryStorage::new(), 1);

        // Rebooted within the same minute
        let mut restarted = build(&config, &pulses, &modem, &clock, card);
        block_on(restarted.start());
        assert_eq!(block_on(restarted.tick()).reading, None);

        let data = text(restarted.storage().contents("24011520.DAT").unwrap());
        assert_eq!(data.matches("2024-01-16 00:00").count(), 1);
        assert_eq!(
            restarted.sequencer().open_name().map(|n| n.as_str()),
            Some("24011620.DAT")
        );
        let queued: Vec<&str> = restarted.backlog().iter().map(|job| job.file.as_str()).collect();
        assert_eq!(queued, ["24011520.DAT"]);
    }

    #[test]
    fn test_reset_mid_upload_keeps_acknowledged_bytes() {
        let config = quiet_config();
        let pulses = PulseAccumulator::new(config.min_pulse_width_ms);
        let modem = SimModem::new();
        modem.drop_channel_after(2000);
        let clock = SimClock::new(Some(at(15, 23, 58)));
        let mut card = MemoryStorage::new();
        card.append("24011520.DAT", &[b'x'; 3000]).unwrap();

        // The first session drops after three chunks; power fails as the
        // second one starts
        let card = cut_power_during_rollover(&config, &modem, &clock, card, 2);

        let mut restarted = build(&config, &pulses, &modem, &clock, card);
        block_on(restarted.start());
        let job = restarted.backlog().iter().next().unwrap();
        assert_eq!(job.file.as_str(), "24011520.DAT");
        assert_eq!(job.committed, 3 * DATA_CHUNK as u32);

        // The next window sends only the rest
        clock.set_time(Some(at(16, 0, 20)));
        let window = block_on(restarted.tick()).window.unwrap();
        assert_eq!(window.succeeded().count(), 1);
        let local = restarted.storage().contents("24011520.DAT").unwrap().to_vec();
        assert_eq!(modem.remote_file("/shared/data/20.data"), Some(local));
    }
}
