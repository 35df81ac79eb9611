//! Simulated collaborators for host tests and the desktop simulator
//!
//! [`SimModem`] answers the SIM800 AT subset the link controller and transfer
//! client use and keeps the files the FTP server would hold. Handles are
//! cheap clones sharing one state, so a test can keep one to inspect and
//! steer the modem while the controller owns another.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use embedded_hal_async::delay::DelayNs;
use log::trace;

use crate::battery::{BatteryError, BatteryMonitor};
use crate::config::{ApnConfig, Config, FtpConfig, RemoteNaming, UnitId};
use crate::modem::{ModemPower, ModemTransport, TransportError};
use crate::time::{Clock, ClockError, DateTime};

const SIM_UNIT: UnitId = match UnitId::new(20) {
    Ok(unit) => unit,
    Err(_) => panic!("simulated unit id out of range"),
};

/// Deployed defaults for unit 20 against a shared example server.
pub fn sim_config() -> Config<'static> {
    Config::new(
        SIM_UNIT,
        FtpConfig {
            host: "ftp.example.net",
            port: 21,
            username: "logger",
            password: "secret",
            data_path: "/shared/data/",
            naming: RemoteNaming::PerUnit,
            data_suffix: "data",
            status_logging: true,
            log_path: "/shared/log/",
            boot_suffix: "log",
            fault_suffix: "err",
        },
        ApnConfig {
            name: "m2mglobal",
            username: "",
            password: "",
        },
    )
}

/// Largest data chunk the simulated modem accepts per request
pub const SIM_MAX_CHUNK: usize = 1360;

#[derive(Default)]
struct FtpSession {
    path: String,
    name: String,
    append: bool,
    open: bool,
    bytes: usize,
}

struct SimState {
    powered: bool,
    responsive: bool,
    registration: u8,
    signal: u8,
    network_time: Option<DateTime>,
    bearer_open: bool,
    line: Vec<u8>,
    raw_expected: usize,
    raw: Vec<u8>,
    rx: VecDeque<u8>,
    commands: Vec<String>,
    remote: BTreeMap<String, Vec<u8>>,
    failures: Vec<(String, u32)>,
    store_failures: u32,
    drop_after: Option<usize>,
    reject_login: bool,
    ftp: FtpSession,
}

impl SimState {
    fn reply(&mut self, line: &str) {
        trace!("sim < {}", line);
        self.rx.extend(b"\r\n");
        self.rx.extend(line.as_bytes());
        self.rx.extend(b"\r\n");
    }

    fn receive_byte(&mut self, byte: u8) {
        if self.raw_expected > 0 {
            self.raw.push(byte);
            if self.raw.len() == self.raw_expected {
                self.finish_data();
            }
            return;
        }

        match byte {
            b'\r' => {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                if !line.is_empty() {
                    self.execute(&line);
                }
            }
            b'\n' => {}
            other => self.line.push(other),
        }
    }

    fn execute(&mut self, command: &str) {
        trace!("sim > {}", command);
        self.commands.push(command.to_string());

        let injected = self
            .failures
            .iter_mut()
            .find(|(prefix, remaining)| *remaining > 0 && command.starts_with(prefix.as_str()))
            .map(|(_, remaining)| *remaining -= 1)
            .is_some();
        if injected {
            self.reply("ERROR");
            return;
        }

        let (name, argument) = command.split_once('=').unwrap_or((command, ""));
        let value = argument.trim_matches('"').to_string();

        match name {
            "AT" | "ATE0" | "AT+CMEE" | "AT+CLTS" | "AT+FTPCID" | "AT+FTPSERV" | "AT+FTPPORT"
            | "AT+FTPUN" | "AT+FTPPW" => self.reply("OK"),
            "AT+CREG?" => {
                let line = format!("+CREG: 0,{}", self.registration);
                self.reply(&line);
                self.reply("OK");
            }
            "AT+CSQ" => {
                let line = format!("+CSQ: {},0", self.signal);
                self.reply(&line);
                self.reply("OK");
            }
            "AT+CCLK?" => match self.network_time {
                Some(t) => {
                    let line = format!(
                        "+CCLK: \"{:02}/{:02}/{:02},{:02}:{:02}:00+00\"",
                        t.year % 100,
                        t.month,
                        t.day,
                        t.hour,
                        t.minute
                    );
                    self.reply(&line);
                    self.reply("OK");
                }
                None => self.reply("ERROR"),
            },
            "AT+CPOWD" => {
                self.reply("NORMAL POWER DOWN");
                self.power_off();
            }
            "AT+SAPBR" => self.bearer(argument),
            "AT+FTPPUTPATH" => {
                self.ftp.path = value;
                self.reply("OK");
            }
            "AT+FTPPUTNAME" => {
                self.ftp.name = value;
                self.reply("OK");
            }
            "AT+FTPPUTOPT" => {
                self.ftp.append = value == "APPE";
                self.reply("OK");
            }
            "AT+FTPPUT" => self.put(argument),
            "AT+FTPQUIT" if self.ftp.open => {
                self.ftp.open = false;
                self.reply("OK");
            }
            _ => self.reply("ERROR"),
        }
    }

    fn bearer(&mut self, argument: &str) {
        if argument.starts_with("2,1") {
            let line = format!(
                "+SAPBR: 1,{},\"10.0.0.2\"",
                if self.bearer_open { 1 } else { 3 }
            );
            self.reply(&line);
        } else if argument.starts_with("1,1") {
            self.bearer_open = true;
        } else if argument.starts_with("0,1") {
            self.bearer_open = false;
        }
        self.reply("OK");
    }

    fn put(&mut self, argument: &str) {
        match argument.split_once(',') {
            None if argument == "1" => {
                self.reply("OK");
                if self.reject_login {
                    self.reply("+FTPPUT: 1,71");
                } else if self.store_failures > 0 {
                    self.store_failures -= 1;
                    self.reply("+FTPPUT: 1,77");
                } else {
                    if !self.ftp.append {
                        let path = self.remote_path();
                        self.remote.insert(path, Vec::new());
                    }
                    self.ftp.open = true;
                    self.ftp.bytes = 0;
                    let line = format!("+FTPPUT: 1,1,{}", SIM_MAX_CHUNK);
                    self.reply(&line);
                }
            }
            Some(("2", "0")) if self.ftp.open => {
                self.ftp.open = false;
                self.reply("OK");
                self.reply("+FTPPUT: 1,0");
            }
            Some(("2", len)) if self.ftp.open => match len.parse::<usize>() {
                Ok(len) if len > 0 => {
                    self.raw_expected = len.min(SIM_MAX_CHUNK);
                    let line = format!("+FTPPUT: 2,{}", self.raw_expected);
                    self.reply(&line);
                }
                _ => self.reply("ERROR"),
            },
            _ => self.reply("ERROR"),
        }
    }

    fn finish_data(&mut self) {
        let data = core::mem::take(&mut self.raw);
        self.raw_expected = 0;
        self.reply("OK");

        if self
            .drop_after
            .is_some_and(|limit| self.ftp.bytes + data.len() > limit)
        {
            self.drop_after = None;
            self.ftp.open = false;
            self.reply("+FTPPUT: 1,61");
            return;
        }

        let path = self.remote_path();
        self.remote.entry(path).or_default().extend_from_slice(&data);
        self.ftp.bytes += data.len();
        let line = format!("+FTPPUT: 1,1,{}", SIM_MAX_CHUNK);
        self.reply(&line);
    }

    fn remote_path(&self) -> String {
        format!("{}{}", self.ftp.path, self.ftp.name)
    }

    fn power_off(&mut self) {
        self.powered = false;
        self.bearer_open = false;
        self.ftp.open = false;
        self.raw_expected = 0;
        self.raw.clear();
        self.line.clear();
    }
}

/// Scriptable SIM800-class modem with an attached FTP server.
#[derive(Clone)]
pub struct SimModem {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimModem {
    fn default() -> Self {
        Self::new()
    }
}

impl SimModem {
    /// A switched-off modem on a home network with good signal.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                powered: false,
                responsive: true,
                registration: 1,
                signal: 20,
                network_time: None,
                bearer_open: false,
                line: Vec::new(),
                raw_expected: 0,
                raw: Vec::new(),
                rx: VecDeque::new(),
                commands: Vec::new(),
                remote: BTreeMap::new(),
                failures: Vec::new(),
                store_failures: 0,
                drop_after: None,
                reject_login: false,
                ftp: FtpSession::default(),
            })),
        }
    }

    /// Power key wired to this modem.
    pub fn power(&self) -> SimPower {
        SimPower {
            state: Rc::clone(&self.state),
        }
    }

    pub fn set_signal(&self, rssi: u8) {
        self.state.borrow_mut().signal = rssi;
    }

    /// `+CREG` status: 1 home, 2 searching, 5 roaming.
    pub fn set_registration(&self, status: u8) {
        self.state.borrow_mut().registration = status;
    }

    /// An unresponsive modem swallows commands without answering.
    pub fn set_responsive(&self, responsive: bool) {
        self.state.borrow_mut().responsive = responsive;
    }

    pub fn set_network_time(&self, time: Option<DateTime>) {
        self.state.borrow_mut().network_time = time;
    }

    /// Answer the next `times` commands starting with `prefix` with `ERROR`.
    pub fn fail_command(&self, prefix: &str, times: u32) {
        self.state
            .borrow_mut()
            .failures
            .push((prefix.to_string(), times));
    }

    /// Fail the next `times` FTP store sessions with an operation error.
    pub fn fail_store_sessions(&self, times: u32) {
        self.state.borrow_mut().store_failures = times;
    }

    /// Drop the data channel once a session would pass `bytes`.
    ///
    /// The chunk that crosses the limit is discarded. Fires once.
    pub fn drop_channel_after(&self, bytes: usize) {
        self.state.borrow_mut().drop_after = Some(bytes);
    }

    pub fn reject_login(&self, reject: bool) {
        self.state.borrow_mut().reject_login = reject;
    }

    pub fn is_powered(&self) -> bool {
        self.state.borrow().powered
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().remote.get(path).cloned()
    }

    pub fn remote_files(&self) -> Vec<String> {
        self.state.borrow().remote.keys().cloned().collect()
    }
}

impl ModemTransport for SimModem {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.powered || !state.responsive {
            return Ok(());
        }
        for byte in bytes {
            state.receive_byte(*byte);
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.rx.is_empty() {
            return Err(TransportError::Timeout);
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

pub struct SimPower {
    state: Rc<RefCell<SimState>>,
}

impl ModemPower for SimPower {
    fn is_on(&mut self) -> bool {
        self.state.borrow().powered
    }

    async fn toggle(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.powered {
            state.power_off();
        } else {
            state.powered = true;
            state.rx.clear();
        }
    }
}

/// Manually advanced wall clock, shared between clones.
#[derive(Clone, Default)]
pub struct SimClock {
    time: Rc<RefCell<Option<DateTime>>>,
    failing: Rc<RefCell<bool>>,
}

impl SimClock {
    pub fn new(time: Option<DateTime>) -> Self {
        Self {
            time: Rc::new(RefCell::new(time)),
            failing: Rc::new(RefCell::new(false)),
        }
    }

    pub fn time(&self) -> Option<DateTime> {
        *self.time.borrow()
    }

    pub fn set_time(&self, time: Option<DateTime>) {
        *self.time.borrow_mut() = time;
    }

    pub fn advance(&self, minutes: u32) {
        let mut time = self.time.borrow_mut();
        *time = time.map(|t| t.plus_minutes(minutes));
    }

    /// Make reads fail as an unreachable RTC would.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.borrow_mut() = failing;
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> Result<DateTime, ClockError> {
        if *self.failing.borrow() {
            return Err(ClockError::Bus);
        }
        self.time.borrow().ok_or(ClockError::NotSet)
    }

    fn set(&mut self, time: DateTime) -> Result<(), ClockError> {
        *self.time.borrow_mut() = Some(time);
        Ok(())
    }
}

/// Battery divider reading, shared between clones. `None` reads as a
/// converter fault.
#[derive(Clone)]
pub struct SimBattery {
    raw: Rc<RefCell<Option<u16>>>,
}

impl SimBattery {
    /// About 4.05 V through the deployed divider
    pub const CHARGED: u16 = 2400;

    pub fn new(raw: Option<u16>) -> Self {
        Self {
            raw: Rc::new(RefCell::new(raw)),
        }
    }

    pub fn set_raw(&self, raw: Option<u16>) {
        *self.raw.borrow_mut() = raw;
    }
}

impl Default for SimBattery {
    fn default() -> Self {
        Self::new(Some(Self::CHARGED))
    }
}

impl BatteryMonitor for SimBattery {
    fn read_raw(&mut self) -> Result<u16, BatteryError> {
        self.raw.borrow().ok_or(BatteryError::Converter)
    }
}

/// Delay that returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelay;

impl DelayNs for NoopDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}
