//! Deploy-time configuration
//!
//! Everything the logger needs to know about its deployment lives in one
//! immutable [`Config`], built once at startup and borrowed by every
//! component. Formulas (file naming, pulse calibration, schedule predicates)
//! are plain function pointers so a deployment can swap them without touching
//! the state machines that use them.

use core::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::time::DateTime;

/// Unit ids must stay below this bound (two decimal digits in file names)
pub const MAX_UNIT_ID: u8 = 100;

/// Compiled capacity for local and remote file names
pub const FILENAME_CAPACITY: usize = 32;

/// Compiled capacity of the AT command working buffer
pub const COMMAND_CAPACITY: usize = 128;

/// Highest value `AT+CSQ` reports for a known signal
pub const MAX_SIGNAL_QUALITY: u8 = 31;

pub type FileName = heapless::String<FILENAME_CAPACITY>;

/// Renders the local data file name for a minute.
pub type FilenameFormula = fn(&DateTime, UnitId, &mut dyn Write) -> fmt::Result;

/// Converts a raw pulse count into the physical quantity it represents.
pub type Calibration = fn(u32) -> f32;

/// Converts a raw battery divider reading into volts.
pub type VoltageFormula = fn(u16) -> f32;

/// Decides whether a snapshot is due at a minute.
pub type SnapshotPredicate = fn(&DateTime) -> bool;

/// Decides whether a minute is this unit's upload slot.
pub type UploadPredicate = fn(&DateTime, UnitId) -> bool;

/// Identity of a deployed unit, used to namespace file names on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(u8);

impl UnitId {
    pub const fn new(id: u8) -> Result<Self, ConfigError> {
        if id < MAX_UNIT_ID {
            Ok(Self(id))
        } else {
            Err(ConfigError::UnitIdOutOfRange(id))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet data access point credentials
#[derive(Debug, Clone, Copy)]
pub struct ApnConfig<'a> {
    pub name: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

/// How sealed data files map onto remote objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteNaming {
    /// Every sealed file is appended to one growing `<unit>.<suffix>` object.
    PerUnit,
    /// Every sealed file is stored under its local name, replacing any copy.
    PerFile,
}

#[derive(Debug, Clone, Copy)]
pub struct FtpConfig<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    /// Directory for data uploads, ending in `/`
    pub data_path: &'a str,
    pub naming: RemoteNaming,
    pub data_suffix: &'a str,
    /// Upload boot and fault status lines to `log_path`
    pub status_logging: bool,
    /// Directory for status uploads, ending in `/`
    pub log_path: &'a str,
    pub boot_suffix: &'a str,
    pub fault_suffix: &'a str,
}

#[derive(Clone, Copy)]
pub struct Config<'a> {
    pub unit_id: UnitId,

    pub snapshot_due: SnapshotPredicate,
    pub upload_due: UploadPredicate,
    /// Open an upload window as soon as a file is sealed, not only at the slot
    pub upload_on_seal: bool,

    pub filename_formula: FilenameFormula,
    /// Size of a persisted name slot; names must be strictly shorter
    pub filename_max_len: usize,
    pub error_log_file: &'a str,
    /// Local copy of the debug log; `None` keeps it off the card
    pub debug_log_file: Option<&'a str>,

    pub calibration: Calibration,
    pub min_pulse_width_ms: u32,
    pub battery_voltage: VoltageFormula,

    pub rssi_threshold: u8,
    pub roaming_enabled: bool,
    pub sync_clock_from_network: bool,
    pub apn: ApnConfig<'a>,

    /// Bound for every wait-and-check loop on the modem
    pub max_retries: u8,
    pub network_reg_delay_ms: u32,
    pub power_check_interval_ms: u32,
    pub command_buffer_size: usize,
    pub response_timeout_ms: u32,
    /// Bound for waits on the network side (bearer, FTP session, data acks)
    pub session_timeout_ms: u32,

    /// Attempts per protocol state within one transfer
    pub state_retries: u8,
    /// Transfers (each restarting from connect) per upload job
    pub job_attempts: u8,

    pub ftp: FtpConfig<'a>,
}

impl<'a> Config<'a> {
    /// Configuration with the deployed defaults for everything except the
    /// unit identity, server and access point.
    pub fn new(unit_id: UnitId, ftp: FtpConfig<'a>, apn: ApnConfig<'a>) -> Self {
        Self {
            unit_id,
            snapshot_due: every_even_minute,
            upload_due: minute_of_day_slot,
            upload_on_seal: true,
            filename_formula: daily_filename,
            filename_max_len: 16,
            error_log_file: "ERROR.LOG",
            debug_log_file: Some("DEBUG.LOG"),
            calibration: five_units_per_pulse,
            min_pulse_width_ms: 100,
            battery_voltage: divided_adc_volts,
            rssi_threshold: 11,
            roaming_enabled: true,
            sync_clock_from_network: true,
            apn,
            max_retries: 10,
            network_reg_delay_ms: 10_000,
            power_check_interval_ms: 1_000,
            command_buffer_size: 70,
            response_timeout_ms: 2_000,
            session_timeout_ms: 75_000,
            state_retries: 3,
            job_attempts: 3,
            ftp,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        UnitId::new(self.unit_id.get())?;

        if self.rssi_threshold > MAX_SIGNAL_QUALITY {
            return Err(ConfigError::ThresholdOutOfRange(self.rssi_threshold));
        }
        if self.max_retries == 0 || self.state_retries == 0 || self.job_attempts == 0 {
            return Err(ConfigError::ZeroRetryBound);
        }
        if self.command_buffer_size == 0 || self.command_buffer_size > COMMAND_CAPACITY {
            return Err(ConfigError::CommandBuffer {
                size: self.command_buffer_size,
                capacity: COMMAND_CAPACITY,
            });
        }
        if self.filename_max_len < 2 || self.filename_max_len > FILENAME_CAPACITY {
            return Err(ConfigError::FilenameSlot {
                size: self.filename_max_len,
                capacity: FILENAME_CAPACITY,
            });
        }

        Ok(())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unit id {0} is out of range (must be below 100)")]
    UnitIdOutOfRange(u8),
    #[error("signal threshold {0} is out of range (0-31)")]
    ThresholdOutOfRange(u8),
    #[error("retry bounds must be at least 1")]
    ZeroRetryBound,
    #[error("command buffer of {size} bytes is outside 1..={capacity}")]
    CommandBuffer { size: usize, capacity: usize },
    #[error("filename slot of {size} bytes is outside 2..={capacity}")]
    FilenameSlot { size: usize, capacity: usize },
}

/// `yyMMddUU.DAT`: one file per day, 8.3 safe for FAT media.
pub fn daily_filename(now: &DateTime, unit: UnitId, out: &mut dyn Write) -> fmt::Result {
    write!(
        out,
        "{:02}{:02}{:02}{:02}.DAT",
        now.year % 100,
        now.month,
        now.day,
        unit.get()
    )
}

pub fn five_units_per_pulse(pulses: u32) -> f32 {
    pulses as f32 * 5.0
}

/// 10-bit reading of the battery behind a 15.7:1 divider and 1.1 V reference.
///
/// The reading is scaled down by ten in whole steps before conversion, so the
/// result moves in increments of about 0.017 V.
pub fn divided_adc_volts(raw: u16) -> f32 {
    f32::from(raw / 10) * 15.705_88 * 1.1 / 1024.0
}

pub fn every_even_minute(now: &DateTime) -> bool {
    now.minute % 2 == 0
}

/// The unit's slot is `unit_id` minutes after midnight.
pub fn minute_of_day_slot(now: &DateTime, unit: UnitId) -> bool {
    now.minute_of_day() == unit.get() as u16
}
