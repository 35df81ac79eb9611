//! Fault reporting
//!
//! Every fault the orchestrator cannot absorb is written as one line to the
//! local error log. Critical faults are also queued as status lines that the
//! next upload window appends to the unit's remote log objects.

use core::fmt;

use heapless::Deque;
use log::{error, warn};

use crate::filename::FilenameError;
use crate::modem::{LinkError, TransferError};
use crate::storage::{Storage, StorageError};
use crate::text::BoundedWriter;
use crate::time::DateTime;

/// Longest line written to the local error log
pub const LOG_LINE_CAPACITY: usize = 160;

/// Status lines held in RAM between upload windows
pub const STATUS_QUEUE_CAPACITY: usize = 8;

pub const STATUS_LINE_CAPACITY: usize = 96;

pub type StatusText = heapless::String<STATUS_LINE_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Modem did not respond to power-up checks
    HardwareFault,
    RegistrationTimeout,
    InsufficientSignal,
    /// A rendered modem command exceeded the command buffer
    CommandTooLong,
    /// A file name formula produced an unusable name
    FilenameFault,
    /// Unexpected reply during a transfer
    ProtocolError,
    /// Local storage read or append failed
    StorageFault,
    ClockFault,
    /// An upload job exhausted its attempts or was evicted
    UploadAbandoned,
}

impl FaultKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::HardwareFault => "HardwareFault",
            Self::RegistrationTimeout => "RegistrationTimeout",
            Self::InsufficientSignal => "InsufficientSignal",
            Self::CommandTooLong => "CommandTooLong",
            Self::FilenameFault => "FilenameFault",
            Self::ProtocolError => "ProtocolError",
            Self::StorageFault => "StorageFault",
            Self::ClockFault => "ClockFault",
            Self::UploadAbandoned => "UploadAbandoned",
        }
    }

    /// Link-level faults are retried at the next window and not escalated.
    pub const fn is_escalated(self) -> bool {
        !matches!(self, Self::RegistrationTimeout | Self::InsufficientSignal)
    }
}

impl From<&LinkError> for FaultKind {
    fn from(error: &LinkError) -> Self {
        match error {
            LinkError::HardwareFault { .. } => Self::HardwareFault,
            LinkError::RegistrationTimeout { .. } | LinkError::Bearer(_) => Self::RegistrationTimeout,
            LinkError::InsufficientSignal { .. } => Self::InsufficientSignal,
            LinkError::CommandTooLong { .. } => Self::CommandTooLong,
        }
    }
}

impl From<&TransferError> for FaultKind {
    fn from(error: &TransferError) -> Self {
        match error {
            TransferError::CommandTooLong { .. } => Self::CommandTooLong,
            TransferError::Source(_) => Self::StorageFault,
            TransferError::Protocol { .. }
            | TransferError::Rejected { .. }
            | TransferError::ChannelDropped { .. } => Self::ProtocolError,
        }
    }
}

impl From<&FilenameError> for FaultKind {
    fn from(_: &FilenameError) -> Self {
        Self::FilenameFault
    }
}

/// Timestamp column: the minute, or a placeholder before the clock is set.
pub struct Stamp<'t>(pub Option<&'t DateTime>);

impl fmt::Display for Stamp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(time) => write!(f, "{}", time),
            None => f.write_str("0000-00-00 00:00"),
        }
    }
}

/// Append-only fault log on local storage.
pub struct ErrorLog<'a> {
    file: &'a str,
}

impl<'a> ErrorLog<'a> {
    pub const fn new(file: &'a str) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &str {
        self.file
    }

    /// Append `<time>,<kind>,<detail>`. Overlong details are cut short.
    pub fn record<S: Storage>(
        &self,
        storage: &mut S,
        at: Option<&DateTime>,
        kind: FaultKind,
        detail: fmt::Arguments<'_>,
    ) -> Result<(), StorageError> {
        let mut line = BoundedWriter::<LOG_LINE_CAPACITY>::new();
        let _ = fmt::Write::write_fmt(
            &mut line,
            format_args!("{},{},{}", Stamp(at), kind.label(), detail),
        );
        let mut line = line.into_lossy();
        if line.len() == line.capacity() {
            line.pop();
        }
        let _ = line.push('\n');

        storage.append(self.file, line.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Boot,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub kind: StatusKind,
    /// One line, newline included
    pub text: StatusText,
}

/// Bounded queue of status lines awaiting upload. The oldest line goes
/// when it is full.
#[derive(Debug, Default)]
pub struct StatusQueue {
    lines: Deque<StatusLine, STATUS_QUEUE_CAPACITY>,
    dropped: u16,
}

impl StatusQueue {
    pub const fn new() -> Self {
        Self {
            lines: Deque::new(),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines lost to overflow since start
    pub fn dropped(&self) -> u16 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusLine> {
        self.lines.iter()
    }

    pub fn push(&mut self, kind: StatusKind, line: fmt::Arguments<'_>) {
        let mut text = BoundedWriter::<STATUS_LINE_CAPACITY>::new();
        let _ = fmt::Write::write_fmt(&mut text, line);
        let mut text = text.into_lossy();
        if text.len() == text.capacity() {
            text.pop();
        }
        let _ = text.push('\n');

        if self.lines.is_full() {
            self.lines.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            warn!("Status queue full, dropping oldest line");
        }
        let _ = self.lines.push_back(StatusLine { kind, text });
    }

    /// All queued lines of `kind`, concatenated oldest first.
    pub fn payload(&self, kind: StatusKind) -> alloc::vec::Vec<u8> {
        self.lines
            .iter()
            .filter(|line| line.kind == kind)
            .flat_map(|line| line.text.as_bytes().iter().copied())
            .collect()
    }

    /// Drop every line of `kind`; returns how many were removed.
    pub fn remove(&mut self, kind: StatusKind) -> usize {
        let before = self.lines.len();
        let mut kept = Deque::new();
        while let Some(line) = self.lines.pop_front() {
            if line.kind != kind {
                let _ = kept.push_back(line);
            }
        }
        self.lines = kept;
        before - self.lines.len()
    }
}

/// Log `detail` loudly and make it durable.
pub(crate) fn report_fault<S: Storage>(
    log: &ErrorLog<'_>,
    storage: &mut S,
    at: Option<&DateTime>,
    kind: FaultKind,
    detail: fmt::Arguments<'_>,
) {
    error!("{}: {}", kind.label(), detail);
    if let Err(e) = log.record(storage, at, kind, detail) {
        error!("Could not write {}: {}", log.file(), e);
    }
}
