//! Data file naming and rollover
//!
//! The active data file name is a function of the current minute. When the
//! formula starts producing a different name, the previous file is sealed and
//! becomes eligible for upload. The time the open file was opened is kept as
//! a high-water mark: no name is ever rendered for an earlier time, so a clock
//! stepping backwards, however far, can never reopen a file that may already
//! be queued or uploaded. The last few sealed names are also remembered for
//! formulas that repeat a name later in time.

use heapless::Deque;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::config::{Config, FILENAME_CAPACITY, FileName, FilenameFormula, UnitId};
use crate::text::BoundedWriter;
use crate::time::DateTime;

/// Number of recently sealed names kept for reporting and the reuse guard
pub const SEALED_HISTORY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Open,
    Sealed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFile {
    pub name: FileName,
    pub status: FileStatus,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameError {
    #[error("file name needs {len} bytes, slot allows {max}")]
    TooLong { len: usize, max: usize },
    #[error("file name formula produced an empty name")]
    Empty,
    #[error("file name formula failed")]
    Formula,
    #[error("file name was already sealed")]
    Sealed,
}

/// Render a name with `formula`, enforcing the slot length.
///
/// A slot of `max_len` bytes holds names of at most `max_len - 1` bytes
/// (one byte is reserved for the terminator in persistent name slots).
pub fn render_filename(
    formula: FilenameFormula,
    now: &DateTime,
    unit: UnitId,
    max_len: usize,
) -> Result<FileName, FilenameError> {
    let mut out = BoundedWriter::<FILENAME_CAPACITY>::new();
    formula(now, unit, &mut out).map_err(|_| FilenameError::Formula)?;

    let max = max_len.saturating_sub(1);
    if out.needed() > max {
        return Err(FilenameError::TooLong {
            len: out.needed(),
            max,
        });
    }

    let name = out.finish().map_err(|len| FilenameError::TooLong { len, max })?;
    if name.is_empty() {
        return Err(FilenameError::Empty);
    }
    Ok(name)
}

pub struct FilenameSequencer {
    formula: FilenameFormula,
    unit: UnitId,
    max_len: usize,
    open: Option<FileName>,
    /// When the open file was opened; names for earlier times are refused
    opened_at: Option<DateTime>,
    sealed: Deque<FileName, SEALED_HISTORY>,
}

impl FilenameSequencer {
    pub fn new(config: &Config<'_>) -> Self {
        Self {
            formula: config.filename_formula,
            unit: config.unit_id,
            max_len: config.filename_max_len,
            open: None,
            opened_at: None,
            sealed: Deque::new(),
        }
    }

    /// Reinstate state persisted before a reset.
    pub fn restore<'n>(
        &mut self,
        open: Option<FileName>,
        opened_at: Option<DateTime>,
        sealed: impl IntoIterator<Item = &'n FileName>,
    ) {
        self.open = open;
        self.opened_at = opened_at;
        self.sealed.clear();
        for name in sealed {
            self.remember_sealed(name.clone());
        }
    }

    pub fn current_filename(&self, now: &DateTime) -> Result<FileName, FilenameError> {
        render_filename(self.formula, now, self.unit, self.max_len)
    }

    pub fn active(&self) -> Option<ActiveFile> {
        self.open.as_ref().map(|name| ActiveFile {
            name: name.clone(),
            status: FileStatus::Open,
        })
    }

    pub fn open_name(&self) -> Option<&FileName> {
        self.open.as_ref()
    }

    pub fn opened_at(&self) -> Option<DateTime> {
        self.opened_at
    }

    fn is_behind_mark(&self, now: &DateTime) -> bool {
        self.opened_at.is_some_and(|mark| *now < mark)
    }

    pub fn sealed_names(&self) -> impl Iterator<Item = &FileName> {
        self.sealed.iter()
    }

    pub fn is_sealed(&self, name: &str) -> bool {
        self.sealed.iter().any(|sealed| sealed.as_str() == name)
    }

    /// The open file, opening one for `now` if none is open yet.
    pub fn ensure_open(&mut self, now: &DateTime) -> Result<FileName, FilenameError> {
        if let Some(open) = &self.open {
            return Ok(open.clone());
        }

        let name = self.current_filename(now)?;
        if self.is_behind_mark(now) || self.is_sealed(&name) {
            return Err(FilenameError::Sealed);
        }
        info!("Opening data file {}", name);
        self.open = Some(name.clone());
        self.opened_at = Some(*now);
        Ok(name)
    }

    /// Compare the formula's name for `now` with the open file.
    ///
    /// On a change the open file is sealed, the new name opened, and the
    /// sealed file returned. A name rendered for a time before the open file
    /// was opened, or one sealed before, is never opened; the current file
    /// stays open instead.
    pub fn check_rollover(&mut self, now: &DateTime) -> Result<Option<ActiveFile>, FilenameError> {
        let candidate = self.current_filename(now)?;

        let Some(open) = self.open.take() else {
            if !self.is_behind_mark(now) && !self.is_sealed(&candidate) {
                info!("Opening data file {}", candidate);
                self.open = Some(candidate);
                self.opened_at = Some(*now);
            }
            return Ok(None);
        };

        if open == candidate {
            self.open = Some(open);
            return Ok(None);
        }

        if self.is_behind_mark(now) || self.is_sealed(&candidate) {
            warn!(
                "File name {} is for an earlier time or already sealed (clock moved back?), keeping {} open",
                candidate, open
            );
            self.open = Some(open);
            return Ok(None);
        }

        info!("Sealing {} and opening {}", open, candidate);
        self.remember_sealed(open.clone());
        self.open = Some(candidate);
        self.opened_at = Some(*now);

        Ok(Some(ActiveFile {
            name: open,
            status: FileStatus::Sealed,
        }))
    }

    fn remember_sealed(&mut self, name: FileName) {
        if self.sealed.is_full() {
            self.sealed.pop_front();
        }
        // Cannot fail after making room
        let _ = self.sealed.push_back(name);
    }
}
