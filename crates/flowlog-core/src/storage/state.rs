//! State that must survive a reset
//!
//! Saved records are postcard-encoded, COBS-framed and appended to one of two
//! journal files. When the active journal grows past its limit the next
//! record starts the other file and the old one is deleted, so there is
//! always at least one intact record on the medium. Every record starts with
//! a delimiter, so a frame torn by a reset mid-append cannot swallow the
//! record after it. On load every intact frame of both files is decoded and
//! the one with the highest sequence number wins.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Storage, StorageError};
use crate::config::FileName;
use crate::filename::SEALED_HISTORY;
use crate::orchestrator::jobs::BACKLOG_CAPACITY;
use crate::schedule::ScheduleState;
use crate::time::DateTime;

const JOURNAL_FILES: [&str; 2] = ["STATE_A.BIN", "STATE_B.BIN"];

/// Journals larger than this are compacted on the next save
pub const JOURNAL_LIMIT: u32 = 16 * 1024;

/// Journals are never read past this size
const READ_LIMIT: u32 = 4 * JOURNAL_LIMIT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub file: FileName,
    pub committed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub schedule: ScheduleState,
    pub open_file: Option<FileName>,
    pub opened_at: Option<DateTime>,
    pub sealed: heapless::Vec<FileName, SEALED_HISTORY>,
    pub backlog: heapless::Vec<PersistedJob, BACKLOG_CAPACITY>,
}

#[derive(Serialize)]
struct FrameRef<'s> {
    sequence: u32,
    state: &'s PersistedState,
}

#[derive(Deserialize)]
struct Frame {
    sequence: u32,
    state: PersistedState,
}

pub struct StateJournal {
    active: usize,
    written: u32,
    sequence: u32,
}

impl StateJournal {
    pub const fn new() -> Self {
        Self {
            active: 0,
            written: 0,
            sequence: 0,
        }
    }

    /// Restore the newest intact record, if any.
    pub fn load<S: Storage>(&mut self, storage: &mut S) -> Result<Option<PersistedState>, StorageError> {
        let mut newest: Option<(usize, Frame)> = None;

        for (index, name) in JOURNAL_FILES.iter().enumerate() {
            if !storage.exists(name) {
                continue;
            }

            let mut bytes = read_all(storage, name)?;
            for frame in bytes.split_inclusive_mut(|b| *b == 0) {
                if frame.len() <= 1 {
                    continue;
                }
                match postcard::from_bytes_cobs::<Frame>(frame) {
                    Ok(decoded) => {
                        if newest.as_ref().is_none_or(|(_, best)| decoded.sequence > best.sequence) {
                            newest = Some((index, decoded));
                        }
                    }
                    Err(e) => debug!("Skipping unreadable state frame in {}: {:?}", name, e),
                }
            }
        }

        let Some((index, frame)) = newest else {
            info!("No saved state found");
            return Ok(None);
        };

        self.active = index;
        self.written = storage.len(JOURNAL_FILES[index])?;
        self.sequence = frame.sequence;
        info!(
            "Restored state #{} from {}",
            frame.sequence, JOURNAL_FILES[index]
        );
        Ok(Some(frame.state))
    }

    pub fn save<S: Storage>(&mut self, storage: &mut S, state: &PersistedState) -> Result<(), StorageError> {
        let sequence = self.sequence.wrapping_add(1);
        let encoded = postcard::to_allocvec_cobs(&FrameRef { sequence, state }).map_err(|e| {
            warn!("Failed to encode state: {:?}", e);
            StorageError::Device
        })?;

        // Leading delimiter isolates this record from a torn predecessor
        let mut record = Vec::with_capacity(encoded.len() + 1);
        record.push(0);
        record.extend_from_slice(&encoded);

        if self.written + record.len() as u32 > JOURNAL_LIMIT {
            let previous = self.active;
            let next = 1 - previous;

            match storage.remove(JOURNAL_FILES[next]) {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(e) => return Err(e),
            }
            storage.append(JOURNAL_FILES[next], &record)?;

            self.active = next;
            self.written = record.len() as u32;
            self.sequence = sequence;

            // The new file already holds the newest record
            if let Err(e) = storage.remove(JOURNAL_FILES[previous]) {
                warn!("Could not delete old journal {}: {:?}", JOURNAL_FILES[previous], e);
            }
            debug!("State journal compacted into {}", JOURNAL_FILES[next]);
            return Ok(());
        }

        storage.append(JOURNAL_FILES[self.active], &record)?;
        self.written += record.len() as u32;
        self.sequence = sequence;
        Ok(())
    }
}

impl Default for StateJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`StateJournal`] that only writes records that differ from the last one.
///
/// Saved often: before and during every upload window, so a reset at any
/// point resumes from the last finished step.
#[derive(Default)]
pub struct Checkpoint {
    journal: StateJournal,
    saved: Option<PersistedState>,
}

impl Checkpoint {
    pub const fn new() -> Self {
        Self {
            journal: StateJournal::new(),
            saved: None,
        }
    }

    pub fn load<S: Storage>(&mut self, storage: &mut S) -> Result<Option<PersistedState>, StorageError> {
        let state = self.journal.load(storage)?;
        self.saved.clone_from(&state);
        Ok(state)
    }

    /// Returns whether a record was written.
    pub fn save<S: Storage>(&mut self, storage: &mut S, state: PersistedState) -> Result<bool, StorageError> {
        if self.saved.as_ref() == Some(&state) {
            return Ok(false);
        }
        self.journal.save(storage, &state)?;
        self.saved = Some(state);
        Ok(true)
    }

    pub fn last(&self) -> Option<&PersistedState> {
        self.saved.as_ref()
    }
}

fn read_all<S: Storage>(storage: &mut S, name: &str) -> Result<Vec<u8>, StorageError> {
    let len = storage.len(name)?.min(READ_LIMIT) as usize;
    let mut bytes = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = storage.read_at(name, filled as u32, &mut bytes[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    bytes.truncate(filled);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn state_at(minute: u8) -> PersistedState {
        let mut state = PersistedState::default();
        state.schedule.last_snapshot = DateTime::new(2024, 1, 15, 0, minute);
        state.open_file = Some(FileName::try_from("24011520.DAT").unwrap());
        state.opened_at = DateTime::new(2024, 1, 15, 0, 0);
        state
            .backlog
            .push(PersistedJob {
                file: FileName::try_from("24011420.DAT").unwrap(),
                committed: 96,
            })
            .unwrap();
        state
    }

    #[test]
    fn test_empty_storage_loads_nothing() {
        let mut storage = MemoryStorage::new();
        assert_eq!(StateJournal::new().load(&mut storage).unwrap(), None);
    }

    #[test]
    fn test_latest_record_wins() {
        let mut storage = MemoryStorage::new();
        let mut journal = StateJournal::new();
        journal.save(&mut storage, &state_at(2)).unwrap();
        journal.save(&mut storage, &state_at(4)).unwrap();

        let restored = StateJournal::new().load(&mut storage).unwrap();
        assert_eq!(restored, Some(state_at(4)));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let mut storage = MemoryStorage::new();
        let mut journal = StateJournal::new();
        journal.save(&mut storage, &state_at(2)).unwrap();

        // Half a frame written when power was lost
        let full = postcard::to_allocvec_cobs(&FrameRef {
            sequence: 9,
            state: &state_at(4),
        })
        .unwrap();
        storage
            .append(JOURNAL_FILES[0], &full[..full.len() / 2])
            .unwrap();

        let mut journal = StateJournal::new();
        assert_eq!(journal.load(&mut storage).unwrap(), Some(state_at(2)));

        // A record saved after the torn one is still readable
        journal.save(&mut storage, &state_at(6)).unwrap();
        assert_eq!(StateJournal::new().load(&mut storage).unwrap(), Some(state_at(6)));
    }

    #[test]
    fn test_compaction_switches_files() {
        let mut storage = MemoryStorage::new();
        let mut journal = StateJournal::new();

        let mut saves = 0;
        while !storage.exists(JOURNAL_FILES[1]) {
            journal.save(&mut storage, &state_at((saves % 30) as u8 * 2)).unwrap();
            saves += 1;
            assert!(saves < 10_000, "journal never compacted");
        }
        assert!(!storage.exists(JOURNAL_FILES[0]));

        journal.save(&mut storage, &state_at(58)).unwrap();
        let mut fresh = StateJournal::new();
        assert_eq!(fresh.load(&mut storage).unwrap(), Some(state_at(58)));

        // Saving after a restore continues the sequence in the active file
        fresh.save(&mut storage, &state_at(10)).unwrap();
        assert_eq!(StateJournal::new().load(&mut storage).unwrap(), Some(state_at(10)));
    }

    #[test]
    fn test_checkpoint_skips_unchanged_state() {
        let mut storage = MemoryStorage::new();
        let mut checkpoint = Checkpoint::new();
        assert!(checkpoint.save(&mut storage, state_at(2)).unwrap());
        let len = storage.len(JOURNAL_FILES[0]).unwrap();

        assert!(!checkpoint.save(&mut storage, state_at(2)).unwrap());
        assert_eq!(storage.len(JOURNAL_FILES[0]).unwrap(), len);

        let mut restarted = Checkpoint::new();
        assert_eq!(restarted.load(&mut storage).unwrap(), Some(state_at(2)));
        assert!(!restarted.save(&mut storage, state_at(2)).unwrap());
        assert!(restarted.save(&mut storage, state_at(4)).unwrap());
        assert_eq!(restarted.last(), Some(&state_at(4)));
    }
}
