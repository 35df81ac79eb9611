//! Debug log mirrored to the card
//!
//! Log records can be emitted from any context, including while the storage
//! is in use, so they are only queued here. The orchestrator appends the
//! queue to the debug log file at the end of each tick.

use core::cell::RefCell;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Deque;

use super::{Storage, StorageError};
use crate::text::BoundedWriter;

pub const DEBUG_LINE_CAPACITY: usize = 128;
pub const DEBUG_QUEUE_CAPACITY: usize = 32;

pub type DebugLine = heapless::String<DEBUG_LINE_CAPACITY>;

/// Bounded queue of log lines waiting for the card. Lines that arrive while
/// it is full are counted and dropped.
pub struct DebugLog {
    lines: Mutex<CriticalSectionRawMutex, RefCell<Deque<DebugLine, DEBUG_QUEUE_CAPACITY>>>,
    dropped: AtomicU32,
}

impl DebugLog {
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(RefCell::new(Deque::new())),
            dropped: AtomicU32::new(0),
        }
    }

    /// Queue `LEVEL target: message`, cut to the line capacity.
    pub fn push(&self, record: &log::Record<'_>) {
        let mut writer = BoundedWriter::<DEBUG_LINE_CAPACITY>::new();
        let _ = write!(writer, "{:<5} {}: {}", record.level(), record.target(), record.args());
        self.push_line(writer.into_lossy());
    }

    pub fn push_line(&self, line: DebugLine) {
        let queued = self.lines.lock(|lines| lines.borrow_mut().push_back(line).is_ok());
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock(|lines| lines.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the lines queued so far to `file`. Lines logged while this
    /// runs wait for the next flush. Returns how many lines were written.
    pub fn flush<S: Storage>(&self, storage: &mut S, file: &str) -> Result<usize, StorageError> {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            let mut note = BoundedWriter::<DEBUG_LINE_CAPACITY>::new();
            let _ = writeln!(note, "({} lines dropped)", dropped);
            if let Err(error) = storage.append(file, note.into_lossy().as_bytes()) {
                self.dropped.fetch_add(dropped, Ordering::Relaxed);
                return Err(error);
            }
        }

        let pending = self.len();
        for written in 0..pending {
            let Some(line) = self.lines.lock(|lines| lines.borrow_mut().pop_front()) else {
                return Ok(written);
            };
            let mut bytes = heapless::Vec::<u8, { DEBUG_LINE_CAPACITY + 1 }>::new();
            // Sized for a full line plus the newline
            let _ = bytes.extend_from_slice(line.as_bytes());
            let _ = bytes.push(b'\n');
            if let Err(error) = storage.append(file, &bytes) {
                // Put it back so the next flush retries it first
                self.lines.lock(|lines| {
                    if lines.borrow_mut().push_front(line).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                });
                return Err(error);
            }
        }
        Ok(pending)
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use core::fmt::Write;

    fn line(text: &str) -> DebugLine {
        DebugLine::try_from(text).unwrap()
    }

    #[test]
    fn test_flush_appends_queued_lines() {
        let sink = DebugLog::new();
        let mut storage = MemoryStorage::new();
        sink.push(
            &log::Record::builder()
                .level(log::Level::Warn)
                .target("flowlog_core::modem")
                .args(format_args!("signal {} below {}", 6, 11))
                .build(),
        );
        sink.push_line(line("INFO  boot"));

        assert_eq!(sink.flush(&mut storage, "DEBUG.LOG"), Ok(2));
        assert_eq!(
            storage.contents("DEBUG.LOG").unwrap(),
            b"WARN  flowlog_core::modem: signal 6 below 11\nINFO  boot\n"
        );
        assert!(sink.is_empty());
        assert_eq!(sink.flush(&mut storage, "DEBUG.LOG"), Ok(0));
    }

    #[test]
    fn test_overflow_is_counted_then_reported() {
        let sink = DebugLog::new();
        for n in 0..DEBUG_QUEUE_CAPACITY + 3 {
            let mut text = DebugLine::new();
            write!(text, "line {}", n).unwrap();
            sink.push_line(text);
        }
        assert_eq!(sink.len(), DEBUG_QUEUE_CAPACITY);

        let mut storage = MemoryStorage::new();
        sink.flush(&mut storage, "DEBUG.LOG").unwrap();
        let text = core::str::from_utf8(storage.contents("DEBUG.LOG").unwrap()).unwrap();
        assert!(text.starts_with("(3 lines dropped)\nline 0\n"));
    }

    #[test]
    fn test_failed_flush_keeps_lines() {
        let sink = DebugLog::new();
        sink.push_line(line("first"));
        sink.push_line(line("second"));

        let mut storage = MemoryStorage::new();
        storage.set_fail_appends(true);
        assert_eq!(sink.flush(&mut storage, "DEBUG.LOG"), Err(StorageError::Device));
        assert_eq!(sink.len(), 2);

        storage.set_fail_appends(false);
        assert_eq!(sink.flush(&mut storage, "DEBUG.LOG"), Ok(2));
        assert_eq!(storage.contents("DEBUG.LOG").unwrap(), b"first\nsecond\n");
    }
}
