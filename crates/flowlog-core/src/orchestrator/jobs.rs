//! Upload backlog
//!
//! Sealed files wait here until they are uploaded or abandoned. The backlog
//! is bounded; when it is full the oldest job is evicted so new data always
//! has a place.

use heapless::Deque;

use super::error_log::FaultKind;
use crate::config::FileName;
use crate::storage::PersistedJob;

pub const BACKLOG_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Succeeded,
    Failed(FaultKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    /// Sealed local file
    pub file: FileName,
    /// Transfers started in the current upload window
    pub attempts: u8,
    /// Bytes of the file the server has acknowledged
    pub committed: u32,
    pub outcome: JobOutcome,
}

impl UploadJob {
    pub fn new(file: FileName) -> Self {
        Self {
            file,
            attempts: 0,
            committed: 0,
            outcome: JobOutcome::Pending,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    /// The file already had a job
    Duplicate,
    /// The backlog was full; the returned oldest job was dropped
    Evicted(UploadJob),
}

#[derive(Debug, Default)]
pub struct Backlog {
    jobs: Deque<UploadJob, BACKLOG_CAPACITY>,
}

impl Backlog {
    pub const fn new() -> Self {
        Self { jobs: Deque::new() }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &UploadJob> {
        self.jobs.iter()
    }

    pub fn contains(&self, file: &str) -> bool {
        self.jobs.iter().any(|job| job.file.as_str() == file)
    }

    pub fn enqueue(&mut self, file: FileName) -> Enqueued {
        if self.contains(&file) {
            return Enqueued::Duplicate;
        }

        let evicted = if self.jobs.is_full() {
            self.jobs.pop_front()
        } else {
            None
        };
        // Room was made above
        let _ = self.jobs.push_back(UploadJob::new(file));

        match evicted {
            Some(job) => Enqueued::Evicted(job),
            None => Enqueued::Added,
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<UploadJob> {
        self.jobs.pop_front()
    }

    pub fn persisted(&self) -> heapless::Vec<PersistedJob, BACKLOG_CAPACITY> {
        let mut saved = heapless::Vec::new();
        for job in &self.jobs {
            let _ = saved.push(PersistedJob {
                file: job.file.clone(),
                committed: job.committed,
            });
        }
        saved
    }

    pub fn restore(&mut self, saved: &[PersistedJob]) {
        self.jobs.clear();
        for entry in saved {
            let mut job = UploadJob::new(entry.file.clone());
            job.committed = entry.committed;
            let _ = self.jobs.push_back(job);
        }
    }
}
