//! Upload window work: drain the backlog, then the status queue

use log::{debug, info, warn};

use super::error_log::{
    ErrorLog, FaultKind, Stamp, StatusKind, StatusQueue, report_fault,
};
use super::jobs::{BACKLOG_CAPACITY, Backlog, JobOutcome, UploadJob};
use crate::config::{Config, FILENAME_CAPACITY, FileName, FtpConfig, RemoteNaming, UnitId};
use crate::modem::{
    LinkError, ModemTransport, RegisteredLink, RemoteTarget, TransferClient, TransferError,
    TransferFailure, UploadMode,
};
use crate::storage::{BytesSource, Checkpoint, PersistedJob, PersistedState, Storage};
use crate::text;
use crate::time::DateTime;

/// What one upload window did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    pub link: Result<(), LinkError>,
    /// Jobs that left the backlog, in processing order
    pub finished: heapless::Vec<UploadJob, BACKLOG_CAPACITY>,
    /// Status lines delivered to the remote log
    pub status_lines: usize,
}

impl WindowReport {
    pub(super) fn new() -> Self {
        Self {
            link: Ok(()),
            finished: heapless::Vec::new(),
            status_lines: 0,
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &UploadJob> {
        self.finished
            .iter()
            .filter(|job| job.outcome == JobOutcome::Succeeded)
    }
}

/// `<unit>.<suffix>`
pub fn remote_name(unit: UnitId, suffix: &str) -> Result<FileName, usize> {
    text::render::<FILENAME_CAPACITY>(format_args!("{}.{}", unit, suffix))
}

pub(super) struct Uploader<'a> {
    pub(super) client: TransferClient<'a>,
    pub(super) backlog: Backlog,
    pub(super) status: StatusQueue,
    pub(super) error_log: ErrorLog<'a>,
    ftp: FtpConfig<'a>,
    unit: UnitId,
    job_attempts: u8,
}

impl<'a> Uploader<'a> {
    pub(super) fn new(config: &Config<'a>) -> Self {
        Self {
            client: TransferClient::new(config),
            backlog: Backlog::new(),
            status: StatusQueue::new(),
            error_log: ErrorLog::new(config.error_log_file),
            ftp: config.ftp,
            unit: config.unit_id,
            job_attempts: config.job_attempts.max(1),
        }
    }

    /// Record a fault locally and queue it for the remote log.
    pub(super) fn fault<S: Storage>(
        &mut self,
        storage: &mut S,
        at: Option<&DateTime>,
        kind: FaultKind,
        detail: core::fmt::Arguments<'_>,
    ) {
        report_fault(&self.error_log, storage, at, kind, detail);
        if kind.is_escalated() && self.ftp.status_logging {
            self.status.push(
                StatusKind::Fault,
                format_args!("{},{},{},{}", Stamp(at), self.unit, kind.label(), detail),
            );
        }
    }

    pub(super) fn boot(&mut self, at: Option<&DateTime>, volts: Option<f32>) {
        if !self.ftp.status_logging {
            return;
        }
        let (stamp, unit, backlog) = (Stamp(at), self.unit, self.backlog.len());
        match volts {
            Some(volts) => self.status.push(
                StatusKind::Boot,
                format_args!("{},{},BOOT,backlog {},battery {:.2}V", stamp, unit, backlog, volts),
            ),
            None => self.status.push(
                StatusKind::Boot,
                format_args!("{},{},BOOT,backlog {},battery unknown", stamp, unit, backlog),
            ),
        }
    }

    /// Drain the backlog, checkpointing `base` with the backlog's progress
    /// after every attempt.
    pub(super) async fn run<T, S>(
        &mut self,
        link: &mut RegisteredLink<'_, T>,
        storage: &mut S,
        at: Option<&DateTime>,
        report: &mut WindowReport,
        checkpoint: &mut Checkpoint,
        base: &PersistedState,
    ) where
        T: ModemTransport,
        S: Storage,
    {
        while let Some(mut job) = self.backlog.pop_front() {
            let stop = self
                .upload_job(link, storage, at, &mut job, checkpoint, base)
                .await;
            self.save_progress(storage, at, checkpoint, base, None);
            let _ = report.finished.push(job);
            if stop {
                info!(
                    "Data channel lost, leaving {} jobs for the next window",
                    self.backlog.len()
                );
                return;
            }
        }

        if self.ftp.status_logging {
            report.status_lines = self.flush_status(link, storage, at).await;
        }
    }

    /// Run one job to completion or abandonment. Returns whether the rest of
    /// the batch should wait for the next window.
    async fn upload_job<T, S>(
        &mut self,
        link: &mut RegisteredLink<'_, T>,
        storage: &mut S,
        at: Option<&DateTime>,
        job: &mut UploadJob,
        checkpoint: &mut Checkpoint,
        base: &PersistedState,
    ) -> bool
    where
        T: ModemTransport,
        S: Storage,
    {
        let file = job.file.clone();
        let (name, mode) = match self.ftp.naming {
            RemoteNaming::PerUnit => match remote_name(self.unit, self.ftp.data_suffix) {
                Ok(name) => (name, UploadMode::Append),
                Err(len) => {
                    job.outcome = JobOutcome::Failed(FaultKind::CommandTooLong);
                    self.fault(
                        storage,
                        at,
                        FaultKind::CommandTooLong,
                        format_args!("remote name for {} needs {} bytes", file, len),
                    );
                    return false;
                }
            },
            RemoteNaming::PerFile => (file.clone(), UploadMode::Overwrite),
        };
        let target = RemoteTarget {
            directory: self.ftp.data_path,
            name: &name,
        };

        let mut last_error = None;
        while job.attempts < self.job_attempts {
            job.attempts += 1;
            let result = match storage.open_for_read(&file) {
                Ok(mut reader) => {
                    self.client
                        .upload(link, &mut reader, &target, mode, job.committed)
                        .await
                }
                Err(error) => Err(TransferFailure {
                    error: TransferError::Source(error),
                    committed: job.committed,
                }),
            };

            match result {
                Ok(report) => {
                    job.committed = report.committed;
                    job.outcome = JobOutcome::Succeeded;
                    info!("{} uploaded after {} attempts", file, job.attempts);
                    return false;
                }
                Err(failure) => {
                    job.committed = failure.committed;
                    let kind = FaultKind::from(&failure.error);
                    if failure.error.is_permanent() {
                        job.outcome = JobOutcome::Failed(kind);
                        self.fault(
                            storage,
                            at,
                            kind,
                            format_args!("upload of {} abandoned: {}", file, failure.error),
                        );
                        return false;
                    }
                    warn!(
                        "Upload of {} failed (attempt {}/{}): {}",
                        file, job.attempts, self.job_attempts, failure.error
                    );
                    self.save_progress(storage, at, checkpoint, base, Some(&*job));
                    last_error = Some(failure.error);
                }
            }
        }

        let Some(error) = last_error else {
            return false;
        };
        job.outcome = JobOutcome::Failed(FaultKind::from(&error));
        self.fault(
            storage,
            at,
            FaultKind::UploadAbandoned,
            format_args!("{} after {} attempts: {}", file, job.attempts, error),
        );
        matches!(error, TransferError::ChannelDropped { .. })
    }

    /// Save `base` with the current backlog, `in_flight` at its head.
    fn save_progress<S: Storage>(
        &mut self,
        storage: &mut S,
        at: Option<&DateTime>,
        checkpoint: &mut Checkpoint,
        base: &PersistedState,
        in_flight: Option<&UploadJob>,
    ) {
        let mut state = base.clone();
        state.backlog.clear();
        let waiting = self.backlog.persisted();
        let jobs = in_flight
            .map(|job| PersistedJob {
                file: job.file.clone(),
                committed: job.committed,
            })
            .into_iter()
            .chain(waiting);
        for job in jobs {
            // One slot was freed when the in-flight job was popped
            let _ = state.backlog.push(job);
        }

        match checkpoint.save(storage, state) {
            Ok(true) => debug!("Upload progress saved"),
            Ok(false) => {}
            Err(error) => report_fault(
                &self.error_log,
                storage,
                at,
                FaultKind::StorageFault,
                format_args!("state not saved: {}", error),
            ),
        }
    }

    /// Append queued status lines to `<unit>.<boot>` and `<unit>.<fault>`.
    ///
    /// Best effort: lines stay queued after a failure that sent nothing and
    /// are dropped once any of them may have reached the server.
    async fn flush_status<T, S>(
        &mut self,
        link: &mut RegisteredLink<'_, T>,
        storage: &mut S,
        at: Option<&DateTime>,
    ) -> usize
    where
        T: ModemTransport,
        S: Storage,
    {
        let mut sent = 0;
        for (kind, suffix) in [
            (StatusKind::Boot, self.ftp.boot_suffix),
            (StatusKind::Fault, self.ftp.fault_suffix),
        ] {
            let payload = self.status.payload(kind);
            if payload.is_empty() {
                continue;
            }

            let Ok(name) = remote_name(self.unit, suffix) else {
                self.status.remove(kind);
                report_fault(
                    &self.error_log,
                    storage,
                    at,
                    FaultKind::CommandTooLong,
                    format_args!("status log name with suffix '{}' does not fit", suffix),
                );
                continue;
            };
            let target = RemoteTarget {
                directory: self.ftp.log_path,
                name: &name,
            };

            let result = self
                .client
                .upload(link, &mut BytesSource(&payload), &target, UploadMode::Append, 0)
                .await;
            match result {
                Ok(_) => sent += self.status.remove(kind),
                Err(failure) if failure.error.is_permanent() => {
                    self.status.remove(kind);
                    // Not queued again: the queue would only fail the same way
                    report_fault(
                        &self.error_log,
                        storage,
                        at,
                        FaultKind::from(&failure.error),
                        format_args!("status upload to {}{}: {}", self.ftp.log_path, name, failure.error),
                    );
                }
                Err(failure) if failure.committed > 0 => {
                    let dropped = self.status.remove(kind);
                    warn!("Dropped {} partly sent status lines: {}", dropped, failure.error);
                }
                Err(failure) => debug!("Status lines kept for the next window: {}", failure.error),
            }
        }
        sent
    }
}
