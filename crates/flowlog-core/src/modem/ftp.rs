//! FTP uploads through the modem's built-in client
//!
//! A transfer walks `Connect -> Authenticate -> SelectDirectory -> StoreFile
//! -> Close`. Each stage is one request/response exchange retried up to
//! `state_retries` times on its own; a failure in `StoreFile` does not go
//! back through `Authenticate`. A dropped data channel ends the transfer so
//! the caller can restart it from `Connect`.
//!
//! Every command of a transfer is rendered before the first byte goes out, so
//! a path or credential that does not fit the command buffer fails the
//! transfer without touching the server.
//!
//! In append mode the client reports how many bytes the server has
//! acknowledged. Passing that count back as `resume_from` continues the
//! object where it stopped, without resending acknowledged bytes.

use core::fmt;

use heapless::Vec;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use super::ModemTransport;
use super::at::{AtError, AtPort, Command, Line};
use super::link::RegisteredLink;
use crate::config::Config;
use crate::storage::{ChunkSource, StorageError};

/// Bytes read from the source per data exchange
pub const DATA_CHUNK: usize = 512;

const SESSION_EVENT: &str = "+FTPPUT: 1,";
const DATA_PROMPT: &str = "+FTPPUT: 2,";
const BEARER_LOST: &str = "+SAPBR 1: DEACT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Connect,
    Authenticate,
    SelectDirectory,
    StoreFile,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    /// Replace the remote object
    Overwrite,
    /// Concatenate onto the remote object
    Append,
}

impl UploadMode {
    fn ftp_option(self) -> &'static str {
        match self {
            UploadMode::Overwrite => "STOR",
            UploadMode::Append => "APPE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget<'t> {
    /// Remote directory, ending in `/`
    pub directory: &'t str,
    pub name: &'t str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// The modem refused or did not answer a command
    Command(AtError),
    /// The FTP session reported an error code
    Session(u8),
    /// A reply that does not fit the exchange
    Unexpected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("{stage:?} command needs {len} bytes, buffer holds {limit}")]
    CommandTooLong {
        stage: TransferStage,
        len: usize,
        limit: usize,
    },
    #[error("{stage:?} failed: {fault:?}")]
    Protocol {
        stage: TransferStage,
        fault: ProtocolFault,
    },
    #[error("server rejected the login (code {code})")]
    Rejected { code: u8 },
    #[error("data channel dropped during {stage:?}")]
    ChannelDropped { stage: TransferStage },
    #[error("could not read upload source: {0}")]
    Source(StorageError),
}

impl TransferError {
    pub fn stage(&self) -> Option<TransferStage> {
        match self {
            Self::CommandTooLong { stage, .. }
            | Self::Protocol { stage, .. }
            | Self::ChannelDropped { stage } => Some(*stage),
            Self::Rejected { .. } => Some(TransferStage::Authenticate),
            Self::Source(_) => None,
        }
    }

    /// Deterministic failures that another attempt cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::CommandTooLong { .. } | Self::Source(StorageError::NotFound)
        )
    }

    fn retry_in_stage(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    fn from_at(stage: TransferStage, error: AtError) -> Self {
        match error {
            AtError::CommandTooLong { len, limit } => Self::CommandTooLong { stage, len, limit },
            AtError::Transport => Self::ChannelDropped { stage },
            other => Self::Protocol {
                stage,
                fault: ProtocolFault::Command(other),
            },
        }
    }
}

/// A failed transfer and the bytes the server had acknowledged before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFailure {
    pub error: TransferError,
    /// Source offset acknowledged by the server (always 0 in overwrite mode)
    pub committed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Source offset acknowledged by the server, the full length on success
    pub committed: u32,
    /// Bytes sent by this transfer
    pub sent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEvent {
    Ready(u16),
    DataPrompt(u16),
    Closed,
    Failed(u8),
    BearerLost,
    Unknown,
}

impl SessionEvent {
    fn parse(line: &str) -> Self {
        if line.starts_with(BEARER_LOST) {
            return Self::BearerLost;
        }
        let Some(rest) = line.strip_prefix("+FTPPUT:") else {
            return Self::Unknown;
        };

        let mut fields = rest.split(',').map(str::trim);
        match (fields.next(), fields.next(), fields.next()) {
            (Some("1"), Some("1"), Some(max)) => max.parse().map_or(Self::Unknown, Self::Ready),
            (Some("1"), Some("0"), None) => Self::Closed,
            (Some("1"), Some(code), None) => code.parse().map_or(Self::Unknown, Self::Failed),
            (Some("2"), Some(len), None) => len.parse().map_or(Self::Unknown, Self::DataPrompt),
            _ => Self::Unknown,
        }
    }

    fn into_error(self, stage: TransferStage) -> TransferError {
        match self {
            Self::BearerLost | Self::Failed(61..=63) => TransferError::ChannelDropped { stage },
            Self::Failed(code @ (71 | 72)) => TransferError::Rejected { code },
            Self::Failed(code) => TransferError::Protocol {
                stage,
                fault: ProtocolFault::Session(code),
            },
            _ => TransferError::Protocol {
                stage,
                fault: ProtocolFault::Unexpected,
            },
        }
    }
}

/// Every command of one transfer, rendered up front.
struct Script {
    connect: Vec<Command, 3>,
    authenticate: Vec<Command, 2>,
    directory: Command,
    store: Vec<Command, 2>,
    open: Command,
    close: Command,
    quit: Command,
}

fn render<T: ModemTransport>(
    port: &AtPort<T>,
    stage: TransferStage,
    args: fmt::Arguments<'_>,
) -> Result<Command, TransferError> {
    port.render(args)
        .map_err(|e| TransferError::from_at(stage, e))
}

pub struct TransferClient<'a> {
    host: &'a str,
    port: u16,
    username: &'a str,
    password: &'a str,
    state_retries: u8,
}

impl<'a> TransferClient<'a> {
    pub fn new(config: &Config<'a>) -> Self {
        Self {
            host: config.ftp.host,
            port: config.ftp.port,
            username: config.ftp.username,
            password: config.ftp.password,
            state_retries: config.state_retries.max(1),
        }
    }

    /// Push `source` to `target`.
    ///
    /// In append mode the bytes before `resume_from` are taken as already on
    /// the server and skipped; overwrite mode always sends the whole source.
    pub async fn upload<T, C>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        source: &mut C,
        target: &RemoteTarget<'_>,
        mode: UploadMode,
        resume_from: u32,
    ) -> Result<TransferReport, TransferFailure>
    where
        T: ModemTransport,
        C: ChunkSource,
    {
        let resume_from = match mode {
            UploadMode::Append => resume_from,
            UploadMode::Overwrite => 0,
        };
        let fail = |error| TransferFailure {
            error,
            committed: resume_from,
        };

        let script = self.script(link.port(), target, mode).map_err(fail)?;
        let total = source.total_len().map_err(|e| fail(TransferError::Source(e)))?;
        let start = resume_from.min(total);

        if mode == UploadMode::Append && start == total {
            debug!("{}{} already holds all {} bytes", target.directory, target.name, total);
            return Ok(TransferReport {
                committed: total,
                sent: 0,
            });
        }

        let mut committed = start;
        match self.run(link, source, &script, total, &mut committed).await {
            Ok(()) => {
                info!(
                    "Uploaded {} bytes to {}{} ({})",
                    total - start,
                    target.directory,
                    target.name,
                    mode.ftp_option()
                );
                Ok(TransferReport {
                    committed: total,
                    sent: total - start,
                })
            }
            Err(error) => {
                warn!("Upload to {}{} failed: {}", target.directory, target.name, error);
                if let Err(e) = link.port().command(&script.quit).await {
                    debug!("FTP quit not acknowledged: {}", e);
                }
                Err(TransferFailure {
                    error,
                    committed: match mode {
                        UploadMode::Append => committed,
                        UploadMode::Overwrite => 0,
                    },
                })
            }
        }
    }

    fn script<T: ModemTransport>(
        &self,
        port: &AtPort<T>,
        target: &RemoteTarget<'_>,
        mode: UploadMode,
    ) -> Result<Script, TransferError> {
        use TransferStage::*;

        let mut connect = Vec::new();
        let _ = connect.push(render(port, Connect, format_args!("AT+FTPCID=1"))?);
        let _ = connect.push(render(port, Connect, format_args!("AT+FTPSERV=\"{}\"", self.host))?);
        let _ = connect.push(render(port, Connect, format_args!("AT+FTPPORT={}", self.port))?);

        let mut authenticate = Vec::new();
        let _ = authenticate.push(render(port, Authenticate, format_args!("AT+FTPUN=\"{}\"", self.username))?);
        let _ = authenticate.push(render(port, Authenticate, format_args!("AT+FTPPW=\"{}\"", self.password))?);

        let directory = render(
            port,
            SelectDirectory,
            format_args!("AT+FTPPUTPATH=\"{}\"", target.directory),
        )?;

        let mut store = Vec::new();
        let _ = store.push(render(port, StoreFile, format_args!("AT+FTPPUTNAME=\"{}\"", target.name))?);
        let _ = store.push(render(
            port,
            StoreFile,
            format_args!("AT+FTPPUTOPT=\"{}\"", mode.ftp_option()),
        )?);
        // Widest data request the transfer will issue
        render(port, StoreFile, format_args!("AT+FTPPUT=2,{}", DATA_CHUNK))?;

        Ok(Script {
            connect,
            authenticate,
            directory,
            store,
            open: render(port, StoreFile, format_args!("AT+FTPPUT=1"))?,
            close: render(port, Close, format_args!("AT+FTPPUT=2,0"))?,
            quit: render(port, Close, format_args!("AT+FTPQUIT"))?,
        })
    }

    async fn run<T, C>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        source: &mut C,
        script: &Script,
        total: u32,
        committed: &mut u32,
    ) -> Result<(), TransferError>
    where
        T: ModemTransport,
        C: ChunkSource,
    {
        self.exchange(link, TransferStage::Connect, &script.connect).await?;
        self.exchange(link, TransferStage::Authenticate, &script.authenticate)
            .await?;
        self.exchange(
            link,
            TransferStage::SelectDirectory,
            core::slice::from_ref(&script.directory),
        )
        .await?;

        let mut ready = self.open_store(link, script).await?;
        let mut buf = [0u8; DATA_CHUNK];

        while *committed < total {
            let want = ((total - *committed) as usize)
                .min(DATA_CHUNK)
                .min(ready.max(1) as usize);
            let n = source
                .read_chunk(*committed, &mut buf[..want])
                .map_err(TransferError::Source)?;
            if n == 0 {
                warn!("Upload source ended at {} of {} bytes", *committed, total);
                return Err(TransferError::Source(StorageError::Device));
            }

            let (accepted, next_ready) = self.send_chunk(link, &buf[..n]).await?;
            *committed += accepted as u32;
            ready = next_ready;
        }

        self.close(link, script).await
    }

    /// Send `commands` in order, retrying the whole stage on a protocol fault.
    async fn exchange<T: ModemTransport>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        stage: TransferStage,
        commands: &[Command],
    ) -> Result<(), TransferError> {
        let mut attempt = 1;
        loop {
            let result = async {
                for command in commands {
                    link.port().command(command).await?;
                }
                Ok::<(), AtError>(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let error = TransferError::from_at(stage, e);
                    self.check_retry(stage, attempt, error)?;
                    attempt += 1;
                }
            }
        }
    }

    /// Open the store session; returns the first data window size.
    async fn open_store<T: ModemTransport>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        script: &Script,
    ) -> Result<u16, TransferError> {
        let stage = TransferStage::StoreFile;
        let mut attempt = 1;
        loop {
            self.exchange(link, stage, &script.store).await?;

            let error = match self.request(link, &script.open, &[SESSION_EVENT, BEARER_LOST]).await {
                Ok(line) => match SessionEvent::parse(&line) {
                    SessionEvent::Ready(max) => return Ok(max),
                    other => other.into_error(stage),
                },
                Err(e) => TransferError::from_at(stage, e),
            };
            self.check_retry(stage, attempt, error)?;
            attempt += 1;
        }
    }

    /// Send one chunk. Returns the bytes the modem took and the next window.
    async fn send_chunk<T: ModemTransport>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        data: &[u8],
    ) -> Result<(usize, u16), TransferError> {
        let stage = TransferStage::StoreFile;
        let command = render(link.port(), stage, format_args!("AT+FTPPUT=2,{}", data.len()))?;
        let timeout = link.session_timeout_ms();

        let mut attempt = 1;
        let accepted = loop {
            let error = match self
                .request(link, &command, &[DATA_PROMPT, SESSION_EVENT, BEARER_LOST])
                .await
            {
                Ok(line) => match SessionEvent::parse(&line) {
                    SessionEvent::DataPrompt(len) if len > 0 => break (len as usize).min(data.len()),
                    other => other.into_error(stage),
                },
                Err(e) => TransferError::from_at(stage, e),
            };
            self.check_retry(stage, attempt, error)?;
            attempt += 1;
        };

        // Once raw bytes are out a failure is not retried here; the caller
        // only counts acknowledged chunks.
        let port = link.port();
        port.write_raw(&data[..accepted])
            .await
            .map_err(|e| TransferError::from_at(stage, e))?;
        port.read_final(timeout)
            .await
            .map_err(|e| TransferError::from_at(stage, e))?;
        let line = port
            .wait_for(&[SESSION_EVENT, BEARER_LOST], timeout)
            .await
            .map_err(|e| TransferError::from_at(stage, e))?;

        match SessionEvent::parse(&line) {
            SessionEvent::Ready(max) => Ok((accepted, max)),
            other => Err(other.into_error(stage)),
        }
    }

    async fn close<T: ModemTransport>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        script: &Script,
    ) -> Result<(), TransferError> {
        let stage = TransferStage::Close;
        let mut attempt = 1;
        loop {
            let error = match self.request(link, &script.close, &[SESSION_EVENT, BEARER_LOST]).await {
                Ok(line) => match SessionEvent::parse(&line) {
                    SessionEvent::Closed => return Ok(()),
                    other => other.into_error(stage),
                },
                Err(e) => TransferError::from_at(stage, e),
            };
            self.check_retry(stage, attempt, error)?;
            attempt += 1;
        }
    }

    /// Send `command`, wait for `OK`, then for a line matching `events`.
    async fn request<T: ModemTransport>(
        &self,
        link: &mut RegisteredLink<'_, T>,
        command: &Command,
        events: &[&str],
    ) -> Result<Line, AtError> {
        let timeout = link.session_timeout_ms();
        let port = link.port();
        port.send_command(command).await?;

        // The data prompt replaces the final result of `AT+FTPPUT=2,n`
        if events.contains(&DATA_PROMPT) {
            return port.wait_for(events, timeout).await;
        }
        let response_timeout = port.timeout_ms();
        port.read_final(response_timeout).await?;
        port.wait_for(events, timeout).await
    }

    fn check_retry(
        &self,
        stage: TransferStage,
        attempt: u8,
        error: TransferError,
    ) -> Result<(), TransferError> {
        if !error.retry_in_stage() || attempt >= self.state_retries {
            return Err(error);
        }
        warn!(
            "{:?} attempt {}/{} failed: {}",
            stage, attempt, self.state_retries, error
        );
        Ok(())
    }
}
