//! AT command framing
//!
//! Commands are rendered into a bounded working buffer before anything is
//! sent. A command that does not fit fails with [`AtError::CommandTooLong`]:
//! a truncated `AT+FTPPUTPATH` would still be a valid command, just one that
//! writes somewhere else.

use core::fmt;

use log::{debug, trace};
use thiserror_no_std::Error;

use super::{ModemTransport, TransportError};
use crate::config::COMMAND_CAPACITY;
use crate::text;

pub const LINE_CAPACITY: usize = 128;
pub const RX_CAPACITY: usize = 256;
/// Upper bound on lines consumed while waiting for one result
pub const MAX_LINES_PER_EXCHANGE: usize = 16;
pub const MAX_INFO_LINES: usize = 4;

pub type Line = heapless::String<LINE_CAPACITY>;
pub type Command = heapless::String<COMMAND_CAPACITY>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtError {
    #[error("command needs {len} bytes, buffer holds {limit}")]
    CommandTooLong { len: usize, limit: usize },
    #[error("no response before timeout")]
    Timeout,
    #[error("modem answered ERROR")]
    Error,
    #[error("modem answered +CME ERROR: {0}")]
    Cme(u16),
    #[error("no result within {0} lines")]
    Unterminated(usize),
    #[error("response line overflowed or was not text")]
    Garbled,
    #[error("serial link failure")]
    Transport,
}

impl From<TransportError> for AtError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Self::Timeout,
            TransportError::Link => Self::Transport,
        }
    }
}

/// Informational lines preceding a final `OK`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    lines: heapless::Vec<Line, MAX_INFO_LINES>,
}

impl Response {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(Line::as_str)
    }

    /// The first line starting with `prefix`, with the prefix removed.
    pub fn value(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }
}

enum ResultCode {
    Ok,
    Error,
    Cme(u16),
}

fn result_code(line: &str) -> Option<ResultCode> {
    match line {
        "OK" => Some(ResultCode::Ok),
        "ERROR" => Some(ResultCode::Error),
        _ => line
            .strip_prefix("+CME ERROR:")
            .map(|code| ResultCode::Cme(code.trim().parse().unwrap_or(0))),
    }
}

/// Line-oriented AT session over a raw transport.
pub struct AtPort<T> {
    transport: T,
    rx: heapless::Vec<u8, RX_CAPACITY>,
    limit: usize,
    timeout_ms: u32,
}

impl<T: ModemTransport> AtPort<T> {
    /// `command_limit` bounds a rendered command including its terminator.
    pub fn new(transport: T, command_limit: usize, timeout_ms: u32) -> Self {
        Self {
            transport,
            rx: heapless::Vec::new(),
            limit: command_limit.min(COMMAND_CAPACITY),
            timeout_ms,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Render a command, enforcing the configured buffer size.
    pub fn render(&self, args: fmt::Arguments<'_>) -> Result<Command, AtError> {
        let limit = self.limit;
        match text::render::<COMMAND_CAPACITY>(args) {
            Ok(command) if command.len() < limit => Ok(command),
            Ok(command) => Err(AtError::CommandTooLong {
                len: command.len() + 1,
                limit,
            }),
            Err(needed) => Err(AtError::CommandTooLong {
                len: needed + 1,
                limit,
            }),
        }
    }

    /// Send a command and wait for its final result.
    pub async fn command(&mut self, command: &Command) -> Result<Response, AtError> {
        self.command_with_timeout(command, self.timeout_ms).await
    }

    pub async fn command_with_timeout(
        &mut self,
        command: &Command,
        timeout_ms: u32,
    ) -> Result<Response, AtError> {
        self.send_command(command).await?;
        self.read_final(timeout_ms).await
    }

    /// Send a command without waiting for anything.
    pub async fn send_command(&mut self, command: &Command) -> Result<(), AtError> {
        debug!("> {}", command);
        self.transport.send(command.as_bytes()).await?;
        self.transport.send(b"\r").await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), AtError> {
        trace!("> [{} bytes]", bytes.len());
        self.transport.send(bytes).await?;
        Ok(())
    }

    /// Collect lines until `OK`, `ERROR` or `+CME ERROR`.
    pub async fn read_final(&mut self, timeout_ms: u32) -> Result<Response, AtError> {
        let mut response = Response::default();

        for _ in 0..MAX_LINES_PER_EXCHANGE {
            let line = self.read_line(timeout_ms).await?;
            match result_code(&line) {
                Some(ResultCode::Ok) => return Ok(response),
                Some(ResultCode::Error) => return Err(AtError::Error),
                Some(ResultCode::Cme(code)) => return Err(AtError::Cme(code)),
                None if line.starts_with("AT") => {} // echo
                None => {
                    if response.lines.push(line).is_err() {
                        debug!("Dropping extra response line");
                    }
                }
            }
        }

        Err(AtError::Unterminated(MAX_LINES_PER_EXCHANGE))
    }

    /// Wait for a line starting with any of `prefixes`, skipping others.
    ///
    /// An `ERROR` or `+CME ERROR` seen on the way ends the wait.
    pub async fn wait_for(&mut self, prefixes: &[&str], timeout_ms: u32) -> Result<Line, AtError> {
        for _ in 0..MAX_LINES_PER_EXCHANGE {
            let line = self.read_line(timeout_ms).await?;
            if prefixes.iter().any(|prefix| line.starts_with(prefix)) {
                return Ok(line);
            }
            match result_code(&line) {
                Some(ResultCode::Error) => return Err(AtError::Error),
                Some(ResultCode::Cme(code)) => return Err(AtError::Cme(code)),
                _ => debug!("Skipping '{}'", line),
            }
        }

        Err(AtError::Unterminated(MAX_LINES_PER_EXCHANGE))
    }

    /// Next non-empty line, without its line ending.
    pub async fn read_line(&mut self, timeout_ms: u32) -> Result<Line, AtError> {
        loop {
            if let Some(end) = self.rx.iter().position(|b| *b == b'\n') {
                let line = core::str::from_utf8(&self.rx[..end])
                    .ok()
                    .map(|s| s.trim_end_matches('\r'))
                    .and_then(|s| Line::try_from(s).ok());

                let consumed = end + 1;
                let remaining = self.rx.len() - consumed;
                self.rx.copy_within(consumed.., 0);
                self.rx.truncate(remaining);

                match line {
                    Some(line) if line.is_empty() => continue,
                    Some(line) => {
                        debug!("< {}", line);
                        return Ok(line);
                    }
                    None => return Err(AtError::Garbled),
                }
            }

            if self.rx.is_full() {
                self.rx.clear();
                return Err(AtError::Garbled);
            }

            let mut chunk = [0u8; 64];
            let room = (RX_CAPACITY - self.rx.len()).min(chunk.len());
            let n = self.transport.receive(&mut chunk[..room], timeout_ms).await?;
            // Cannot overflow: `room` bounds the read
            let _ = self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    /// Replays canned bytes in fixed-size chunks.
    struct Canned {
        rx: VecDeque<u8>,
        chunk: usize,
        sent: Vec<u8>,
    }

    impl Canned {
        fn new(reply: &str, chunk: usize) -> Self {
            Self {
                rx: reply.bytes().collect(),
                chunk,
                sent: Vec::new(),
            }
        }
    }

    impl ModemTransport for Canned {
        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.extend_from_slice(bytes);
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, TransportError> {
            if self.rx.is_empty() {
                return Err(TransportError::Timeout);
            }
            let n = buf.len().min(self.chunk).min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn port(reply: &str, chunk: usize) -> AtPort<Canned> {
        AtPort::new(Canned::new(reply, chunk), 70, 100)
    }

    #[test]
    fn test_response_lines_and_echo() {
        let mut port = port("AT+CSQ\r\r\n+CSQ: 14,0\r\n\r\nOK\r\n", 3);
        let cmd = port.render(format_args!("AT+CSQ")).unwrap();
        let response = block_on(port.command(&cmd)).unwrap();

        assert_eq!(response.value("+CSQ:"), Some("14,0"));
        assert_eq!(port.transport().sent, b"AT+CSQ\r");
    }

    #[test]
    fn test_error_results() {
        let mut p = port("\r\nERROR\r\n", 64);
        let cmd = p.render(format_args!("AT+FOO")).unwrap();
        assert_eq!(block_on(p.command(&cmd)), Err(AtError::Error));

        let mut p = port("\r\n+CME ERROR: 30\r\n", 64);
        assert_eq!(block_on(p.command(&cmd)), Err(AtError::Cme(30)));
    }

    #[test]
    fn test_silence_times_out() {
        let mut p = port("", 64);
        let cmd = p.render(format_args!("AT")).unwrap();
        assert_eq!(block_on(p.command(&cmd)), Err(AtError::Timeout));
    }

    #[test]
    fn test_command_too_long_is_rejected_before_sending() {
        let p = port("", 64);
        let path = "/a/very/long/remote/path/that/does/not/fit/in/the/buffer/at/all/";
        let err = p
            .render(format_args!("AT+FTPPUTPATH=\"{}\"", path))
            .unwrap_err();
        assert_eq!(
            err,
            AtError::CommandTooLong {
                len: 16 + path.len() + 1,
                limit: 70
            }
        );
        assert!(p.transport().sent.is_empty());

        // Exactly at the bound still fits (69 bytes + terminator)
        let fill = "x".repeat(69 - 3);
        assert!(p.render(format_args!("AT+{}", fill)).is_ok());
        let fill = "x".repeat(70 - 3);
        assert!(p.render(format_args!("AT+{}", fill)).is_err());
    }

    #[test]
    fn test_wait_for_skips_unrelated_lines() {
        let mut p = port("\r\n+CREG: 1\r\n\r\n+FTPPUT: 1,1,1360\r\n", 7);
        let line = block_on(p.wait_for(&["+FTPPUT: 1,"], 100)).unwrap();
        assert_eq!(line.as_str(), "+FTPPUT: 1,1,1360");
    }

    #[test]
    fn test_leftover_bytes_survive_between_reads() {
        let mut p = port("\r\nOK\r\n\r\n+FTPPUT: 1,0\r\n", 64);
        let cmd = p.render(format_args!("AT+FTPPUT=2,0")).unwrap();
        block_on(p.command(&cmd)).unwrap();
        let line = block_on(p.wait_for(&["+FTPPUT: 1,"], 100)).unwrap();
        assert_eq!(line.as_str(), "+FTPPUT: 1,0");
    }
}
