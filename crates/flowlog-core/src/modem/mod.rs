//! Cellular modem plumbing
//!
//! - [`at`]: AT command framing over a raw byte transport
//! - [`link`]: power, network registration and packet data bearer
//! - [`ftp`]: the modem's built-in FTP client driven as a state machine

pub mod at;
pub mod ftp;
pub mod link;

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use thiserror_no_std::Error;

pub use at::{AtError, AtPort};
pub use ftp::{
    RemoteTarget, TransferClient, TransferError, TransferFailure, TransferReport, TransferStage,
    UploadMode,
};
pub use link::{LinkController, LinkError, LinkSession, RegisteredLink, RegistrationState};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("no data before timeout")]
    Timeout,
    #[error("serial link failure")]
    Link,
}

/// Raw byte channel to the modem (typically a UART).
pub trait ModemTransport {
    fn send(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>>;

    /// Wait up to `timeout_ms` for at least one byte.
    fn receive(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> impl Future<Output = Result<usize, TransportError>>;
}

/// Modem supply control.
pub trait ModemPower {
    /// Whether the modem reports itself powered.
    fn is_on(&mut self) -> bool;

    /// Toggle the modem's power state with its key input.
    fn toggle(&mut self) -> impl Future<Output = ()>;
}

/// Time the key line is held low to toggle a SIM800-class modem
pub const POWER_KEY_PULSE_MS: u32 = 2_000;

/// Power key wired to a GPIO output with the status line on an input.
pub struct PowerKey<K, S, D> {
    key: K,
    status: S,
    delay: D,
}

impl<K, S, D> PowerKey<K, S, D>
where
    K: OutputPin,
    S: InputPin,
    D: DelayNs,
{
    pub fn new(key: K, status: S, delay: D) -> Self {
        Self { key, status, delay }
    }
}

impl<K, S, D> ModemPower for PowerKey<K, S, D>
where
    K: OutputPin,
    S: InputPin,
    D: DelayNs,
{
    fn is_on(&mut self) -> bool {
        self.status.is_high().unwrap_or(false)
    }

    async fn toggle(&mut self) {
        // GPIO writes on the supported targets are infallible
        let _ = self.key.set_low();
        self.delay.delay_ms(POWER_KEY_PULSE_MS).await;
        let _ = self.key.set_high();
    }
}
