//! Modem serial link

use embassy_time::{Duration, with_timeout};
use embedded_io_async::{Read, Write};
use log::trace;

use flowlog_core::modem::{ModemTransport, TransportError};

/// SIM800 default after autobauding
pub const MODEM_BAUDRATE: u32 = 115_200;

/// [`ModemTransport`] over any async serial port, in practice the esp-hal
/// UART wired to the modem.
pub struct UartTransport<U> {
    uart: U,
}

impl<U> UartTransport<U>
where
    U: Read + Write,
{
    pub fn new(uart: U) -> Self {
        Self { uart }
    }
}

impl<U> ModemTransport for UartTransport<U>
where
    U: Read + Write,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("uart tx {} bytes", bytes.len());
        self.uart
            .write_all(bytes)
            .await
            .map_err(|_| TransportError::Link)?;
        self.uart.flush().await.map_err(|_| TransportError::Link)
    }

    async fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError> {
        let read = with_timeout(
            Duration::from_millis(timeout_ms as u64),
            self.uart.read(buf),
        )
        .await
        .map_err(|_| TransportError::Timeout)?;

        match read {
            Ok(0) => Err(TransportError::Timeout),
            Ok(n) => Ok(n),
            Err(_) => Err(TransportError::Link),
        }
    }
}
