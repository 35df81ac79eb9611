//! Cellular link lifecycle
//!
//! ```text
//! PoweredOff -> Registering -> Registered | Degraded -> PoweredOff
//! ```
//!
//! [`LinkController`] is the only owner of the [`LinkSession`]. Transfers
//! need a [`RegisteredLink`], which only [`LinkController::ensure_registered`]
//! hands out, so no protocol command can be issued on an unregistered link.

use embedded_hal_async::delay::DelayNs;
use heapless::Vec;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::at::{AtError, AtPort, Command};
use super::{ModemPower, ModemTransport};
use crate::config::{ApnConfig, Config};
use crate::time::DateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    PoweredOff,
    Registering,
    Registered,
    /// Registration was attempted but the link is not usable for transfers.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSession {
    pub state: RegistrationState,
    /// Last `AT+CSQ` reading, 0-31 (unknown is reported as 0)
    pub signal_quality: u8,
    /// Registration polls used in the current power cycle
    pub attempts_used: u8,
}

impl LinkSession {
    const OFF: Self = Self {
        state: RegistrationState::PoweredOff,
        signal_quality: 0,
        attempts_used: 0,
    };
}

/// Network registration status from `+CREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl NetworkStatus {
    /// Parse the payload of a `+CREG:` line (`<n>,<stat>[,...]`).
    pub fn from_creg(payload: &str) -> Self {
        match payload.split(',').nth(1).map(str::trim) {
            Some("0") => Self::NotRegistered,
            Some("1") => Self::Home,
            Some("2") => Self::Searching,
            Some("3") => Self::Denied,
            Some("5") => Self::Roaming,
            _ => Self::Unknown,
        }
    }

    /// Whether this status admits transfers under the roaming policy.
    pub fn is_admitted(self, roaming_enabled: bool) -> bool {
        match self {
            Self::Home => true,
            Self::Roaming => roaming_enabled,
            _ => false,
        }
    }
}

/// Parse the payload of a `+CSQ:` line. 99 (not known) maps to 0.
pub fn parse_signal_quality(payload: &str) -> Option<u8> {
    let rssi: u8 = payload.split(',').next()?.trim().parse().ok()?;
    Some(if rssi > 31 { 0 } else { rssi })
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("modem did not respond after {checks} checks")]
    HardwareFault { checks: u8 },
    #[error("network registration not reached after {attempts} polls")]
    RegistrationTimeout { attempts: u8 },
    #[error("signal quality {quality} below threshold {threshold}")]
    InsufficientSignal { quality: u8, threshold: u8 },
    #[error("link command needs {len} bytes, buffer holds {limit}")]
    CommandTooLong { len: usize, limit: usize },
    #[error("packet data bearer could not be opened: {0}")]
    Bearer(AtError),
}

/// Proof that the link is registered with an open data bearer.
///
/// Borrowing the controller's port for its lifetime keeps the link from being
/// powered down or re-registered while a transfer runs.
pub struct RegisteredLink<'l, T> {
    port: &'l mut AtPort<T>,
    session: &'l LinkSession,
    session_timeout_ms: u32,
}

impl<T: ModemTransport> RegisteredLink<'_, T> {
    pub fn session(&self) -> &LinkSession {
        self.session
    }

    /// Wait bound for network-side events (server replies, data acks)
    pub fn session_timeout_ms(&self) -> u32 {
        self.session_timeout_ms
    }

    pub(crate) fn port(&mut self) -> &mut AtPort<T> {
        &mut *self.port
    }

    /// Network time as reported by the modem (`AT+CCLK?`).
    pub async fn network_time(&mut self) -> Result<Option<DateTime>, AtError> {
        let command = self.port.render(format_args!("AT+CCLK?"))?;
        let response = self.port.command(&command).await?;
        Ok(response.value("+CCLK:").and_then(DateTime::from_cclk))
    }
}

pub struct LinkController<'a, T, P, D> {
    port: AtPort<T>,
    power: P,
    delay: D,
    session: LinkSession,
    bearer_open: bool,
    max_retries: u8,
    network_reg_delay_ms: u32,
    power_check_interval_ms: u32,
    session_timeout_ms: u32,
    rssi_threshold: u8,
    roaming_enabled: bool,
    sync_clock: bool,
    apn: ApnConfig<'a>,
}

impl<'a, T, P, D> LinkController<'a, T, P, D>
where
    T: ModemTransport,
    P: ModemPower,
    D: DelayNs,
{
    pub fn new(transport: T, power: P, delay: D, config: &Config<'a>) -> Self {
        Self {
            port: AtPort::new(
                transport,
                config.command_buffer_size,
                config.response_timeout_ms,
            ),
            power,
            delay,
            session: LinkSession::OFF,
            bearer_open: false,
            max_retries: config.max_retries,
            network_reg_delay_ms: config.network_reg_delay_ms,
            power_check_interval_ms: config.power_check_interval_ms,
            session_timeout_ms: config.session_timeout_ms,
            rssi_threshold: config.rssi_threshold,
            roaming_enabled: config.roaming_enabled,
            sync_clock: config.sync_clock_from_network,
            apn: config.apn,
        }
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    pub fn port(&self) -> &AtPort<T> {
        &self.port
    }

    /// Switch the modem on and bring it into a known command state.
    pub async fn power_up(&mut self) -> Result<(), LinkError> {
        if self.session.state != RegistrationState::PoweredOff {
            return Ok(());
        }

        let mut setup: Vec<Command, 4> = Vec::new();
        for text in ["AT", "ATE0", "AT+CMEE=1"] {
            let _ = setup.push(self.render(format_args!("{}", text))?);
        }
        if self.sync_clock {
            let _ = setup.push(self.render(format_args!("AT+CLTS=1"))?);
        }

        if !self.power.is_on() {
            info!("Powering modem up");
            self.power.toggle().await;
        }

        let mut checks = 0;
        loop {
            checks += 1;
            if self.power.is_on() && self.port.command(&setup[0]).await.is_ok() {
                break;
            }
            if checks >= self.max_retries {
                error!("Modem unresponsive after {} checks", checks);
                return Err(LinkError::HardwareFault { checks });
            }
            self.delay.delay_ms(self.power_check_interval_ms).await;
        }

        for command in &setup[1..] {
            if let Err(e) = self.port.command(command).await {
                warn!("Modem rejected '{}': {}", command, e);
                return Err(LinkError::HardwareFault { checks });
            }
        }

        debug!("Modem answered after {} checks", checks);
        self.session = LinkSession {
            state: RegistrationState::Registering,
            signal_quality: 0,
            attempts_used: 0,
        };
        Ok(())
    }

    /// Poll registration and signal quality until both admit a transfer,
    /// then open the packet data bearer.
    ///
    /// Polls at most `max_retries` times, `network_reg_delay_ms` apart.
    pub async fn ensure_registered(&mut self) -> Result<RegisteredLink<'_, T>, LinkError> {
        let state = self.session.state;
        match state {
            RegistrationState::Registered if self.bearer_open => return Ok(self.token()),
            RegistrationState::Registered => {}
            RegistrationState::PoweredOff => {
                self.power_up().await?;
                self.poll_registration().await?;
            }
            RegistrationState::Registering | RegistrationState::Degraded => {
                self.poll_registration().await?;
            }
        }

        self.open_bearer().await?;
        Ok(self.token())
    }

    async fn poll_registration(&mut self) -> Result<(), LinkError> {
        self.session.state = RegistrationState::Registering;
        let creg = self.render(format_args!("AT+CREG?"))?;
        let csq = self.render(format_args!("AT+CSQ"))?;

        let mut network_seen = false;
        for attempt in 1..=self.max_retries {
            self.session.attempts_used = attempt;

            let status = match self.port.command(&creg).await {
                Ok(response) => response
                    .value("+CREG:")
                    .map_or(NetworkStatus::Unknown, NetworkStatus::from_creg),
                Err(e) => {
                    debug!("Registration query failed: {}", e);
                    NetworkStatus::Unknown
                }
            };
            let quality = match self.port.command(&csq).await {
                Ok(response) => response
                    .value("+CSQ:")
                    .and_then(parse_signal_quality)
                    .unwrap_or(0),
                Err(e) => {
                    debug!("Signal query failed: {}", e);
                    0
                }
            };
            self.session.signal_quality = quality;

            let admitted = status.is_admitted(self.roaming_enabled);
            network_seen |= admitted;
            debug!(
                "Poll {}/{}: {:?}, signal {}",
                attempt, self.max_retries, status, quality
            );

            if admitted && quality >= self.rssi_threshold {
                info!("Registered ({:?}), signal {}", status, quality);
                self.session.state = RegistrationState::Registered;
                return Ok(());
            }

            if attempt < self.max_retries {
                self.delay.delay_ms(self.network_reg_delay_ms).await;
            }
        }

        self.session.state = RegistrationState::Degraded;
        if network_seen {
            warn!(
                "Signal {} stayed below threshold {}",
                self.session.signal_quality, self.rssi_threshold
            );
            Err(LinkError::InsufficientSignal {
                quality: self.session.signal_quality,
                threshold: self.rssi_threshold,
            })
        } else {
            warn!("No registration after {} polls", self.max_retries);
            Err(LinkError::RegistrationTimeout {
                attempts: self.max_retries,
            })
        }
    }

    async fn open_bearer(&mut self) -> Result<(), LinkError> {
        let query = self.render(format_args!("AT+SAPBR=2,1"))?;
        let open = self.render(format_args!("AT+SAPBR=1,1"))?;

        let mut parameters: Vec<Command, 4> = Vec::new();
        let _ = parameters.push(self.render(format_args!("AT+SAPBR=3,1,\"CONTYPE\",\"GPRS\""))?);
        let _ = parameters.push(self.render(format_args!("AT+SAPBR=3,1,\"APN\",\"{}\"", self.apn.name))?);
        if !self.apn.username.is_empty() {
            let _ = parameters.push(
                self.render(format_args!("AT+SAPBR=3,1,\"USER\",\"{}\"", self.apn.username))?,
            );
            let _ = parameters.push(
                self.render(format_args!("AT+SAPBR=3,1,\"PWD\",\"{}\"", self.apn.password))?,
            );
        }

        // Bearer status 1 means already connected
        let already_open = self
            .port
            .command(&query)
            .await
            .ok()
            .and_then(|r| r.value("+SAPBR:").map(|v| v.split(',').nth(1) == Some("1")))
            .unwrap_or(false);

        if !already_open {
            for command in &parameters {
                self.port.command(command).await.map_err(LinkError::Bearer)?;
            }
            self.port
                .command_with_timeout(&open, self.session_timeout_ms)
                .await
                .map_err(|e| {
                    warn!("Bearer did not open: {}", e);
                    LinkError::Bearer(e)
                })?;
        }

        info!("Data bearer open on APN {}", self.apn.name);
        self.bearer_open = true;
        Ok(())
    }

    /// Switch the modem off. Never fails; an unacknowledged power-down falls
    /// back to the power key.
    pub async fn power_down(&mut self) {
        self.session.state = RegistrationState::PoweredOff;
        self.bearer_open = false;

        if !self.power.is_on() {
            return;
        }

        if let Ok(command) = self.port.render(format_args!("AT+CPOWD=1")) {
            if let Err(e) = self.port.command(&command).await {
                debug!("Power-down command not acknowledged: {}", e);
            }
        }

        for _ in 0..self.max_retries {
            if !self.power.is_on() {
                info!("Modem powered down");
                return;
            }
            self.delay.delay_ms(self.power_check_interval_ms).await;
        }

        warn!("Modem still on, using power key");
        self.power.toggle().await;
    }

    fn token(&mut self) -> RegisteredLink<'_, T> {
        RegisteredLink {
            port: &mut self.port,
            session: &self.session,
            session_timeout_ms: self.session_timeout_ms,
        }
    }

    fn render(&self, args: core::fmt::Arguments<'_>) -> Result<Command, LinkError> {
        self.port.render(args).map_err(|e| match e {
            AtError::CommandTooLong { len, limit } => {
                error!("Link command does not fit the command buffer ({} > {})", len, limit);
                LinkError::CommandTooLong { len, limit }
            }
            other => LinkError::Bearer(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{NoopDelay, SimModem, SimPower, sim_config};
    use embassy_futures::block_on;

    type Controller<'a> = LinkController<'a, SimModem, SimPower, NoopDelay>;

    fn controller<'a>(modem: &SimModem, config: &Config<'a>) -> Controller<'a> {
        LinkController::new(modem.clone(), modem.power(), NoopDelay, config)
    }

    #[test]
    fn test_registers_with_good_signal() {
        let modem = SimModem::new();
        modem.set_signal(20);
        let config = sim_config();
        let mut link = controller(&modem, &config);

        let token = block_on(link.ensure_registered()).unwrap();
        assert_eq!(token.session().state, RegistrationState::Registered);
        assert_eq!(token.session().signal_quality, 20);
        assert!(modem.commands().iter().any(|c| c == "AT+SAPBR=3,1,\"APN\",\"m2mglobal\""));
    }

    #[test]
    fn test_weak_signal_degrades_after_exact_poll_count() {
        let modem = SimModem::new();
        modem.set_signal(5);
        let mut config = sim_config();
        config.rssi_threshold = 11;
        config.max_retries = 3;
        let mut link = controller(&modem, &config);

        let result = block_on(link.ensure_registered()).map(|_| ());
        assert_eq!(
            result,
            Err(LinkError::InsufficientSignal {
                quality: 5,
                threshold: 11
            })
        );
        assert_eq!(link.session().state, RegistrationState::Degraded);
        assert_eq!(link.session().attempts_used, 3);
        assert_eq!(modem.count_commands("AT+CSQ"), 3);
        assert_eq!(modem.count_commands("AT+SAPBR"), 0);
    }

    #[test]
    fn test_never_registered_times_out() {
        let modem = SimModem::new();
        modem.set_registration(2);
        let mut config = sim_config();
        config.max_retries = 4;
        let mut link = controller(&modem, &config);

        let result = block_on(link.ensure_registered()).map(|_| ());
        assert_eq!(result, Err(LinkError::RegistrationTimeout { attempts: 4 }));
        assert_eq!(modem.count_commands("AT+CREG?"), 4);
    }

    #[test]
    fn test_roaming_policy() {
        let modem = SimModem::new();
        modem.set_registration(5);
        modem.set_signal(25);

        let mut config = sim_config();
        config.roaming_enabled = false;
        config.max_retries = 2;
        let mut link = controller(&modem, &config);
        let result = block_on(link.ensure_registered()).map(|_| ());
        assert_eq!(result, Err(LinkError::RegistrationTimeout { attempts: 2 }));
        block_on(link.power_down());

        config.roaming_enabled = true;
        let mut link = controller(&modem, &config);
        assert!(block_on(link.ensure_registered()).is_ok());
    }

    #[test]
    fn test_dead_modem_is_a_hardware_fault() {
        let modem = SimModem::new();
        modem.set_responsive(false);
        let mut config = sim_config();
        config.max_retries = 3;
        let mut link = controller(&modem, &config);

        assert_eq!(
            block_on(link.power_up()),
            Err(LinkError::HardwareFault { checks: 3 })
        );
        assert_eq!(link.session().state, RegistrationState::PoweredOff);
    }

    #[test]
    fn test_power_down_is_best_effort() {
        let modem = SimModem::new();
        let config = sim_config();
        let mut link = controller(&modem, &config);
        block_on(link.ensure_registered()).unwrap();

        // Modem stops answering; the key still switches it off
        modem.set_responsive(false);
        block_on(link.power_down());
        assert_eq!(link.session().state, RegistrationState::PoweredOff);
        assert!(!modem.is_powered());
    }

    #[test]
    fn test_long_apn_fails_before_bearer_traffic() {
        let modem = SimModem::new();
        let mut config = sim_config();
        config.apn.name = "an.access.point.name.that.is.far.too.long.for.the.command.buffer";
        let mut link = controller(&modem, &config);

        let result = block_on(link.ensure_registered()).map(|_| ());
        assert!(matches!(result, Err(LinkError::CommandTooLong { .. })));
        assert_eq!(modem.count_commands("AT+SAPBR"), 0);
    }

    #[test]
    fn test_network_time() {
        let modem = SimModem::new();
        modem.set_network_time(DateTime::new(2024, 1, 15, 0, 20));
        let config = sim_config();
        let mut link = controller(&modem, &config);

        let mut token = block_on(link.ensure_registered()).unwrap();
        assert_eq!(
            block_on(token.network_time()).unwrap(),
            DateTime::new(2024, 1, 15, 0, 20)
        );
    }

    #[test]
    fn test_creg_and_csq_parsing() {
        assert_eq!(NetworkStatus::from_creg(" 0,1"), NetworkStatus::Home);
        assert_eq!(NetworkStatus::from_creg("0,5"), NetworkStatus::Roaming);
        assert_eq!(NetworkStatus::from_creg("0"), NetworkStatus::Unknown);
        assert_eq!(parse_signal_quality("14,0"), Some(14));
        assert_eq!(parse_signal_quality("99,99"), Some(0));
        assert_eq!(parse_signal_quality(""), None);
    }
}
