//! Deployment settings generated by `build.rs` from `.env`

use flowlog_core::config::{ApnConfig, Config, ConfigError, FtpConfig, RemoteNaming, UnitId};

mod generated {
    include!(concat!(env!("OUT_DIR"), "/deployment.rs"));
}

pub use generated::*;

/// The deployed configuration. Everything not set in `.env` keeps the
/// defaults from [`Config::new`].
pub fn config() -> Result<Config<'static>, ConfigError> {
    let unit = UnitId::new(UNIT_ID)?;
    let config = Config::new(
        unit,
        FtpConfig {
            host: FTP_HOST,
            port: FTP_PORT,
            username: FTP_USERNAME,
            password: FTP_PASSWORD,
            data_path: FTP_DATA_PATH,
            naming: RemoteNaming::PerUnit,
            data_suffix: "data",
            status_logging: true,
            log_path: FTP_LOG_PATH,
            boot_suffix: "log",
            fault_suffix: "err",
        },
        ApnConfig {
            name: APN_NAME,
            username: APN_USERNAME,
            password: APN_PASSWORD,
        },
    );
    config.validate()?;
    Ok(config)
}
