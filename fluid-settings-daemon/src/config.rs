//! Daemon configuration.
//!
//! Settings layer in the usual order: compiled defaults, then an optional
//! configuration file, then `FLUID_SETTINGS_DAEMON_*` environment
//! variables, then whatever the command line overrides.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Communicator bus `address:port` to register on.
    pub communicator: String,
    /// `address:port` other fluid-settings daemons connect to.
    pub listen: String,
    /// Colon-separated list of definition directories.
    pub definitions: String,
    /// Path of the persisted settings file.
    pub settings: String,
    /// Seconds between `FLUID_SETTINGS_GOSSIP` announcements.
    pub gossip_timeout: u64,
    /// Seconds of quiet before changed settings are saved.
    pub save_timeout: u64,
    /// Name of the machine this daemon runs on.
    pub server_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            communicator: "127.0.0.1:4050".to_string(),
            listen: "127.0.0.1:4049".to_string(),
            definitions: "/usr/share/fluid-settings/definitions:/var/lib/fluid-settings/definitions"
                .to_string(),
            settings: "/var/lib/fluid-settings/settings/settings.conf".to_string(),
            gossip_timeout: 60,
            save_timeout: 5,
            server_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

impl DaemonConfig {
    /// Build the configuration from defaults, an optional file and the
    /// environment (`FLUID_SETTINGS_DAEMON__<FIELD>`).
    pub fn load(file: Option<&str>) -> Result<Self, DaemonError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path));
        }
        // "__" keeps multi-word field names like save_timeout in one piece
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("FLUID_SETTINGS_DAEMON")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.gossip_timeout == 0 {
            return Err(DaemonError::Invalid(
                "the gossip-timeout parameter must be a positive number of seconds".to_string(),
            ));
        }
        if self.save_timeout == 0 {
            return Err(DaemonError::Invalid(
                "the save-timeout parameter must be a positive number of seconds".to_string(),
            ));
        }
        self.listen_address()?;
        Ok(())
    }

    /// The peer listener address, parsed.
    pub fn listen_address(&self) -> Result<SocketAddr, DaemonError> {
        self.listen
            .parse()
            .map_err(|_| DaemonError::Invalid(format!("cannot parse listen address {:?}", self.listen)))
    }
}
