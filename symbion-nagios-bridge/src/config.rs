//! Bridge configuration
//!
//! Loaded from TOML: `SYMBION_BRIDGE_CONFIG` if set, else
//! `/etc/symbion/nagios-bridge.toml`. Every field has a default so a missing
//! file still yields a runnable bridge against a local broker.

use crate::connection::{liveness_payload, LivenessState, DEFAULT_RECONNECT_DELAY};
use crate::topic;
use crate::transport::{SessionOptions, Testament};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

pub const CONFIG_ENV: &str = "SYMBION_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/symbion/nagios-bridge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("cannot determine local hostname: {0}")]
    Hostname(std::io::Error),
}

/// Where the configuration came from, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// The file did not exist, built-in defaults are in use
    Defaults(PathBuf),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BridgeConfig {
    /// Overrides the system hostname in topics and the client id
    pub hostname: Option<String>,

    #[validate(nested)]
    pub spool: SpoolConfig,

    #[validate(nested)]
    pub mqtt: MqttConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    /// Undecodable files are moved here instead of being deleted
    pub quarantine_directory: Option<PathBuf>,
    /// Process files already present once the broker first accepts us
    pub sweep_on_start: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/spool/nagios/mqtt"),
            quarantine_directory: None,
            sweep_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MqttConfig {
    #[validate(length(min = 1, message = "Broker host must not be empty"))]
    pub host: String,

    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Defaults to `symbion-nagios-bridge-{hostname}`
    pub client_id: Option<String>,

    pub username: Option<String>,

    #[serde(skip_serializing)]
    pub password: Option<String>,

    #[validate(range(min = 5, message = "Keep-alive must be at least 5 seconds"))]
    pub keep_alive_secs: u64,

    #[validate(length(min = 1, message = "Base topic must not be empty"))]
    pub base_topic: String,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    #[validate(range(min = 1, message = "Reconnect delay must be at least 1 second"))]
    pub reconnect_delay_secs: u64,

    #[validate(range(min = 1, message = "Request channel capacity must be at least 1"))]
    pub request_channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            base_topic: "nagios".into(),
            qos: 0,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY.as_secs(),
            request_channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,
    pub ansi_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            ansi_colors: true,
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl BridgeConfig {
    /// Reads the file named by `SYMBION_BRIDGE_CONFIG` or the default path.
    pub async fn load() -> Result<(Self, ConfigSource), ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok((Self::from_toml(&text)?, ConfigSource::File(path.to_path_buf()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                Ok((config, ConfigSource::Defaults(path.to_path_buf())))
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured hostname, or the one reported by the system.
    pub fn resolve_hostname(&self) -> Result<String, ConfigError> {
        if let Some(name) = self.hostname.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let name = hostname::get().map_err(ConfigError::Hostname)?;
        Ok(name.to_string_lossy().into_owned())
    }

    pub fn client_id(&self, hostname: &str) -> String {
        // rumqttc rejects empty ids and ids starting with a space
        match self.mqtt.client_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("symbion-nagios-bridge-{}", hostname),
        }
    }

    /// Session parameters with the "dead" testament on the liveness topic.
    pub fn session_options(&self, hostname: &str) -> SessionOptions {
        let credentials = match (&self.mqtt.username, &self.mqtt.password) {
            (Some(user), password) => Some((user.clone(), password.clone().unwrap_or_default())),
            (None, _) => None,
        };

        SessionOptions {
            client_id: self.client_id(hostname),
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            credentials,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            qos: self.mqtt.qos(),
            request_capacity: self.mqtt.request_channel_capacity,
            testament: Testament {
                topic: topic::liveness_topic(&self.mqtt.base_topic, hostname),
                payload: liveness_payload(LivenessState::Dead.as_str()),
            },
        }
    }
}
