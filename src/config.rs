//! Device connection configuration
//!
//! Loaded from a TOML file with one table per concern. Every field except the
//! broker hostname and client id has a default suited to a constrained device
//! on a TLS-only broker.
//!
//! ```toml
//! [broker]
//! hostname = "broker.example.com"
//! client_id = "realm/device-01"
//!
//! [backoff]
//! initial_ms = 1000
//! max_ms = 60000
//! ```

use crate::transport::mqtt::backoff::BackoffScheduler;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// Broker endpoint and session identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// MQTT client identifier, unique per device
    pub client_id: String,
    /// Start a fresh session on every connect instead of resuming
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_port() -> u16 {
    8883
}

fn default_clean_session() -> bool {
    true
}

/// Connection timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Time allowed between CONNECT and CONNACK
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Upper bound for a single socket wait inside poll
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// MQTT keep-alive, also the retransmission timeout of cached messages
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_keep_alive_secs() -> u16 {
    30
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl TimeoutSection {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }
}

/// Reconnection backoff coefficients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSection {
    /// First delay and jitter amplitude
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    /// Largest delay before jitter
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

/// TLS transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,
    /// PEM bundle of trusted roots, the webpki roots are used when absent
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
    /// Override for the TLS server name, defaults to the broker hostname
    pub server_name: Option<String>,
}

fn default_tls_enabled() -> bool {
    true
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: default_tls_enabled(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: None,
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsSection {
    /// Incoming payloads above this size are acknowledged but not delivered
    #[serde(default = "default_max_incoming_payload")]
    pub max_incoming_payload: usize,
}

fn default_max_incoming_payload() -> usize {
    4096
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_incoming_payload: default_max_incoming_payload(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client id: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.broker.client_id)?;

        if self.broker.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker hostname must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker port must be non-zero".to_string(),
            ));
        }
        if self.timeouts.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        BackoffScheduler::new(self.backoff.initial_ms, self.backoff.max_ms)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.tls.enabled {
            match (&self.tls.client_cert_path, &self.tls.client_key_path) {
                (Some(_), None) => {
                    return Err(ConfigError::InvalidConfig(
                        "[tls] client_cert_path requires client_key_path".to_string(),
                    ))
                }
                (None, Some(_)) => {
                    return Err(ConfigError::InvalidConfig(
                        "[tls] client_key_path requires client_cert_path".to_string(),
                    ))
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Create a plain-TCP configuration for local testing
    pub fn local(client_id: &str) -> Self {
        Self {
            broker: BrokerSection {
                hostname: "localhost".to_string(),
                port: 1883,
                client_id: client_id.to_string(),
                clean_session: true,
            },
            timeouts: TimeoutSection::default(),
            backoff: BackoffSection::default(),
            tls: TlsSection {
                enabled: false,
                ..Default::default()
            },
            limits: LimitsSection::default(),
        }
    }
}

/// MQTT 3.1.1 allows any UTF-8 up to 65535 bytes, brokers commonly reject control characters
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() {
        return Err(ConfigError::InvalidClientId(
            "client id must not be empty".to_string(),
        ));
    }
    if client_id.len() > usize::from(u16::MAX) {
        return Err(ConfigError::InvalidClientId(format!(
            "client id is {} bytes, the limit is 65535",
            client_id.len()
        )));
    }
    if client_id.chars().any(char::is_control) {
        return Err(ConfigError::InvalidClientId(format!(
            "client id '{}' contains control characters",
            client_id.escape_debug()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
hostname = "broker.example.com"
port = 8884
client_id = "realm/device-01"
clean_session = false

[timeouts]
connection_timeout_ms = 3000
poll_timeout_ms = 100
keep_alive_secs = 60

[backoff]
initial_ms = 500
max_ms = 30000

[tls]
ca_cert_path = "/etc/device/ca.pem"
client_cert_path = "/etc/device/client.pem"
client_key_path = "/etc/device/client.key"
server_name = "mqtt.example.com"

[limits]
max_incoming_payload = 8192
"#;

        let config = DeviceConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.hostname, "broker.example.com");
        assert_eq!(config.broker.port, 8884);
        assert!(!config.broker.clean_session);
        assert_eq!(config.timeouts.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.timeouts.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.backoff.initial_ms, 500);
        assert!(config.tls.enabled);
        assert_eq!(
            config.tls.server_name.as_deref(),
            Some("mqtt.example.com")
        );
        assert_eq!(config.limits.max_incoming_payload, 8192);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml_content = r#"
[broker]
hostname = "broker.example.com"
client_id = "device-01"
"#;

        let config = DeviceConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.clean_session);
        assert_eq!(config.timeouts, TimeoutSection::default());
        assert_eq!(config.backoff, BackoffSection::default());
        assert!(config.tls.enabled);
        assert_eq!(config.tls.ca_cert_path, None);
        assert_eq!(config.limits.max_incoming_payload, 4096);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("bad\nid").is_err());
        assert!(validate_client_id("realm/device_01-x.y").is_ok());
    }

    #[test]
    fn test_backoff_coefficients_are_validated() {
        let mut config = DeviceConfig::local("device");
        config.backoff.initial_ms = 10_000;
        config.backoff.max_ms = 1_000;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_keep_alive_rejected() {
        let mut config = DeviceConfig::local("device");
        config.timeouts.keep_alive_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_cert_requires_key() {
        let mut config = DeviceConfig::local("device");
        config.tls.enabled = true;
        config.tls.client_cert_path = Some(PathBuf::from("/etc/device/client.pem"));
        assert!(config.validate().is_err());

        config.tls.client_key_path = Some(PathBuf::from("/etc/device/client.key"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_config_is_valid() {
        let config = DeviceConfig::local("device-under-test");
        assert!(config.validate().is_ok());
        assert!(!config.tls.enabled);
        assert_eq!(config.broker.port, 1883);
    }
}
