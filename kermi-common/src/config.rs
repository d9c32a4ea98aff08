use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP address.
    pub host: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Username (optional).
    #[serde(default)]
    pub username: Option<String>,

    /// Password (optional, only used together with `username`).
    #[serde(default)]
    pub password: Option<String>,

    /// Client identifier. Derived from the bridge device id when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// TLS settings.
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

impl MqttConfig {
    /// Create a configuration for a broker with defaults for everything else.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            tls: TlsConfig::default(),
        }
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate broker settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must be 1-65535".to_string()));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::Config(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                self.keep_alive_secs
            )));
        }
        if self.tls.certfile.is_some() != self.tls.keyfile.is_some() {
            return Err(Error::Config(
                "mqtt.tls.certfile and mqtt.tls.keyfile must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Enable TLS.
    #[serde(default)]
    pub enabled: bool,

    /// CA certificate bundle (PEM). Platform roots are used when unset.
    #[serde(default)]
    pub ca_certs: Option<String>,

    /// Client certificate (PEM) for mutual TLS.
    #[serde(default)]
    pub certfile: Option<String>,

    /// Client private key (PEM) for mutual TLS.
    #[serde(default)]
    pub keyfile: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
