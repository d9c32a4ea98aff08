//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, MqttConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for the bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use kermi_bridge_framework::{BridgeConfig, LoggingConfig, MqttConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub mqtt: MqttConfig,
///     pub logging: LoggingConfig,
///     pub base_topic: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn mqtt(&self) -> &MqttConfig {
///         &self.mqtt
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn base_topic(&self) -> &str {
///         &self.base_topic
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT broker configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the base topic for this bridge.
    fn base_topic(&self) -> &str;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        self.mqtt()
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn from_json5(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
        base_topic: String,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn base_topic(&self) -> &str {
            &self.base_topic
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_default_validation_checks_mqtt() {
        let ok = TestConfig::from_json5(r#"{ mqtt: { host: "broker" }, base_topic: "kermi" }"#);
        assert!(ok.is_ok());

        let bad = TestConfig::from_json5(r#"{ mqtt: { host: "" }, base_topic: "kermi" }"#);
        assert!(matches!(bad, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = TestConfig::from_json5("{ mqtt: ");
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
