//! Error types for the bridge framework.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in a bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Bus connection error (unreachable broker, dropped connection).
    #[error("MQTT connection error: {0}")]
    BusConnection(String),

    /// Publishing error.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// Subscription error.
    #[error("Failed to subscribe to {pattern}: {message}")]
    Subscribe { pattern: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A wait was interrupted because shutdown was requested.
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// Bridge tasks did not stop within the allotted time.
    #[error("Bridge did not stop within {secs}s")]
    ShutdownTimeout { secs: u64 },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the common library.
    #[error(transparent)]
    Common(#[from] kermi_common::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a bus connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::BusConnection(msg.into())
    }

    /// Whether this error means the bus is (or just became) unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::BusConnection(_) | Self::Publish { .. } | Self::Subscribe { .. }
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        assert!(BridgeError::connection("refused").is_connection());
        assert!(
            BridgeError::Publish {
                topic: "a/b".to_string(),
                message: "closed".to_string()
            }
            .is_connection()
        );
        assert!(!BridgeError::validation("bad").is_connection());
        assert!(!BridgeError::ShutdownRequested.is_connection());
    }
}
