//! Inbound command handling.
//!
//! A command travels topic parse, device and control lookup, connection
//! check, rate limit, payload parse, safety check and write, in that order. Any rejection is
//! reported on `{topic}/error` and never stops the engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use kermi_bridge_framework::InboundMessage;
use kermi_common::parse_command_topic;
use kermi_common::topic::error_topic;

use crate::bridge::Bridge;
use crate::client::{ClientError, DeviceType, WriteValue};
use crate::device::{Attribute, Component};
use crate::filter;
use crate::safety::SafetyError;
use crate::transform::{TransformError, ValueTransformer};

/// Only accepted payload of momentary controls.
pub const TRIGGER_PAYLOAD: &str = "1";

/// A resolved inbound write request.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub device_id: String,
    pub device_type: DeviceType,
    pub attribute: &'static Attribute,
    pub payload: String,
}

impl CommandEnvelope {
    /// Rate limiter key.
    pub fn rate_key(&self) -> String {
        format!("{}_{}", self.device_id, self.attribute.object_id())
    }
}

/// Reasons a command is refused.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Unknown control '{control}' on {device}")]
    UnknownControl { device: String, control: String },

    #[error("Control '{control}' is not available on {device}")]
    NotApplicable { device: String, control: String },

    #[error("Device unreachable, write not applied")]
    DeviceUnavailable,

    #[error("Rate limited, retry in {}s", .remaining.as_secs_f64().ceil())]
    RateLimited { remaining: Duration },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("Write failed: {0}")]
    WriteFailed(#[source] ClientError),
}

impl CommandError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::UnknownDevice(_) => "unknown_device",
            CommandError::UnknownControl { .. } => "unknown_control",
            CommandError::NotApplicable { .. } => "not_applicable",
            CommandError::DeviceUnavailable => "device_unavailable",
            CommandError::RateLimited { .. } => "rate_limited",
            CommandError::InvalidPayload(_) | CommandError::Transform(_) => "invalid_payload",
            CommandError::Safety(_) => "safety",
            CommandError::WriteFailed(_) => "write_failed",
        }
    }

    /// Message published to the error topic. Write failures are abbreviated;
    /// the full error is logged.
    pub fn public_message(&self) -> String {
        match self {
            CommandError::WriteFailed(e) if e.is_connection() => {
                "Device unreachable, write not applied".to_string()
            }
            CommandError::WriteFailed(ClientError::WritesDisabled(_)) => {
                "Writing this control is disabled".to_string()
            }
            CommandError::WriteFailed(_) => "Device rejected the write".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON document published to `{topic}/error`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandErrorReport {
    pub error: &'static str,
    pub message: String,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl CommandErrorReport {
    pub fn new(error: &CommandError, payload: &str) -> Self {
        let retry_after_secs = match error {
            CommandError::RateLimited { remaining } => Some(remaining.as_secs_f64().ceil() as u64),
            _ => None,
        };

        Self {
            error: error.kind(),
            message: error.public_message(),
            payload: payload.to_string(),
            retry_after_secs,
            timestamp: Utc::now(),
        }
    }
}

/// Parse a command payload according to the control's component kind.
pub fn parse_payload(
    attribute: &Attribute,
    payload: &str,
    transformer: &ValueTransformer,
) -> Result<WriteValue, CommandError> {
    let trimmed = payload.trim();

    match attribute.component {
        Component::Number => {
            let value: f64 = trimmed
                .parse()
                .map_err(|_| CommandError::InvalidPayload(format!("'{}' is not a number", trimmed)))?;
            if !value.is_finite() {
                return Err(CommandError::InvalidPayload(format!(
                    "'{}' is not a finite number",
                    trimmed
                )));
            }
            Ok(WriteValue::Number(value))
        }
        Component::Select => {
            let enum_type = attribute.enum_type.ok_or_else(|| {
                CommandError::InvalidPayload(format!("{} has no value table", attribute.key))
            })?;
            Ok(WriteValue::Code(transformer.decode(enum_type, trimmed)?))
        }
        Component::Button => {
            if trimmed == TRIGGER_PAYLOAD {
                Ok(WriteValue::Trigger)
            } else {
                Err(CommandError::InvalidPayload(format!(
                    "expected '{}', got '{}'",
                    TRIGGER_PAYLOAD, trimmed
                )))
            }
        }
        Component::Sensor | Component::BinarySensor => Err(CommandError::InvalidPayload(format!(
            "{} is read-only",
            attribute.key
        ))),
    }
}

impl Bridge {
    /// Handle one inbound message. Malformed topics are dropped silently.
    pub async fn handle_message(&mut self, message: InboundMessage) {
        let Some(command) = parse_command_topic(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring non-command message");
            return;
        };

        let result = match self.resolve(&command.namespace, &command.control, &message.payload).await {
            Ok(envelope) => self.execute(envelope).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            match &e {
                CommandError::WriteFailed(source) => {
                    error!(topic = %message.topic, error = %source, "Command write failed")
                }
                other => warn!(topic = %message.topic, error = %other, "Command rejected"),
            }
            self.report_error(&message.topic, &message.payload, &e).await;
        }
    }

    async fn resolve(
        &self,
        namespace: &str,
        control: &str,
        payload: &str,
    ) -> Result<CommandEnvelope, CommandError> {
        let registry = self.registry.lock().await;
        let device = registry
            .by_namespace(namespace)
            .ok_or_else(|| CommandError::UnknownDevice(namespace.to_string()))?;

        let attribute = device.control(control).ok_or_else(|| CommandError::UnknownControl {
            device: device.id.clone(),
            control: control.to_string(),
        })?;

        if filter::is_excluded(device.device_type, attribute.key) {
            return Err(CommandError::NotApplicable {
                device: device.id.clone(),
                control: control.to_string(),
            });
        }

        Ok(CommandEnvelope {
            device_id: device.id.clone(),
            device_type: device.device_type,
            attribute,
            payload: payload.to_string(),
        })
    }

    /// Rate limit, parse, validate and write a resolved command. Commands
    /// are refused while the device is disconnected.
    pub async fn execute(&mut self, envelope: CommandEnvelope) -> Result<(), CommandError> {
        let attribute = envelope.attribute;
        let Some(target) = attribute.write else {
            return Err(CommandError::UnknownControl {
                device: envelope.device_id.clone(),
                control: attribute.object_id().to_string(),
            });
        };

        if !self.device.is_connected() {
            return Err(CommandError::DeviceUnavailable);
        }

        let key = envelope.rate_key();
        self.context
            .rate_limiter
            .can_write(&key)
            .map_err(|remaining| CommandError::RateLimited { remaining })?;

        let value = parse_payload(attribute, &envelope.payload, &self.transformer)?;

        let numeric = match value {
            WriteValue::Number(n) => Some(n),
            _ => None,
        };
        self.safety.validate(target, numeric)?;

        self.context.rate_limiter.record(&key);
        self.device
            .write(envelope.device_type, target, value)
            .await
            .map_err(CommandError::WriteFailed)?;

        info!(
            device = %envelope.device_id,
            control = attribute.object_id(),
            value = ?value,
            "Command applied"
        );

        if attribute.component != Component::Button {
            let shutdown = self.context.shutdown.clone();
            if shutdown.sleep(self.settings.settle_delay).await {
                if let Err(e) = self.poll_and_publish().await {
                    warn!(error = %e, "Confirmation poll failed");
                }
            }
        }

        Ok(())
    }

    async fn report_error(&self, topic: &str, payload: &str, error: &CommandError) {
        let report = CommandErrorReport::new(error, payload);
        if let Err(e) = self.publisher.publish_json(&error_topic(topic), &report, false).await {
            warn!(topic = %topic, error = %e, "Failed to publish command error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings;

    fn control(name: &str) -> &'static Attribute {
        mappings::find_control(name).unwrap()
    }

    #[test]
    fn test_parse_number() {
        let transformer = ValueTransformer::new().unwrap();
        let setpoint = control("hot_water_setpoint");

        assert_eq!(
            parse_payload(setpoint, " 48.5\n", &transformer).unwrap(),
            WriteValue::Number(48.5)
        );
        assert!(matches!(
            parse_payload(setpoint, "warm", &transformer),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(parse_payload(setpoint, "NaN", &transformer).is_err());
        assert!(parse_payload(setpoint, "inf", &transformer).is_err());
    }

    #[test]
    fn test_parse_select() {
        let transformer = ValueTransformer::new().unwrap();
        let mode = control("energy_mode");

        assert_eq!(
            parse_payload(mode, "Boost", &transformer).unwrap(),
            WriteValue::Code(3)
        );
        let err = parse_payload(mode, "NORMAL", &transformer).unwrap_err();
        assert_eq!(err.kind(), "invalid_payload");
    }

    #[test]
    fn test_parse_button() {
        let transformer = ValueTransformer::new().unwrap();
        let button = control("one_time_heating");

        assert_eq!(
            parse_payload(button, "1", &transformer).unwrap(),
            WriteValue::Trigger
        );
        assert!(parse_payload(button, "PRESS", &transformer).is_err());
        assert!(parse_payload(button, "0", &transformer).is_err());
    }

    #[test]
    fn test_report_shape() {
        let error = CommandError::RateLimited {
            remaining: Duration::from_millis(41_200),
        };
        let report = CommandErrorReport::new(&error, "45");
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["error"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 42);
        assert_eq!(json["payload"], "45");
        assert!(json["message"].as_str().unwrap().contains("42s"));
    }

    #[test]
    fn test_write_failure_message_abbreviated() {
        let error = CommandError::WriteFailed(ClientError::Exception(
            "IllegalDataAddress at 0x64 on unit 51".to_string(),
        ));
        assert_eq!(error.public_message(), "Device rejected the write");
        assert_eq!(error.kind(), "write_failed");

        let disabled = CommandError::WriteFailed(ClientError::WritesDisabled(
            crate::client::WriteTarget::EnergyMode,
        ));
        assert_eq!(disabled.public_message(), "Writing this control is disabled");

        let offline = CommandErrorReport::new(&CommandError::DeviceUnavailable, "50");
        assert_eq!(offline.error, "device_unavailable");
        assert_eq!(offline.message, "Device unreachable, write not applied");

        let report = CommandErrorReport::new(&CommandError::Safety(SafetyError::OutOfRange("too hot".into())), "75");
        assert!(report.retry_after_secs.is_none());
        assert_eq!(report.message, "too hot");
    }
}
