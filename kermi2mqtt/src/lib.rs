//! Bridge between Kermi x-center heat pumps and MQTT.
//!
//! The bridge polls the heat pump and its storage units over Modbus (TCP or
//! RTU), publishes their values to MQTT and turns MQTT commands into
//! validated, rate-limited register writes.
//!
//! # Topics
//!
//! ```text
//! kermi/<device_id>/<device_type>/sensors/<name>            state
//! kermi/<device_id>/<device_type>/availability              online | offline (retained)
//! kermi/<device_id>/<device_type>/controls/<name>/set       commands
//! kermi/<device_id>/<device_type>/controls/<name>/set/error command failures
//! kermi/<device_id>/status                                  bridge status (retained)
//! ```
//!
//! Where:
//! - `<device_id>` - configured id, or the Modbus endpoint made topic-safe
//! - `<device_type>` - `heat_pump`, `storage_heating` or `storage_dhw`

pub mod bridge;
pub mod client;
pub mod commands;
pub mod config;
pub mod device;
pub mod discovery;
pub mod enums;
pub mod filter;
pub mod mappings;
pub mod modbus;
pub mod registers;
pub mod safety;
pub mod transform;

pub use bridge::{Bridge, BridgeContext, EngineError, EngineSettings};
pub use client::{ClientError, DeviceClient, DeviceType, PollSnapshot, RawValue, WriteTarget, WriteValue};
pub use commands::{CommandEnvelope, CommandError};
pub use config::Kermi2MqttConfig;
pub use device::{Attribute, Component, DeviceRegistry, LogicalDevice};
pub use discovery::DiscoveryPublisher;
pub use modbus::ModbusDeviceClient;
pub use safety::{RateLimiter, SafetyRegistry};
pub use transform::ValueTransformer;

/// Bridge name reported in the status document.
pub const BRIDGE_NAME: &str = "kermi2mqtt";
