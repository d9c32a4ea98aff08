//! Configuration for kermi2mqtt.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kermi_bridge_framework::{
    BackoffPolicy, BridgeConfig, BridgeError, LoggingConfig, MqttConfig, Qos, Result,
};
use kermi_common::sanitize_segment;

use crate::client::{DeviceType, WriteTarget};
use crate::mappings;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kermi2MqttConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// Modbus settings
    pub modbus: ModbusConfig,

    /// Topic layout, polling and discovery
    #[serde(default)]
    pub integration: IntegrationConfig,

    /// Write protection
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Timing and QoS tuning
    #[serde(default)]
    pub advanced: AdvancedConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus connection and unit addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Unit addresses
    #[serde(default)]
    pub units: UnitsConfig,

    /// Holding register (or coil) address per control. Controls without an
    /// address are read-only.
    #[serde(default)]
    pub write_registers: HashMap<String, u16>,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ModbusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured write addresses; unknown names are dropped by validation.
    pub fn write_addresses(&self) -> HashMap<WriteTarget, u16> {
        self.write_registers
            .iter()
            .filter_map(|(name, address)| WriteTarget::from_name(name).map(|t| (t, *address)))
            .collect()
    }
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl ConnectionConfig {
    /// Endpoint description used for logging and id derivation.
    pub fn endpoint(&self) -> String {
        match self {
            ConnectionConfig::Tcp { host, port } => format!("{}:{}", host, port),
            ConnectionConfig::Rtu { port, .. } => port.clone(),
        }
    }
}

/// Modbus unit address per device type. `null` disables a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsConfig {
    #[serde(default = "default_heat_pump_unit")]
    pub heat_pump: Option<u8>,
    #[serde(default = "default_storage_heating_unit")]
    pub storage_heating: Option<u8>,
    #[serde(default = "default_storage_dhw_unit")]
    pub storage_dhw: Option<u8>,
}

fn default_heat_pump_unit() -> Option<u8> {
    Some(DeviceType::HeatPump.default_unit())
}

fn default_storage_heating_unit() -> Option<u8> {
    Some(DeviceType::StorageHeating.default_unit())
}

fn default_storage_dhw_unit() -> Option<u8> {
    Some(DeviceType::StorageDhw.default_unit())
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            heat_pump: default_heat_pump_unit(),
            storage_heating: default_storage_heating_unit(),
            storage_dhw: default_storage_dhw_unit(),
        }
    }
}

impl UnitsConfig {
    /// Enabled units in device type order.
    pub fn enabled(&self) -> Vec<(DeviceType, u8)> {
        [
            (DeviceType::HeatPump, self.heat_pump),
            (DeviceType::StorageHeating, self.storage_heating),
            (DeviceType::StorageDhw, self.storage_dhw),
        ]
        .into_iter()
        .filter_map(|(device_type, unit)| unit.map(|u| (device_type, u)))
        .collect()
    }
}

/// Topic layout and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Bridge-level identifier. Derived from the Modbus endpoint when unset.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Base topic (default: "kermi")
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Poll interval in seconds (10-300)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Home Assistant discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_base_topic() -> String {
    "kermi".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            base_topic: default_base_topic(),
            poll_interval_secs: default_poll_interval(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Discovery topic prefix (default: "homeassistant")
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_discovery_prefix(),
        }
    }
}

/// Write protection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum seconds between writes to the same control
    #[serde(default = "default_rate_limit")]
    pub command_rate_limit_secs: u64,

    /// Range-check written values
    #[serde(default = "default_true")]
    pub enable_validation: bool,

    /// Controls refused outright, with the reason reported back
    #[serde(default)]
    pub blocked_controls: HashMap<String, String>,
}

fn default_rate_limit() -> u64 {
    60
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            command_rate_limit_secs: default_rate_limit(),
            enable_validation: true,
            blocked_controls: HashMap::new(),
        }
    }
}

/// Timing and QoS tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    #[serde(default = "default_modbus_reconnect_delay")]
    pub modbus_reconnect_delay_ms: u64,
    #[serde(default = "default_modbus_max_reconnect_delay")]
    pub modbus_max_reconnect_delay_ms: u64,
    #[serde(default = "default_mqtt_reconnect_delay")]
    pub mqtt_reconnect_delay_ms: u64,
    #[serde(default = "default_mqtt_max_reconnect_delay")]
    pub mqtt_max_reconnect_delay_ms: u64,

    /// QoS of state, availability and discovery messages
    #[serde(default)]
    pub mqtt_qos_state: Qos,
    /// QoS of the command subscription
    #[serde(default)]
    pub mqtt_qos_command: Qos,

    #[serde(default = "default_true")]
    pub mqtt_retain_discovery: bool,
    #[serde(default)]
    pub mqtt_retain_state: bool,

    /// Pause after a write before re-polling
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Upper bound on bridge shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_modbus_reconnect_delay() -> u64 {
    2_000
}

fn default_modbus_max_reconnect_delay() -> u64 {
    30_000
}

fn default_mqtt_reconnect_delay() -> u64 {
    1_000
}

fn default_mqtt_max_reconnect_delay() -> u64 {
    60_000
}

fn default_settle_delay() -> u64 {
    2_000
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            modbus_reconnect_delay_ms: default_modbus_reconnect_delay(),
            modbus_max_reconnect_delay_ms: default_modbus_max_reconnect_delay(),
            mqtt_reconnect_delay_ms: default_mqtt_reconnect_delay(),
            mqtt_max_reconnect_delay_ms: default_mqtt_max_reconnect_delay(),
            mqtt_qos_state: Qos::default(),
            mqtt_qos_command: Qos::default(),
            mqtt_retain_discovery: true,
            mqtt_retain_state: false,
            settle_delay_ms: default_settle_delay(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl AdvancedConfig {
    pub fn modbus_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.modbus_reconnect_delay_ms),
            Duration::from_millis(self.modbus_max_reconnect_delay_ms),
        )
    }

    pub fn mqtt_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.mqtt_reconnect_delay_ms),
            Duration::from_millis(self.mqtt_max_reconnect_delay_ms),
        )
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Kermi2MqttConfig {
    /// Bridge-level identifier: the configured device id, or the Modbus
    /// endpoint made topic-safe.
    pub fn base_id(&self) -> String {
        match &self.integration.device_id {
            Some(id) => sanitize_segment(id),
            None => sanitize_segment(&self.modbus.connection.endpoint_host()),
        }
    }

    /// MQTT client id, defaulting to `kermi2mqtt_{base_id}`.
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("kermi2mqtt_{}", self.base_id()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.integration.poll_interval_secs)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.safety.command_rate_limit_secs)
    }

    fn validate_modbus(&self) -> std::result::Result<(), String> {
        match &self.modbus.connection {
            ConnectionConfig::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err("modbus.connection.host cannot be empty".to_string());
                }
                if *port == 0 {
                    return Err("modbus.connection.port must be 1-65535".to_string());
                }
            }
            ConnectionConfig::Rtu {
                port,
                data_bits,
                parity,
                stop_bits,
                ..
            } => {
                if port.trim().is_empty() {
                    return Err("modbus.connection.port cannot be empty".to_string());
                }
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(format!(
                            "invalid parity '{}' (use none, even, or odd)",
                            parity
                        ));
                    }
                }
                if !(5..=8).contains(data_bits) {
                    return Err(format!("data_bits must be 5-8, got {}", data_bits));
                }
                if !(1..=2).contains(stop_bits) {
                    return Err(format!("stop_bits must be 1 or 2, got {}", stop_bits));
                }
            }
        }

        let units = self.modbus.units.enabled();
        if units.is_empty() {
            return Err("at least one Modbus unit must be enabled".to_string());
        }
        for (device_type, unit) in &units {
            if !(1..=247).contains(unit) {
                return Err(format!(
                    "modbus.units.{}: unit id must be 1-247, got {}",
                    device_type, unit
                ));
            }
            if units
                .iter()
                .filter(|(_, other)| other == unit)
                .count()
                > 1
            {
                return Err(format!("modbus.units: unit id {} used twice", unit));
            }
        }

        for name in self.modbus.write_registers.keys() {
            if WriteTarget::from_name(name).is_none() {
                let known: Vec<_> = WriteTarget::ALL.iter().map(|t| t.as_str()).collect();
                return Err(format!(
                    "modbus.write_registers: unknown control '{}' (known: {})",
                    name,
                    known.join(", ")
                ));
            }
        }

        Ok(())
    }

    fn validate_integration(&self) -> std::result::Result<(), String> {
        let integration = &self.integration;

        if !(10..=300).contains(&integration.poll_interval_secs) {
            return Err(format!(
                "integration.poll_interval_secs must be 10-300, got {}",
                integration.poll_interval_secs
            ));
        }
        if integration.base_topic.trim().is_empty() {
            return Err("integration.base_topic cannot be empty".to_string());
        }
        if integration.base_topic.contains(['+', '#']) {
            return Err(format!(
                "integration.base_topic '{}' must not contain wildcards",
                integration.base_topic
            ));
        }
        if integration.discovery.enabled && integration.discovery.prefix.trim().is_empty() {
            return Err("integration.discovery.prefix cannot be empty".to_string());
        }
        if self.base_id().is_empty() {
            return Err("integration.device_id cannot be empty".to_string());
        }

        Ok(())
    }

    fn validate_advanced(&self) -> std::result::Result<(), String> {
        let advanced = &self.advanced;

        if advanced.modbus_max_reconnect_delay_ms < advanced.modbus_reconnect_delay_ms {
            return Err(
                "advanced.modbus_max_reconnect_delay_ms must be >= modbus_reconnect_delay_ms"
                    .to_string(),
            );
        }
        if advanced.mqtt_max_reconnect_delay_ms < advanced.mqtt_reconnect_delay_ms {
            return Err(
                "advanced.mqtt_max_reconnect_delay_ms must be >= mqtt_reconnect_delay_ms"
                    .to_string(),
            );
        }
        if advanced.mqtt_reconnect_delay_ms == 0 || advanced.modbus_reconnect_delay_ms == 0 {
            return Err("reconnect delays must be greater than zero".to_string());
        }
        if advanced.shutdown_timeout_secs == 0 {
            return Err("advanced.shutdown_timeout_secs must be greater than zero".to_string());
        }

        Ok(())
    }

    fn validate_safety(&self) -> std::result::Result<(), String> {
        let known = mappings::control_names();
        for control in self.safety.blocked_controls.keys() {
            if !known.contains(&control.as_str()) {
                return Err(format!(
                    "safety.blocked_controls: unknown control '{}' (known: {})",
                    control,
                    known.join(", ")
                ));
            }
        }
        Ok(())
    }
}

impl ConnectionConfig {
    fn endpoint_host(&self) -> String {
        match self {
            ConnectionConfig::Tcp { host, .. } => host.clone(),
            ConnectionConfig::Rtu { port, .. } => port.clone(),
        }
    }
}

impl BridgeConfig for Kermi2MqttConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn base_topic(&self) -> &str {
        &self.integration.base_topic
    }

    fn validate(&self) -> Result<()> {
        self.mqtt
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;

        self.validate_modbus()
            .and_then(|_| self.validate_integration())
            .and_then(|_| self.validate_advanced())
            .and_then(|_| self.validate_safety())
            .map_err(BridgeError::validation)
    }
}
