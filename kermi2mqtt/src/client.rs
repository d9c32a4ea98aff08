//! Device-side collaborator interface.
//!
//! The engine talks to the heat pump only through [`DeviceClient`]; the
//! Modbus implementation lives in [`crate::modbus`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kermi_bridge_framework::{BackoffPolicy, Shutdown, reconnect_with_backoff};

/// Kind of logical device behind a Modbus unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    HeatPump,
    StorageHeating,
    StorageDhw,
}

impl DeviceType {
    pub const ALL: [DeviceType; 3] = [
        DeviceType::HeatPump,
        DeviceType::StorageHeating,
        DeviceType::StorageDhw,
    ];

    /// Topic level and bulk-read bucket name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::HeatPump => "heat_pump",
            DeviceType::StorageHeating => "storage_heating",
            DeviceType::StorageDhw => "storage_dhw",
        }
    }

    /// Factory Modbus unit address.
    pub fn default_unit(&self) -> u8 {
        match self {
            DeviceType::HeatPump => 40,
            DeviceType::StorageHeating => 50,
            DeviceType::StorageDhw => 51,
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, DeviceType::StorageHeating | DeviceType::StorageDhw)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Number(f64),
    Bool(bool),
}

impl RawValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            RawValue::Number(n) => *n,
            RawValue::Bool(b) => f64::from(u8::from(*b)),
        }
    }

    /// Integer code, if the value is a whole number in `u16` range.
    pub fn as_code(&self) -> Option<u16> {
        match self {
            RawValue::Number(n) if n.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(n) => {
                Some(*n as u16)
            }
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            RawValue::Number(n) => *n != 0.0,
            RawValue::Bool(b) => *b,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(n) => write!(f, "{}", n),
            RawValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Values of one poll cycle, bucketed by device type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSnapshot {
    buckets: HashMap<DeviceType, HashMap<String, RawValue>>,
}

impl PollSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device_type: DeviceType, key: impl Into<String>, value: RawValue) {
        self.buckets
            .entry(device_type)
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get(&self, device_type: DeviceType, key: &str) -> Option<&RawValue> {
        self.buckets.get(&device_type).and_then(|b| b.get(key))
    }

    pub fn bucket(&self, device_type: DeviceType) -> Option<&HashMap<String, RawValue>> {
        self.buckets.get(&device_type)
    }

    /// Total number of values across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writable parameter, resolved statically from the attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    /// Constant DHW setpoint in °C.
    HotWaterSetpoint,
    /// One-shot DHW charge.
    HotWaterSingleCharge,
    /// Season selection code.
    SeasonSelection,
    /// Heating circuit energy mode code.
    EnergyMode,
    /// Parallel shift of the heating curve in K.
    HeatingCurveOffset,
    /// Outdoor temperature above which heating is suspended, in °C.
    SeasonThresholdHeatingLimit,
}

impl WriteTarget {
    pub const ALL: [WriteTarget; 6] = [
        WriteTarget::HotWaterSetpoint,
        WriteTarget::HotWaterSingleCharge,
        WriteTarget::SeasonSelection,
        WriteTarget::EnergyMode,
        WriteTarget::HeatingCurveOffset,
        WriteTarget::SeasonThresholdHeatingLimit,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteTarget::HotWaterSetpoint => "hot_water_setpoint",
            WriteTarget::HotWaterSingleCharge => "hot_water_single_charge",
            WriteTarget::SeasonSelection => "season_selection",
            WriteTarget::EnergyMode => "energy_mode",
            WriteTarget::HeatingCurveOffset => "heating_curve_offset",
            WriteTarget::SeasonThresholdHeatingLimit => "season_threshold_heating_limit",
        }
    }
}

/// Parsed value of a write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteValue {
    Number(f64),
    Code(u16),
    Trigger,
}

/// Errors from the device client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Device exception: {0}")]
    Exception(String),

    #[error("No {0} unit is configured")]
    UnitMissing(DeviceType),

    #[error("{target:?} cannot be written on {device_type}")]
    Unsupported {
        device_type: DeviceType,
        target: WriteTarget,
    },

    #[error("Value {value} cannot be encoded for {target:?}")]
    Encoding { target: WriteTarget, value: f64 },

    #[error("Writing {} is disabled: no register address configured", .0.as_str())]
    WritesDisabled(WriteTarget),
}

impl ClientError {
    /// Whether the error means the endpoint is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::NotConnected | ClientError::Timeout(_)
        )
    }
}

/// Device-side collaborator.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;

    fn backoff(&self) -> BackoffPolicy;

    /// Reconnect with exponential backoff until success or shutdown.
    async fn reconnect_with_backoff(&self, shutdown: &Shutdown) -> kermi_bridge_framework::Result<()> {
        let policy = self.backoff();
        reconnect_with_backoff(&policy, shutdown, "modbus", || self.connect()).await
    }

    /// Units that answered on the bus, with their addresses.
    async fn present_units(&self) -> Result<Vec<(DeviceType, u8)>, ClientError>;

    /// Read every readable value of every present unit.
    async fn read_all_devices(&self) -> Result<PollSnapshot, ClientError>;

    /// Write one parameter.
    async fn write(
        &self,
        device_type: DeviceType,
        target: WriteTarget,
        value: WriteValue,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_names_and_units() {
        assert_eq!(DeviceType::StorageDhw.as_str(), "storage_dhw");
        assert_eq!(DeviceType::HeatPump.default_unit(), 40);
        assert_eq!(DeviceType::StorageHeating.default_unit(), 50);
        assert_eq!(DeviceType::StorageDhw.default_unit(), 51);
        assert!(!DeviceType::HeatPump.is_storage());
    }

    #[test]
    fn test_raw_value_code() {
        assert_eq!(RawValue::Number(3.0).as_code(), Some(3));
        assert_eq!(RawValue::Number(2.5).as_code(), None);
        assert_eq!(RawValue::Number(-1.0).as_code(), None);
        assert_eq!(RawValue::Bool(true).as_code(), None);
    }

    #[test]
    fn test_raw_value_display() {
        assert_eq!(RawValue::Number(21.5).to_string(), "21.5");
        assert_eq!(RawValue::Number(48.0).to_string(), "48");
        assert_eq!(RawValue::Bool(false).to_string(), "false");
    }

    #[test]
    fn test_snapshot_lookup() {
        let mut snapshot = PollSnapshot::new();
        snapshot.insert(DeviceType::HeatPump, "outdoor_temperature", RawValue::Number(4.5));

        assert_eq!(
            snapshot.get(DeviceType::HeatPump, "outdoor_temperature"),
            Some(&RawValue::Number(4.5))
        );
        assert!(snapshot.get(DeviceType::StorageDhw, "outdoor_temperature").is_none());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_connection_classification() {
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_connection());
        assert!(ClientError::NotConnected.is_connection());
        assert!(!ClientError::Exception("IllegalDataAddress".into()).is_connection());
        assert!(!ClientError::WritesDisabled(WriteTarget::EnergyMode).is_connection());
    }

    #[test]
    fn test_write_target_names() {
        for target in WriteTarget::ALL {
            assert_eq!(WriteTarget::from_name(target.as_str()), Some(target));
        }
        assert_eq!(WriteTarget::from_name("turbo"), None);
    }
}
