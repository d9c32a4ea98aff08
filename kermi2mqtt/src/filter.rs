//! Publication eligibility of attribute values.
//!
//! Both storage units answer on the same register table, so each one reports
//! values that only make sense for the other. The exclusivity sets below
//! decide which keys a unit never publishes.

use crate::client::{DeviceType, RawValue};
use crate::device::{Attribute, Component};

/// Plausible range of a temperature reading in °C. Anything outside is a
/// disconnected or faulty sensor.
pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);

/// Keys only meaningful on the heating storage unit.
pub const HEATING_ONLY: &[&str] = &[
    "heating_setpoint",
    "heating_actual",
    "heating_circuit_setpoint",
    "heating_circuit_actual",
    "heating_circuit_status",
    "heating_circuit_operating_mode",
    "cooling_actual",
    "cooling_mode_active",
    "t4_temperature",
    "outdoor_temperature_avg",
    "heating_curve_offset",
    "season_threshold_heating_limit",
    "set_heating_curve_offset",
    "set_season_threshold_heating_limit",
];

/// Keys only meaningful on the DHW storage unit.
pub const DHW_ONLY: &[&str] = &[
    "hot_water_setpoint",
    "hot_water_actual",
    "hot_water_setpoint_constant",
    "set_hot_water_setpoint_constant",
    "set_hot_water_single_charge_active",
];

/// Whether `key` can never carry data on `device_type`.
pub fn is_excluded(device_type: DeviceType, key: &str) -> bool {
    match device_type {
        DeviceType::StorageDhw => HEATING_ONLY.contains(&key),
        DeviceType::StorageHeating => DHW_ONLY.contains(&key),
        DeviceType::HeatPump => false,
    }
}

fn is_temperature(attribute: &Attribute) -> bool {
    attribute.component == Component::Sensor && attribute.key.contains("temperature")
}

/// Whether `value` of `attribute` should be published for `device_type`.
pub fn should_publish(device_type: DeviceType, attribute: &Attribute, value: Option<&RawValue>) -> bool {
    let Some(value) = value else {
        return false;
    };

    if is_excluded(device_type, attribute.key) {
        return false;
    }

    if is_temperature(attribute) {
        let reading = value.as_f64();
        if !(TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&reading) {
            tracing::debug!(
                device_type = %device_type,
                attribute = attribute.key,
                value = reading,
                "Temperature out of range, skipping"
            );
            return false;
        }
    }

    true
}
