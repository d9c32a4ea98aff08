//! Static attribute tables per device type.
//!
//! Keys match the bulk-read keys produced by the register table in
//! [`crate::registers`]. Storage units 50 and 51 share one table; the
//! attribute filter removes what a given unit never reports.

use std::sync::LazyLock;

use serde_json::{Value, json};

use crate::client::{DeviceType, WriteTarget};
use crate::device::{Attribute, Component};
use crate::enums::EnumType;
use crate::safety::{DHW_SETPOINT_RANGE, HEATING_CURVE_OFFSET_RANGE, SEASON_THRESHOLD_RANGE};

fn sensor(key: &'static str, label: &'static str, suffix: &'static str, metadata: Value) -> Attribute {
    Attribute {
        key,
        label,
        topic_suffix: suffix,
        component: Component::Sensor,
        enum_type: None,
        write: None,
        state_key: None,
        metadata,
    }
}

fn temperature(key: &'static str, label: &'static str, suffix: &'static str) -> Attribute {
    sensor(
        key,
        label,
        suffix,
        json!({
            "device_class": "temperature",
            "unit_of_measurement": "°C",
            "state_class": "measurement",
        }),
    )
}

fn diagnostic_temperature(key: &'static str, label: &'static str, suffix: &'static str) -> Attribute {
    let mut attribute = temperature(key, label, suffix);
    attribute.metadata["entity_category"] = json!("diagnostic");
    attribute
}

fn power(key: &'static str, label: &'static str, suffix: &'static str, unit: &str) -> Attribute {
    sensor(
        key,
        label,
        suffix,
        json!({
            "device_class": "power",
            "unit_of_measurement": unit,
            "state_class": "measurement",
        }),
    )
}

fn cop(key: &'static str, label: &'static str, suffix: &'static str) -> Attribute {
    sensor(
        key,
        label,
        suffix,
        json!({ "state_class": "measurement", "icon": "mdi:gauge" }),
    )
}

fn hours(key: &'static str, label: &'static str, suffix: &'static str) -> Attribute {
    sensor(
        key,
        label,
        suffix,
        json!({
            "device_class": "duration",
            "unit_of_measurement": "h",
            "state_class": "total_increasing",
            "entity_category": "diagnostic",
        }),
    )
}

fn enum_sensor(
    key: &'static str,
    label: &'static str,
    suffix: &'static str,
    enum_type: EnumType,
    metadata: Value,
) -> Attribute {
    Attribute {
        enum_type: Some(enum_type),
        ..sensor(key, label, suffix, metadata)
    }
}

fn binary(key: &'static str, label: &'static str, suffix: &'static str, metadata: Value) -> Attribute {
    Attribute {
        component: Component::BinarySensor,
        ..sensor(key, label, suffix, metadata)
    }
}

fn control(
    key: &'static str,
    label: &'static str,
    suffix: &'static str,
    component: Component,
    target: WriteTarget,
    state_key: Option<&'static str>,
    metadata: Value,
) -> Attribute {
    Attribute {
        key,
        label,
        topic_suffix: suffix,
        component,
        enum_type: None,
        write: Some(target),
        state_key,
        metadata,
    }
}

fn number_metadata(range: (f64, f64), step: f64, unit: &str, device_class: Option<&str>) -> Value {
    let mut metadata = json!({
        "unit_of_measurement": unit,
        "min": range.0,
        "max": range.1,
        "step": step,
        "mode": "slider",
    });
    if let Some(class) = device_class {
        metadata["device_class"] = json!(class);
    }
    metadata
}

/// Attributes of the heat pump (unit 40).
pub static HEAT_PUMP_ATTRIBUTES: LazyLock<Vec<Attribute>> = LazyLock::new(|| {
    vec![
        temperature("outdoor_temperature", "Outdoor Temperature", "sensors/outdoor_temp"),
        temperature("supply_temp_heat_pump", "Supply Temperature", "sensors/supply_temp"),
        temperature("return_temp_heat_pump", "Return Temperature", "sensors/return_temp"),
        temperature(
            "energy_source_inlet",
            "Energy Source Inlet Temperature",
            "sensors/energy_source_inlet",
        ),
        temperature(
            "energy_source_outlet",
            "Energy Source Outlet Temperature",
            "sensors/energy_source_outlet",
        ),
        power("power_total", "Total Thermal Power", "sensors/power_total", "kW"),
        power(
            "power_electrical_total",
            "Total Electrical Power",
            "sensors/power_electrical",
            "kW",
        ),
        power("power_heating", "Heating Power", "sensors/power_heating", "kW"),
        power("power_hot_water", "Hot Water Power", "sensors/power_hot_water", "kW"),
        cop("cop_total", "COP Total", "sensors/cop_total"),
        cop("cop_heating", "COP Heating", "sensors/cop_heating"),
        cop("cop_hot_water", "COP Hot Water", "sensors/cop_hot_water"),
        enum_sensor(
            "heat_pump_status",
            "Heat Pump Status",
            "sensors/status",
            EnumType::HeatPumpStatus,
            json!({ "icon": "mdi:state-machine", "entity_category": "diagnostic" }),
        ),
        binary(
            "global_alarm",
            "Global Alarm",
            "binary_sensors/alarm",
            json!({ "device_class": "problem" }),
        ),
        hours(
            "operating_hours_compressor",
            "Compressor Operating Hours",
            "sensors/compressor_hours",
        ),
        hours("operating_hours_fan", "Fan Operating Hours", "sensors/fan_hours"),
        binary(
            "pv_modulation_status",
            "PV Modulation Active",
            "binary_sensors/pv_modulation",
            json!({ "icon": "mdi:solar-power" }),
        ),
        power("pv_modulation_power", "PV Modulation Power", "sensors/pv_power", "W"),
    ]
});

/// Attributes shared by the storage units (50 heating, 51 DHW).
pub static STORAGE_ATTRIBUTES: LazyLock<Vec<Attribute>> = LazyLock::new(|| {
    vec![
        diagnostic_temperature("t1_temperature", "T1 Temperature", "sensors/t1_temp"),
        diagnostic_temperature("t4_temperature", "Outdoor Temperature (T4)", "sensors/t4_temp"),
        temperature(
            "outdoor_temperature_avg",
            "Outdoor Temperature Average",
            "sensors/outdoor_temp_avg",
        ),
        temperature("heating_setpoint", "Heating Setpoint", "sensors/heating_setpoint"),
        temperature("heating_actual", "Heating Actual Temperature", "sensors/heating_actual"),
        temperature(
            "heating_circuit_setpoint",
            "Heating Circuit Setpoint",
            "sensors/heating_circuit_setpoint",
        ),
        temperature(
            "heating_circuit_actual",
            "Heating Circuit Actual",
            "sensors/heating_circuit_actual",
        ),
        enum_sensor(
            "heating_circuit_status",
            "Heating Circuit Status",
            "sensors/heating_circuit_status",
            EnumType::HeatingCircuitStatus,
            json!({ "icon": "mdi:state-machine", "entity_category": "diagnostic" }),
        ),
        enum_sensor(
            "heating_circuit_operating_mode",
            "Heating Circuit Operating Mode",
            "sensors/heating_circuit_mode",
            EnumType::OperatingMode,
            json!({ "icon": "mdi:cog", "entity_category": "diagnostic" }),
        ),
        sensor(
            "heating_curve_offset",
            "Heating Curve Offset",
            "sensors/heating_curve_offset",
            json!({ "unit_of_measurement": "K", "entity_category": "diagnostic" }),
        ),
        sensor(
            "season_threshold_heating_limit",
            "Heating Limit Temperature",
            "sensors/season_threshold",
            json!({
                "device_class": "temperature",
                "unit_of_measurement": "°C",
                "entity_category": "diagnostic",
            }),
        ),
        temperature("hot_water_setpoint", "Hot Water Setpoint", "sensors/hot_water_setpoint"),
        temperature(
            "hot_water_actual",
            "Hot Water Actual Temperature",
            "sensors/hot_water_actual",
        ),
        temperature(
            "hot_water_setpoint_constant",
            "Hot Water Setpoint Constant",
            "sensors/hot_water_setpoint_constant",
        ),
        temperature("cooling_actual", "Cooling Actual Temperature", "sensors/cooling_actual"),
        binary(
            "cooling_mode_active",
            "Cooling Mode Active",
            "binary_sensors/cooling_active",
            json!({ "icon": "mdi:snowflake" }),
        ),
        enum_sensor(
            "season_selection_manual",
            "Season Selection (Current)",
            "sensors/season_selection",
            EnumType::SeasonSelection,
            json!({ "icon": "mdi:calendar-range" }),
        ),
        enum_sensor(
            "heating_circuit_energy_mode",
            "Energy Mode (Current)",
            "sensors/energy_mode",
            EnumType::EnergyMode,
            json!({ "icon": "mdi:leaf" }),
        ),
        binary(
            "summer_mode_active",
            "Summer Mode Active",
            "binary_sensors/summer_mode",
            json!({ "icon": "mdi:weather-sunny" }),
        ),
        hours(
            "operating_hours_circuit_pump",
            "Circuit Pump Operating Hours",
            "sensors/circuit_pump_hours",
        ),
        control(
            "set_hot_water_setpoint_constant",
            "Hot Water Setpoint",
            "controls/hot_water_setpoint",
            Component::Number,
            WriteTarget::HotWaterSetpoint,
            Some("hot_water_setpoint_constant"),
            number_metadata(DHW_SETPOINT_RANGE, 0.5, "°C", Some("temperature")),
        ),
        control(
            "set_hot_water_single_charge_active",
            "One-Time Heating",
            "controls/one_time_heating",
            Component::Button,
            WriteTarget::HotWaterSingleCharge,
            None,
            json!({ "icon": "mdi:water-boiler" }),
        ),
        Attribute {
            enum_type: Some(EnumType::SeasonSelection),
            ..control(
                "set_season_selection_manual",
                "Season Selection",
                "controls/season_selection",
                Component::Select,
                WriteTarget::SeasonSelection,
                Some("season_selection_manual"),
                json!({ "icon": "mdi:calendar-range" }),
            )
        },
        Attribute {
            enum_type: Some(EnumType::EnergyMode),
            ..control(
                "set_heating_circuit_energy_mode",
                "Energy Mode",
                "controls/energy_mode",
                Component::Select,
                WriteTarget::EnergyMode,
                Some("heating_circuit_energy_mode"),
                json!({ "icon": "mdi:leaf" }),
            )
        },
        control(
            "set_heating_curve_offset",
            "Heating Curve Offset",
            "controls/heating_curve_offset",
            Component::Number,
            WriteTarget::HeatingCurveOffset,
            Some("heating_curve_offset"),
            number_metadata(HEATING_CURVE_OFFSET_RANGE, 0.5, "K", None),
        ),
        control(
            "set_season_threshold_heating_limit",
            "Heating Limit Temperature",
            "controls/season_threshold",
            Component::Number,
            WriteTarget::SeasonThresholdHeatingLimit,
            Some("season_threshold_heating_limit"),
            number_metadata(SEASON_THRESHOLD_RANGE, 0.5, "°C", Some("temperature")),
        ),
    ]
});

/// Attribute table for a device type.
pub fn attributes_for(device_type: DeviceType) -> &'static [Attribute] {
    match device_type {
        DeviceType::HeatPump => HEAT_PUMP_ATTRIBUTES.as_slice(),
        DeviceType::StorageHeating | DeviceType::StorageDhw => STORAGE_ATTRIBUTES.as_slice(),
    }
}

/// Writable attribute by control name, across all tables.
pub fn find_control(name: &str) -> Option<&'static Attribute> {
    HEAT_PUMP_ATTRIBUTES
        .iter()
        .chain(STORAGE_ATTRIBUTES.iter())
        .find(|a| a.writable() && a.object_id() == name)
}

/// Names of every control, sorted.
pub fn control_names() -> Vec<&'static str> {
    let mut names: Vec<_> = HEAT_PUMP_ATTRIBUTES
        .iter()
        .chain(STORAGE_ATTRIBUTES.iter())
        .filter(|a| a.writable())
        .map(Attribute::object_id)
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_unique_per_table() {
        for device_type in DeviceType::ALL {
            let attributes = attributes_for(device_type);
            let keys: HashSet<_> = attributes.iter().map(|a| a.key).collect();
            assert_eq!(keys.len(), attributes.len(), "{}", device_type);
        }
    }

    #[test]
    fn test_component_matches_write_target() {
        for attribute in HEAT_PUMP_ATTRIBUTES.iter().chain(STORAGE_ATTRIBUTES.iter()) {
            assert_eq!(
                attribute.writable(),
                attribute.component.is_control(),
                "{}",
                attribute.key
            );
            if attribute.component == Component::Select {
                assert!(attribute.enum_type.is_some(), "{}", attribute.key);
            }
        }
    }

    #[test]
    fn test_state_keys_resolve_to_readable_attributes() {
        for attribute in STORAGE_ATTRIBUTES.iter().filter(|a| a.writable()) {
            if let Some(state_key) = attribute.state_key {
                let mirror = STORAGE_ATTRIBUTES.iter().find(|a| a.key == state_key).unwrap();
                assert!(!mirror.writable());
            }
        }
    }

    #[test]
    fn test_control_names() {
        assert_eq!(
            control_names(),
            vec![
                "energy_mode",
                "heating_curve_offset",
                "hot_water_setpoint",
                "one_time_heating",
                "season_selection",
                "season_threshold",
            ]
        );
        assert_eq!(
            find_control("one_time_heating").and_then(|a| a.write),
            Some(WriteTarget::HotWaterSingleCharge)
        );
    }

    #[test]
    fn test_heat_pump_has_no_controls() {
        assert!(HEAT_PUMP_ATTRIBUTES.iter().all(|a| !a.writable()));
    }
}
