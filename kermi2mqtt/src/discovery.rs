//! Home Assistant MQTT discovery.
//!
//! Every published attribute gets a config document under
//! `{prefix}/{component}/{device_id}/{object_id}/config`. Storage units also
//! get one composite entity each (`climate` for heating, `water_heater` for
//! DHW) that folds the matching controls.

use serde_json::{Map, Value, json};

use kermi_bridge_framework::{Publisher, Result};

use crate::client::DeviceType;
use crate::device::{Attribute, Component, DeviceRegistry, LogicalDevice};
use crate::enums::EnumType;
use crate::filter;
use crate::safety::DHW_SETPOINT_RANGE;
use crate::transform::{PAYLOAD_OFF, PAYLOAD_ON, ValueTransformer};

/// Energy mode labels and the water heater modes they appear as.
const WATER_HEATER_MODES: &[(&str, &str)] = &[
    ("away", "off"),
    ("eco", "eco"),
    ("comfort", "performance"),
    ("boost", "high_demand"),
    ("custom", "heat_pump"),
];

/// Controls and mirror sensors replaced by the composite entity of a device.
fn folded(device: &LogicalDevice) -> &'static [&'static str] {
    match device.device_type {
        DeviceType::StorageHeating => &["season_selection", "energy_mode"],
        DeviceType::StorageDhw => &["hot_water_setpoint", "season_selection", "energy_mode"],
        DeviceType::HeatPump => &[],
    }
}

/// Whether an attribute gets its own discovery entity on `device`.
pub fn is_announced(device: &LogicalDevice, attribute: &Attribute) -> bool {
    !filter::is_excluded(device.device_type, attribute.key)
        && !folded(device).contains(&attribute.object_id())
}

fn device_block(base_id: &str) -> Value {
    json!({
        "identifiers": [format!("kermi_{}", base_id)],
        "name": "Kermi X-Center",
        "manufacturer": "Kermi",
        "model": "X-Center Heat Pump System",
    })
}

fn base_payload(device: &LogicalDevice, base_id: &str, name: &str, unique_id: String) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("name".into(), json!(name));
    payload.insert("unique_id".into(), json!(unique_id));
    payload.insert("availability_topic".into(), json!(device.availability_topic()));
    payload.insert("payload_available".into(), json!("online"));
    payload.insert("payload_not_available".into(), json!("offline"));
    payload.insert("device".into(), device_block(base_id));
    payload
}

fn attribute_topic(prefix: &str, device: &LogicalDevice, attribute: &Attribute) -> String {
    format!(
        "{}/{}/{}/{}/config",
        prefix,
        attribute.component.as_str(),
        device.id,
        attribute.object_id()
    )
}

fn composite_topic(prefix: &str, component: &str, device: &LogicalDevice) -> String {
    format!("{}/{}/{}/{}/config", prefix, component, device.id, component)
}

/// Config document of one attribute.
pub fn attribute_payload(
    device: &LogicalDevice,
    base_id: &str,
    attribute: &Attribute,
    transformer: &ValueTransformer,
) -> Value {
    let unique_id = format!("{}_{}", device.id, attribute.object_id());
    let mut payload = base_payload(device, base_id, attribute.label, unique_id);

    let mirror_topic = attribute
        .state_key
        .and_then(|key| device.attribute(key))
        .map(|mirror| device.state_topic(mirror));

    match attribute.component {
        Component::Sensor => {
            payload.insert("state_topic".into(), json!(device.state_topic(attribute)));
        }
        Component::BinarySensor => {
            payload.insert("state_topic".into(), json!(device.state_topic(attribute)));
            payload.insert("payload_on".into(), json!(PAYLOAD_ON));
            payload.insert("payload_off".into(), json!(PAYLOAD_OFF));
        }
        Component::Number | Component::Select => {
            payload.insert("command_topic".into(), json!(device.command_topic(attribute)));
            if let Some(topic) = mirror_topic {
                payload.insert("state_topic".into(), json!(topic));
            }
            payload.insert("optimistic".into(), json!(false));
            if let Some(codec) = attribute.enum_type.and_then(|t| transformer.codec(t)) {
                payload.insert("options".into(), json!(codec.labels()));
            }
        }
        Component::Button => {
            payload.insert("command_topic".into(), json!(device.command_topic(attribute)));
            payload.insert("payload_press".into(), json!("1"));
        }
    }

    if let Value::Object(metadata) = &attribute.metadata {
        for (key, value) in metadata {
            payload.insert(key.clone(), value.clone());
        }
    }

    Value::Object(payload)
}

fn labels(transformer: &ValueTransformer, enum_type: EnumType) -> Vec<String> {
    transformer
        .codec(enum_type)
        .map(|codec| codec.labels().into_iter().map(String::from).collect())
        .unwrap_or_default()
}

fn topic_for(device: &LogicalDevice, key: &str) -> Option<String> {
    device.attribute(key).map(|a| device.state_topic(a))
}

fn command_for(device: &LogicalDevice, control: &str) -> Option<String> {
    device.control(control).map(|a| device.command_topic(a))
}

/// Config document of the floor heating climate entity.
pub fn climate_payload(device: &LogicalDevice, base_id: &str, transformer: &ValueTransformer) -> Value {
    let mut payload = base_payload(device, base_id, "Floor Heating", format!("{}_climate", device.id));

    let entries = [
        ("current_temperature_topic", topic_for(device, "heating_circuit_actual")),
        ("mode_command_topic", command_for(device, "season_selection")),
        ("mode_state_topic", topic_for(device, "season_selection_manual")),
        ("preset_mode_command_topic", command_for(device, "energy_mode")),
        ("preset_mode_state_topic", topic_for(device, "heating_circuit_energy_mode")),
        ("action_topic", topic_for(device, "heating_circuit_status")),
    ];
    for (key, topic) in entries {
        if let Some(topic) = topic {
            payload.insert(key.into(), json!(topic));
        }
    }

    payload.insert("modes".into(), json!(labels(transformer, EnumType::SeasonSelection)));
    payload.insert("preset_modes".into(), json!(labels(transformer, EnumType::EnergyMode)));
    payload.insert(
        "action_template".into(),
        json!(
            "{% set s = value | lower %}\
             {% if s in ['heating', 'heating_up'] %}heating\
             {% elif s in ['cooling', 'cooling_down'] %}cooling\
             {% elif s == 'off' %}off\
             {% else %}idle{% endif %}"
        ),
    );
    payload.insert("temperature_unit".into(), json!("C"));
    payload.insert("precision".into(), json!(0.1));

    Value::Object(payload)
}

fn mode_template(pairs: impl Iterator<Item = (&'static str, &'static str)>, fallback: &str) -> String {
    let entries: Vec<String> = pairs.map(|(from, to)| format!("'{}': '{}'", from, to)).collect();
    format!(
        "{{{{ {{{}}}.get(value | lower, '{}') }}}}",
        entries.join(", "),
        fallback
    )
}

/// Config document of the domestic hot water heater entity.
pub fn water_heater_payload(device: &LogicalDevice, base_id: &str) -> Value {
    let mut payload = base_payload(device, base_id, "Hot Water", format!("{}_water_heater", device.id));

    let entries = [
        ("current_temperature_topic", topic_for(device, "hot_water_actual")),
        ("temperature_command_topic", command_for(device, "hot_water_setpoint")),
        ("temperature_state_topic", topic_for(device, "hot_water_setpoint_constant")),
        ("mode_command_topic", command_for(device, "energy_mode")),
        ("mode_state_topic", topic_for(device, "heating_circuit_energy_mode")),
    ];
    for (key, topic) in entries {
        if let Some(topic) = topic {
            payload.insert(key.into(), json!(topic));
        }
    }

    let modes: Vec<&str> = WATER_HEATER_MODES.iter().map(|(_, mode)| *mode).collect();
    payload.insert("modes".into(), json!(modes));
    payload.insert(
        "mode_state_template".into(),
        json!(mode_template(WATER_HEATER_MODES.iter().copied(), "eco")),
    );
    payload.insert(
        "mode_command_template".into(),
        json!(mode_template(
            WATER_HEATER_MODES.iter().map(|(label, mode)| (*mode, *label)),
            "eco"
        )),
    );
    payload.insert("min_temp".into(), json!(DHW_SETPOINT_RANGE.0));
    payload.insert("max_temp".into(), json!(DHW_SETPOINT_RANGE.1));
    payload.insert("precision".into(), json!(0.5));
    payload.insert("temperature_unit".into(), json!("C"));

    Value::Object(payload)
}

/// All discovery documents for the registry, keyed by config topic.
pub fn discovery_messages(
    registry: &DeviceRegistry,
    transformer: &ValueTransformer,
    prefix: &str,
) -> Vec<(String, Value)> {
    let base_id = registry.base_id();
    let mut messages = Vec::new();

    for device in registry.devices() {
        for attribute in device.attributes.iter().filter(|a| is_announced(device, a)) {
            messages.push((
                attribute_topic(prefix, device, attribute),
                attribute_payload(device, base_id, attribute, transformer),
            ));
        }

        match device.device_type {
            DeviceType::StorageHeating => messages.push((
                composite_topic(prefix, "climate", device),
                climate_payload(device, base_id, transformer),
            )),
            DeviceType::StorageDhw => messages.push((
                composite_topic(prefix, "water_heater", device),
                water_heater_payload(device, base_id),
            )),
            DeviceType::HeatPump => {}
        }
    }

    messages
}

/// Every config topic this bridge may have announced, including skipped
/// attributes, so stale entities from older layouts are cleared too.
pub fn all_discovery_topics(registry: &DeviceRegistry, prefix: &str) -> Vec<String> {
    let mut topics = Vec::new();
    for device in registry.devices() {
        for attribute in device.attributes {
            topics.push(attribute_topic(prefix, device, attribute));
        }
        if device.device_type.is_storage() {
            topics.push(composite_topic(prefix, "climate", device));
            topics.push(composite_topic(prefix, "water_heater", device));
        }
    }
    topics
}

/// Publishes and removes discovery documents.
#[derive(Debug, Clone)]
pub struct DiscoveryPublisher {
    publisher: Publisher,
    prefix: String,
    retain: bool,
}

impl DiscoveryPublisher {
    pub fn new(publisher: Publisher, prefix: impl Into<String>, retain: bool) -> Self {
        Self {
            publisher,
            prefix: prefix.into(),
            retain,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Announce every entity. Returns the number of documents published.
    pub async fn publish_all(&self, registry: &DeviceRegistry, transformer: &ValueTransformer) -> Result<usize> {
        let messages = discovery_messages(registry, transformer, &self.prefix);
        for (topic, payload) in &messages {
            self.publisher.publish_json(topic, payload, self.retain).await?;
        }
        tracing::info!(count = messages.len(), prefix = %self.prefix, "Published discovery");
        Ok(messages.len())
    }

    /// Clear every entity by publishing empty retained documents.
    pub async fn remove_all(&self, registry: &DeviceRegistry) -> Result<usize> {
        let topics = all_discovery_topics(registry, &self.prefix);
        for topic in &topics {
            self.publisher.publish_retained(topic, "").await?;
        }
        tracing::info!(count = topics.len(), prefix = %self.prefix, "Removed discovery");
        Ok(topics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kermi_common::TopicBuilder;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(TopicBuilder::new("kermi", "xcenter").unwrap());
        registry
            .discover(&[
                (DeviceType::HeatPump, 40),
                (DeviceType::StorageHeating, 50),
                (DeviceType::StorageDhw, 51),
            ])
            .unwrap();
        registry
    }

    fn find<'a>(messages: &'a [(String, Value)], topic: &str) -> Option<&'a Value> {
        messages.iter().find(|(t, _)| t == topic).map(|(_, p)| p)
    }

    #[test]
    fn test_sensor_payload() {
        let transformer = ValueTransformer::new().unwrap();
        let messages = discovery_messages(&registry(), &transformer, "homeassistant");

        let outdoor = find(
            &messages,
            "homeassistant/sensor/xcenter_heat_pump/outdoor_temp/config",
        )
        .unwrap();
        assert_eq!(outdoor["unique_id"], "xcenter_heat_pump_outdoor_temp");
        assert_eq!(outdoor["state_topic"], "kermi/xcenter/heat_pump/sensors/outdoor_temp");
        assert_eq!(outdoor["availability_topic"], "kermi/xcenter/heat_pump/availability");
        assert_eq!(outdoor["device_class"], "temperature");
        assert_eq!(outdoor["device"]["identifiers"][0], "kermi_xcenter");
    }

    #[test]
    fn test_binary_and_button_payloads() {
        let transformer = ValueTransformer::new().unwrap();
        let messages = discovery_messages(&registry(), &transformer, "homeassistant");

        let alarm = find(
            &messages,
            "homeassistant/binary_sensor/xcenter_heat_pump/alarm/config",
        )
        .unwrap();
        assert_eq!(alarm["payload_on"], "ON");
        assert_eq!(alarm["payload_off"], "OFF");

        let button = find(
            &messages,
            "homeassistant/button/xcenter_storage_dhw/one_time_heating/config",
        )
        .unwrap();
        assert_eq!(button["payload_press"], "1");
        assert_eq!(
            button["command_topic"],
            "kermi/xcenter/storage_dhw/controls/one_time_heating/set"
        );
    }

    #[test]
    fn test_exclusive_and_folded_attributes_skipped() {
        let transformer = ValueTransformer::new().unwrap();
        let messages = discovery_messages(&registry(), &transformer, "ha");

        // Heating-only sensor never announced on DHW
        assert!(find(&messages, "ha/sensor/xcenter_storage_dhw/cooling_actual/config").is_none());
        assert!(find(&messages, "ha/sensor/xcenter_storage_heating/cooling_actual/config").is_some());

        // Folded into the climate entity
        assert!(find(&messages, "ha/select/xcenter_storage_heating/season_selection/config").is_none());
        assert!(find(&messages, "ha/sensor/xcenter_storage_heating/energy_mode/config").is_none());

        // Folded into the water heater
        assert!(find(&messages, "ha/number/xcenter_storage_dhw/hot_water_setpoint/config").is_none());
        assert!(find(&messages, "ha/sensor/xcenter_storage_dhw/energy_mode/config").is_none());

        // DHW runs without a season
        assert!(find(&messages, "ha/select/xcenter_storage_dhw/season_selection/config").is_none());
        assert!(!messages.iter().any(|(topic, _)| topic.starts_with("ha/select/")));
    }

    #[test]
    fn test_select_and_number_payloads() {
        let transformer = ValueTransformer::new().unwrap();
        let messages = discovery_messages(&registry(), &transformer, "ha");

        let registry = registry();
        let heating = registry
            .devices()
            .iter()
            .find(|d| d.device_type == DeviceType::StorageHeating)
            .unwrap();
        let season = attribute_payload(
            heating,
            registry.base_id(),
            heating.control("season_selection").unwrap(),
            &transformer,
        );
        assert_eq!(season["options"], json!(["auto", "heat", "cool", "off"]));
        assert_eq!(season["state_topic"], "kermi/xcenter/storage_heating/sensors/season_selection");
        assert_eq!(season["optimistic"], false);

        let offset = find(
            &messages,
            "ha/number/xcenter_storage_heating/heating_curve_offset/config",
        )
        .unwrap();
        assert_eq!(offset["min"], -5.0);
        assert_eq!(offset["max"], 5.0);
        assert_eq!(
            offset["state_topic"],
            "kermi/xcenter/storage_heating/sensors/heating_curve_offset"
        );
    }

    #[test]
    fn test_composites() {
        let transformer = ValueTransformer::new().unwrap();
        let messages = discovery_messages(&registry(), &transformer, "ha");

        let climate = find(&messages, "ha/climate/xcenter_storage_heating/climate/config").unwrap();
        assert_eq!(climate["unique_id"], "xcenter_storage_heating_climate");
        assert_eq!(
            climate["mode_command_topic"],
            "kermi/xcenter/storage_heating/controls/season_selection/set"
        );
        assert_eq!(climate["modes"], json!(["auto", "heat", "cool", "off"]));
        assert_eq!(
            climate["preset_modes"],
            json!(["away", "eco", "comfort", "boost", "custom"])
        );
        assert_eq!(
            climate["action_topic"],
            "kermi/xcenter/storage_heating/sensors/heating_circuit_status"
        );

        let heater = find(&messages, "ha/water_heater/xcenter_storage_dhw/water_heater/config").unwrap();
        assert_eq!(heater["min_temp"], 40.0);
        assert_eq!(heater["max_temp"], 60.0);
        assert_eq!(
            heater["temperature_state_topic"],
            "kermi/xcenter/storage_dhw/sensors/hot_water_setpoint_constant"
        );
        assert_eq!(
            heater["mode_state_template"],
            "{{ {'away': 'off', 'eco': 'eco', 'comfort': 'performance', 'boost': 'high_demand', 'custom': 'heat_pump'}.get(value | lower, 'eco') }}"
        );

        assert!(find(&messages, "ha/climate/xcenter_heat_pump/climate/config").is_none());
    }

    #[test]
    fn test_removal_covers_every_announced_topic() {
        let registry = registry();
        let transformer = ValueTransformer::new().unwrap();
        let removal = all_discovery_topics(&registry, "ha");

        for (topic, _) in discovery_messages(&registry, &transformer, "ha") {
            assert!(removal.contains(&topic), "{}", topic);
        }
    }
}
