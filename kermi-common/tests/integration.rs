//! Integration tests for kermi-common library.

use kermi_common::topic::{availability_topic, command_topic, error_topic, state_topic};
use kermi_common::{MqttConfig, TopicBuilder, parse_command_topic, parse_config, sanitize_segment};
use serde::Deserialize;

#[test]
fn test_topic_layout_for_derived_device_id() {
    // A device id derived from the Modbus endpoint address
    let device_id = sanitize_segment("192.168.1.20");
    let topics = TopicBuilder::new("kermi", device_id).expect("valid topics");

    let ns = topics.namespace("heat_pump");
    assert_eq!(ns, "kermi/192_168_1_20/heat_pump");
    assert_eq!(
        state_topic(&ns, "sensors/outdoor_temp"),
        "kermi/192_168_1_20/heat_pump/sensors/outdoor_temp"
    );
    assert_eq!(
        availability_topic(&ns),
        "kermi/192_168_1_20/heat_pump/availability"
    );
    assert_eq!(
        topics.command_wildcard(),
        "kermi/192_168_1_20/+/controls/+/set"
    );
}

#[test]
fn test_command_and_error_topics_parse_back() {
    let topics = TopicBuilder::new("home/kermi", "xcenter").unwrap();
    let ns = topics.namespace("storage_dhw");
    let command = command_topic(&ns, "one_time_heating");

    let parsed = parse_command_topic(&command).expect("command topic parses");
    assert_eq!(parsed.namespace, ns);
    assert_eq!(parsed.control, "one_time_heating");

    // The error topic must never be mistaken for a command
    assert!(parse_command_topic(&error_topic(&command)).is_none());
}

#[test]
fn test_parse_mqtt_section_from_bridge_config() {
    #[derive(Deserialize)]
    struct Partial {
        mqtt: MqttConfig,
    }

    let partial: Partial = parse_config(
        r#"{
            // comments are allowed in JSON5
            mqtt: { host: "10.0.0.2", port: 8883, tls: { enabled: true } },
        }"#,
    )
    .expect("parse");

    assert_eq!(partial.mqtt.broker_addr(), "10.0.0.2:8883");
    assert!(partial.mqtt.tls.enabled);
    assert!(partial.mqtt.validate().is_ok());
}
