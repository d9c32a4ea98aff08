//! Topic builders and parsers.
//!
//! Topics follow the pattern:
//!
//! ```text
//! <base_topic>/<device_id>/<device_type>/<suffix>
//! ```
//!
//! where `<suffix>` is an attribute suffix (`sensors/outdoor_temp`),
//! `availability`, or a command (`controls/<name>/set`).

use crate::error::{Error, Result};

/// Segment separating a device namespace from a control name.
const CONTROLS_SEGMENT: &str = "/controls/";

/// Suffix of command topics.
const SET_SUFFIX: &str = "/set";

/// Replace characters that are unsafe inside a single topic level.
///
/// # Example
/// ```
/// use kermi_common::topic::sanitize_segment;
///
/// assert_eq!(sanitize_segment("192.168.1.20:502"), "192_168_1_20_502");
/// ```
pub fn sanitize_segment(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '.' | ':' | '/' | '+' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Builder for the topics of one bridge instance.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    base_topic: String,
    device_id: String,
}

impl TopicBuilder {
    /// Create a builder for `<base_topic>/<device_id>`.
    pub fn new(base_topic: impl Into<String>, device_id: impl Into<String>) -> Result<Self> {
        let base_topic = base_topic.into().trim_end_matches('/').to_string();
        let device_id = device_id.into();

        if base_topic.is_empty() {
            return Err(Error::Topic("base topic cannot be empty".to_string()));
        }
        if base_topic.contains(['+', '#']) {
            return Err(Error::Topic(format!(
                "base topic '{}' must not contain wildcards",
                base_topic
            )));
        }
        if device_id.is_empty() || device_id != sanitize_segment(&device_id) {
            return Err(Error::Topic(format!(
                "device id '{}' is not a valid topic level",
                device_id
            )));
        }

        Ok(Self {
            base_topic,
            device_id,
        })
    }

    /// The bridge-level base identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The configured base topic.
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// Topic namespace for one device type.
    ///
    /// # Example
    /// ```
    /// use kermi_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("kermi", "xcenter").unwrap();
    /// assert_eq!(topics.namespace("heat_pump"), "kermi/xcenter/heat_pump");
    /// ```
    pub fn namespace(&self, device_type: &str) -> String {
        format!("{}/{}/{}", self.base_topic, self.device_id, device_type)
    }

    /// Subscription pattern matching every command topic of this bridge.
    ///
    /// # Example
    /// ```
    /// use kermi_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("kermi", "xcenter").unwrap();
    /// assert_eq!(topics.command_wildcard(), "kermi/xcenter/+/controls/+/set");
    /// ```
    pub fn command_wildcard(&self) -> String {
        format!("{}/{}/+/controls/+/set", self.base_topic, self.device_id)
    }

    /// Topic of the retained bridge status document.
    pub fn status_topic(&self) -> String {
        format!("{}/{}/status", self.base_topic, self.device_id)
    }
}

/// State topic for an attribute of a device namespace.
pub fn state_topic(namespace: &str, suffix: &str) -> String {
    format!("{}/{}", namespace, suffix)
}

/// Availability topic of a device namespace.
pub fn availability_topic(namespace: &str) -> String {
    format!("{}/availability", namespace)
}

/// Command topic for a control of a device namespace.
pub fn command_topic(namespace: &str, control: &str) -> String {
    format!("{}{}{}{}", namespace, CONTROLS_SEGMENT, control, SET_SUFFIX)
}

/// Topic receiving failures for a command topic.
pub fn error_topic(command_topic: &str) -> String {
    format!("{}/error", command_topic)
}

/// A command topic split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    /// Device namespace (`<base>/<device_id>/<device_type>`).
    pub namespace: String,
    /// Control name.
    pub control: String,
}

/// Parse a command topic of the form `<namespace>/controls/<name>/set`.
///
/// Returns `None` for anything else, including error topics and topics with
/// extra levels after the control name.
///
/// # Example
/// ```
/// use kermi_common::topic::parse_command_topic;
///
/// let parsed = parse_command_topic("kermi/xcenter/storage_dhw/controls/hot_water_setpoint/set").unwrap();
/// assert_eq!(parsed.namespace, "kermi/xcenter/storage_dhw");
/// assert_eq!(parsed.control, "hot_water_setpoint");
/// ```
pub fn parse_command_topic(topic: &str) -> Option<CommandTopic> {
    let head = topic.strip_suffix(SET_SUFFIX)?;
    let split = head.rfind(CONTROLS_SEGMENT)?;
    let namespace = &head[..split];
    let control = &head[split + CONTROLS_SEGMENT.len()..];

    if namespace.is_empty() || control.is_empty() || control.contains('/') {
        return None;
    }

    Some(CommandTopic {
        namespace: namespace.to_string(),
        control: control.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("192.168.1.20"), "192_168_1_20");
        assert_eq!(sanitize_segment("/dev/ttyUSB0"), "_dev_ttyUSB0");
        assert_eq!(sanitize_segment("a+b#c d"), "a_b_c_d");
        assert_eq!(sanitize_segment("xcenter"), "xcenter");
    }

    #[test]
    fn test_builder_topics() {
        let topics = TopicBuilder::new("kermi/", "xcenter").unwrap();
        let ns = topics.namespace("storage_dhw");

        assert_eq!(topics.base_topic(), "kermi");
        assert_eq!(ns, "kermi/xcenter/storage_dhw");
        assert_eq!(
            state_topic(&ns, "sensors/hot_water_actual"),
            "kermi/xcenter/storage_dhw/sensors/hot_water_actual"
        );
        assert_eq!(availability_topic(&ns), "kermi/xcenter/storage_dhw/availability");
        assert_eq!(
            command_topic(&ns, "hot_water_setpoint"),
            "kermi/xcenter/storage_dhw/controls/hot_water_setpoint/set"
        );
        assert_eq!(topics.status_topic(), "kermi/xcenter/status");
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(TopicBuilder::new("", "xcenter").is_err());
        assert!(TopicBuilder::new("kermi/#", "xcenter").is_err());
        assert!(TopicBuilder::new("kermi", "x.center").is_err());
        assert!(TopicBuilder::new("kermi", "").is_err());
    }

    #[test]
    fn test_parse_command_topic_roundtrip() {
        let topic = command_topic("kermi/xcenter/storage_heating", "energy_mode");
        let parsed = parse_command_topic(&topic).unwrap();
        assert_eq!(parsed.namespace, "kermi/xcenter/storage_heating");
        assert_eq!(parsed.control, "energy_mode");
    }

    #[test]
    fn test_parse_command_topic_rejects_malformed() {
        assert!(parse_command_topic("kermi/xcenter/heat_pump/sensors/outdoor_temp").is_none());
        assert!(parse_command_topic("kermi/xcenter/heat_pump/controls//set").is_none());
        assert!(parse_command_topic("controls/x/set").is_none());
        assert!(parse_command_topic("kermi/xcenter/heat_pump/controls/a/b/set").is_none());
        assert!(parse_command_topic("kermi/xcenter/heat_pump/controls/a/set/error").is_none());
    }

    #[test]
    fn test_error_topic() {
        assert_eq!(
            error_topic("kermi/x/storage_dhw/controls/hot_water_setpoint/set"),
            "kermi/x/storage_dhw/controls/hot_water_setpoint/set/error"
        );
    }
}
