//! Logical devices and the device registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use kermi_common::TopicBuilder;
use kermi_common::topic::{availability_topic, command_topic, state_topic};

use crate::client::{DeviceType, WriteTarget};
use crate::enums::EnumType;
use crate::mappings;

/// Bus-facing component kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Measurement.
    Sensor,
    /// Binary measurement.
    BinarySensor,
    /// Numeric control.
    Number,
    /// Enumerated control.
    Select,
    /// Momentary control.
    Button,
}

impl Component {
    /// Home Assistant component name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
            Component::Number => "number",
            Component::Select => "select",
            Component::Button => "button",
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Component::Number | Component::Select | Component::Button)
    }
}

/// One mapped value of a device type.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Bulk-read key.
    pub key: &'static str,
    /// Human label.
    pub label: &'static str,
    /// Topic suffix below the device namespace.
    pub topic_suffix: &'static str,
    pub component: Component,
    pub enum_type: Option<EnumType>,
    /// Write target; `Some` exactly for writable attributes.
    pub write: Option<WriteTarget>,
    /// Readable attribute mirroring this control's state.
    pub state_key: Option<&'static str>,
    /// Presentation metadata, passed through to discovery verbatim.
    pub metadata: serde_json::Value,
}

impl Attribute {
    pub fn writable(&self) -> bool {
        self.write.is_some()
    }

    /// Last topic level, used as control name and discovery object id.
    pub fn object_id(&self) -> &'static str {
        self.topic_suffix
            .rsplit('/')
            .next()
            .unwrap_or(self.topic_suffix)
    }
}

/// A Modbus unit wrapped with bus metadata.
#[derive(Debug, Clone)]
pub struct LogicalDevice {
    /// `{base_id}_{type}`.
    pub id: String,
    pub device_type: DeviceType,
    pub unit_id: u8,
    /// `{base_topic}/{base_id}/{type}`.
    pub namespace: String,
    pub available: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub attributes: &'static [Attribute],
}

impl LogicalDevice {
    pub fn state_topic(&self, attribute: &Attribute) -> String {
        state_topic(&self.namespace, attribute.topic_suffix)
    }

    pub fn availability_topic(&self) -> String {
        availability_topic(&self.namespace)
    }

    pub fn command_topic(&self, attribute: &Attribute) -> String {
        command_topic(&self.namespace, attribute.object_id())
    }

    /// Readable attribute by bulk-read key.
    pub fn attribute(&self, key: &str) -> Option<&'static Attribute> {
        self.attributes.iter().find(|a| a.key == key)
    }

    /// Writable attribute by control name.
    pub fn control(&self, name: &str) -> Option<&'static Attribute> {
        self.attributes
            .iter()
            .find(|a| a.writable() && a.object_id() == name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Devices have already been discovered")]
    AlreadyDiscovered,
}

/// In-memory list of discovered devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    topics: TopicBuilder,
    devices: Vec<LogicalDevice>,
    discovered: bool,
}

impl DeviceRegistry {
    pub fn new(topics: TopicBuilder) -> Self {
        Self {
            topics,
            devices: Vec::new(),
            discovered: false,
        }
    }

    /// Create one device per present unit. May be called once.
    pub fn discover(&mut self, units: &[(DeviceType, u8)]) -> Result<usize, DiscoveryError> {
        if self.discovered {
            return Err(DiscoveryError::AlreadyDiscovered);
        }
        self.discovered = true;

        for (device_type, unit_id) in units {
            let device = LogicalDevice {
                id: format!("{}_{}", self.topics.device_id(), device_type.as_str()),
                device_type: *device_type,
                unit_id: *unit_id,
                namespace: self.topics.namespace(device_type.as_str()),
                available: true,
                last_poll: None,
                attributes: mappings::attributes_for(*device_type),
            };

            tracing::info!(
                device = %device.id,
                unit = unit_id,
                attributes = device.attributes.len(),
                "Discovered device"
            );
            self.devices.push(device);
        }

        tracing::info!(count = self.devices.len(), "Discovery complete");
        Ok(self.devices.len())
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Bridge-level base identifier.
    pub fn base_id(&self) -> &str {
        self.topics.device_id()
    }

    pub fn devices(&self) -> &[LogicalDevice] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [LogicalDevice] {
        &mut self.devices
    }

    pub fn by_namespace(&self, namespace: &str) -> Option<&LogicalDevice> {
        self.devices.iter().find(|d| d.namespace == namespace)
    }

    pub fn all_available(&self) -> bool {
        self.devices.iter().all(|d| d.available)
    }

    pub fn set_available(&mut self, available: bool) {
        for device in &mut self.devices {
            device.available = available;
        }
    }
}
