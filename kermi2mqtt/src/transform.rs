//! Value transformation between register values and bus payloads.

use std::collections::HashMap;

use thiserror::Error;

use crate::client::RawValue;
use crate::device::{Attribute, Component};
use crate::enums::EnumType;

/// Payload for a true binary value.
pub const PAYLOAD_ON: &str = "ON";
/// Payload for a false binary value.
pub const PAYLOAD_OFF: &str = "OFF";

/// Errors from building codecs or decoding inbound payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("{enum_type}: rename for unknown member '{member}'")]
    UnknownRename { enum_type: EnumType, member: String },

    #[error("{enum_type}: label '{label}' used by both {first} and {second}")]
    Collision {
        enum_type: EnumType,
        label: String,
        first: String,
        second: String,
    },

    #[error("'{payload}' is not a valid {enum_type} value (expected one of: {expected})")]
    UnknownLabel {
        enum_type: EnumType,
        payload: String,
        expected: String,
    },

    #[error("No codec for {0}")]
    MissingCodec(EnumType),
}

/// Bidirectional mapping between codes and bus labels for one enumeration.
#[derive(Debug, Clone)]
pub struct EnumCodec {
    enum_type: EnumType,
    /// Labels in code order.
    labels: Vec<(u16, String)>,
    inverse: HashMap<String, u16>,
}

impl EnumCodec {
    /// Build the codec, rejecting renames of unknown members and labels
    /// shared by two members.
    pub fn build(enum_type: EnumType) -> Result<Self, TransformError> {
        let members = enum_type.members();

        for (member, _) in enum_type.renames() {
            if !members.iter().any(|(_, name)| name == member) {
                return Err(TransformError::UnknownRename {
                    enum_type,
                    member: member.to_string(),
                });
            }
        }

        let mut labels = Vec::with_capacity(members.len());
        let mut inverse: HashMap<String, u16> = HashMap::with_capacity(members.len());

        for (code, name) in members {
            let label = enum_type
                .renames()
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, label)| label.to_string())
                .unwrap_or_else(|| name.to_lowercase());

            if let Some(existing) = inverse.get(&label) {
                return Err(TransformError::Collision {
                    enum_type,
                    label,
                    first: enum_type.member(*existing).unwrap_or_default().to_string(),
                    second: name.to_string(),
                });
            }

            inverse.insert(label.clone(), *code);
            labels.push((*code, label));
        }

        Ok(Self {
            enum_type,
            labels,
            inverse,
        })
    }

    pub fn enum_type(&self) -> EnumType {
        self.enum_type
    }

    /// Bus label for a code.
    pub fn encode(&self, code: u16) -> Option<&str> {
        self.labels
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, label)| label.as_str())
    }

    /// Code for an inbound payload. Surrounding whitespace and case are ignored.
    pub fn decode(&self, payload: &str) -> Result<u16, TransformError> {
        let normalized = payload.trim().to_lowercase();
        self.inverse
            .get(&normalized)
            .copied()
            .ok_or_else(|| TransformError::UnknownLabel {
                enum_type: self.enum_type,
                payload: payload.trim().to_string(),
                expected: self.labels().join(", "),
            })
    }

    /// All labels in code order.
    pub fn labels(&self) -> Vec<&str> {
        self.labels.iter().map(|(_, l)| l.as_str()).collect()
    }
}

/// Maps register values to bus payloads and inbound payloads back to codes.
#[derive(Debug, Clone)]
pub struct ValueTransformer {
    codecs: HashMap<EnumType, EnumCodec>,
}

impl ValueTransformer {
    /// Build one codec per enumeration type. A failure here is a fatal
    /// configuration error.
    pub fn new() -> Result<Self, TransformError> {
        let mut codecs = HashMap::with_capacity(EnumType::ALL.len());
        for enum_type in EnumType::ALL {
            codecs.insert(enum_type, EnumCodec::build(enum_type)?);
        }
        Ok(Self { codecs })
    }

    pub fn codec(&self, enum_type: EnumType) -> Option<&EnumCodec> {
        self.codecs.get(&enum_type)
    }

    /// Bus payload for a raw value of `attribute`.
    ///
    /// Unknown enumeration codes fall back to the raw value's string form.
    pub fn encode(&self, attribute: &Attribute, value: &RawValue) -> String {
        if attribute.component == Component::BinarySensor {
            return if value.is_truthy() { PAYLOAD_ON } else { PAYLOAD_OFF }.to_string();
        }

        if let Some(enum_type) = attribute.enum_type {
            let label = value
                .as_code()
                .and_then(|code| self.codec(enum_type).and_then(|c| c.encode(code)));
            return match label {
                Some(label) => label.to_string(),
                None => {
                    tracing::warn!(
                        attribute = attribute.key,
                        enum_type = %enum_type,
                        value = %value,
                        "Unknown enumeration code"
                    );
                    value.to_string()
                }
            };
        }

        value.to_string()
    }

    /// Code for an inbound enumeration payload.
    pub fn decode(&self, enum_type: EnumType, payload: &str) -> Result<u16, TransformError> {
        self.codec(enum_type)
            .ok_or(TransformError::MissingCodec(enum_type))?
            .decode(payload)
    }
}
