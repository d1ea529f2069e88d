//! Core types for the SensorLab event codec
//!
//! This module defines the property value model shared by the encoder and the
//! decoder, the well-known node property identifiers, and the error types.

use crate::units::{DataType, Unit, UnitPrefix};
use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::fmt;

/// Timestamp type used throughout the codec
pub type Timestamp = DateTime<Utc>;

/// Result type for decoder operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Well-known node-scoped property identifiers
pub mod node_properties {
    pub const FIRMWARE: u8 = 0x00;
    pub const STATE: u8 = 0x01;
    pub const LATITUDE: u8 = 0x02;
    pub const LONGITUDE: u8 = 0x03;
    pub const ALTITUDE: u8 = 0x04;
    // Current monitor samples, pre-declared by every decoder
    pub const SHUNT_VOLTAGE: u8 = 0x05;
    pub const BUS_VOLTAGE: u8 = 0x06;
    pub const CURRENT: u8 = 0x07;
    pub const POWER: u8 = 0x08;
    pub const TIMESTAMP: u8 = 0x09;
}

/// Which table an unknown one-byte code was looked up in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeTable {
    DataType,
    Prefix,
    Unit,
}

impl fmt::Display for CodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeTable::DataType => write!(f, "data type"),
            CodeTable::Prefix => write!(f, "unit prefix"),
            CodeTable::Unit => write!(f, "unit"),
        }
    }
}

/// Scope an identifier failed to resolve in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScope {
    /// A property id, in whatever parent scope the record addressed
    Property,
    Entity,
    /// A link id within the given entity
    Link { entity_id: u8 },
    /// A frame id, optionally at a specific entity
    Frame { entity_id: u8 },
}

impl fmt::Display for IdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdScope::Property => write!(f, "property"),
            IdScope::Entity => write!(f, "entity"),
            IdScope::Link { entity_id } => write!(f, "link at entity {}", entity_id),
            IdScope::Frame { entity_id } => write!(f, "frame at entity {}", entity_id),
        }
    }
}

/// Errors that can occur while decoding a record
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("binary format invalid in {field}: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        field: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("non-ASCII character in {field}")]
    NonAscii { field: &'static str },

    #[error("unknown event ID: {0:#04x}")]
    UnknownEvent(u8),

    #[error("unknown {scope} ID: {id}")]
    UnknownId { scope: IdScope, id: u8 },

    #[error("unknown {table} code: {code:#04x}")]
    UnknownCode { table: CodeTable, code: u8 },

    #[error("invalid {data_type} length: {len} bytes")]
    InvalidArrayLength { data_type: DataType, len: usize },
}

/// Errors that can occur while encoding an event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("name too long: {0} bytes (max 255)")]
    NameTooLong(usize),

    #[error("value too long: {0} bytes (max 65535)")]
    ValueTooLong(usize),

    #[error("frame data too long: {0} bytes (max 65535)")]
    DataTooLong(usize),

    #[error("non-ASCII character in {0}")]
    NonAscii(&'static str),

    #[error("too many items in one record: {0} (max 255)")]
    TooManyItems(usize),
}

/// A typed property value; the variant determines the wire data type
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ascii(String),
    Bytes(Vec<u8>),
    /// Raw bytes carried without interpretation
    Invalid(Vec<u8>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
}

impl PropertyValue {
    pub fn data_type(&self) -> DataType {
        match self {
            PropertyValue::Bool(_) => DataType::Bool,
            PropertyValue::I8(_) => DataType::I8,
            PropertyValue::I16(_) => DataType::I16,
            PropertyValue::I32(_) => DataType::I32,
            PropertyValue::I64(_) => DataType::I64,
            PropertyValue::U8(_) => DataType::U8,
            PropertyValue::U16(_) => DataType::U16,
            PropertyValue::U32(_) => DataType::U32,
            PropertyValue::U64(_) => DataType::U64,
            PropertyValue::F32(_) => DataType::F32,
            PropertyValue::F64(_) => DataType::F64,
            PropertyValue::Ascii(_) => DataType::AsciiArray,
            PropertyValue::Bytes(_) => DataType::ByteArray,
            PropertyValue::Invalid(_) => DataType::Invalid,
            PropertyValue::F32Array(_) => DataType::F32Array,
            PropertyValue::F64Array(_) => DataType::F64Array,
        }
    }

    /// Length of the encoded value in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            PropertyValue::Ascii(s) => s.len(),
            PropertyValue::Bytes(b) | PropertyValue::Invalid(b) => b.len(),
            PropertyValue::F32Array(v) => v.len() * 4,
            PropertyValue::F64Array(v) => v.len() * 8,
            other => other.data_type().fixed_width().unwrap_or(0),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Ascii(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Ascii(value)
    }
}

/// Space-joined lowercase hex, the rendering used for raw byte payloads
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Bool(v) => serializer.serialize_bool(*v),
            PropertyValue::I8(v) => serializer.serialize_i8(*v),
            PropertyValue::I16(v) => serializer.serialize_i16(*v),
            PropertyValue::I32(v) => serializer.serialize_i32(*v),
            PropertyValue::I64(v) => serializer.serialize_i64(*v),
            PropertyValue::U8(v) => serializer.serialize_u8(*v),
            PropertyValue::U16(v) => serializer.serialize_u16(*v),
            PropertyValue::U32(v) => serializer.serialize_u32(*v),
            PropertyValue::U64(v) => serializer.serialize_u64(*v),
            PropertyValue::F32(v) => serializer.serialize_f32(*v),
            PropertyValue::F64(v) => serializer.serialize_f64(*v),
            PropertyValue::Ascii(v) => serializer.serialize_str(v),
            PropertyValue::Bytes(v) => serializer.serialize_str(&hex_string(v)),
            PropertyValue::Invalid(v) => serializer.serialize_str(&format!("!{}!", hex_string(v))),
            PropertyValue::F32Array(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for element in v {
                    seq.serialize_element(element)?;
                }
                seq.end()
            }
            PropertyValue::F64Array(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for element in v {
                    seq.serialize_element(element)?;
                }
                seq.end()
            }
        }
    }
}

/// A property with its full metadata
///
/// Declarations carry all of it on the wire. References carry only `id` and
/// `value`; the decoder fills in the rest from the matching declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub id: u8,
    pub name: String,
    pub prefix: UnitPrefix,
    pub unit: Unit,
    pub value: PropertyValue,
}

impl Property {
    /// Create a property without unit or prefix
    pub fn new(id: u8, name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            id,
            name: name.into(),
            prefix: UnitPrefix::None,
            unit: Unit::None,
            value,
        }
    }

    /// Builder method: set the unit and its magnitude prefix
    pub fn with_unit(mut self, prefix: UnitPrefix, unit: Unit) -> Self {
        self.prefix = prefix;
        self.unit = unit;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_lengths() {
        assert_eq!(PropertyValue::U64(1).encoded_len(), 8);
        assert_eq!(PropertyValue::Bool(true).encoded_len(), 1);
        assert_eq!(PropertyValue::from("abc").encoded_len(), 3);
        assert_eq!(PropertyValue::F32Array(vec![1.0, 2.0]).encoded_len(), 8);
        assert_eq!(PropertyValue::F64Array(vec![]).encoded_len(), 0);
    }

    #[test]
    fn test_value_rendering() {
        let bytes = serde_json::to_value(PropertyValue::Bytes(vec![0x0a, 0xff])).unwrap();
        assert_eq!(bytes, serde_json::json!("a ff"));

        let invalid = serde_json::to_value(PropertyValue::Invalid(vec![1, 2])).unwrap();
        assert_eq!(invalid, serde_json::json!("!1 2!"));

        let array = serde_json::to_value(PropertyValue::F32Array(vec![1.5])).unwrap();
        assert_eq!(array, serde_json::json!([1.5]));
    }

    #[test]
    fn test_error_messages() {
        let err = DecodeError::UnknownId {
            scope: IdScope::Link { entity_id: 3 },
            id: 7,
        };
        assert_eq!(err.to_string(), "unknown link at entity 3 ID: 7");
        assert_eq!(DecodeError::UnknownEvent(0x40).to_string(), "unknown event ID: 0x40");
    }
}
