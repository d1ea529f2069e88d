//! Event encoder
//!
//! One pure function per event kind, each building only the event-specific
//! body. The 5-byte record header (`node_id: u32`, `event_id: u8`) is added by
//! the caller, either with [`header`] or through [`Event::encode_record`].
//!
//! # Layout
//!
//! ```text
//! declaration: id:u8 prefix:u8 unit:u8 type:u8 name_len:u8 value_len:u16 name value
//! reference:   id:u8 value_len:u16 value
//! ```
//!
//! All multi-byte fields are little-endian.

use crate::event::{Event, EventKind};
use crate::types::{EncodeError, Property, PropertyValue};

type Result<T> = std::result::Result<T, EncodeError>;

/// Record header: node id followed by the event id
pub fn header(node_id: u32, kind: EventKind) -> [u8; 5] {
    let id = node_id.to_le_bytes();
    [id[0], id[1], id[2], id[3], kind as u8]
}

fn count(items: usize) -> Result<u8> {
    u8::try_from(items).map_err(|_| EncodeError::TooManyItems(items))
}

fn put_value(buf: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Bool(v) => buf.push(u8::from(*v)),
        PropertyValue::I8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::U8(v) => buf.push(*v),
        PropertyValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::Ascii(s) => buf.extend_from_slice(s.as_bytes()),
        PropertyValue::Bytes(b) | PropertyValue::Invalid(b) => buf.extend_from_slice(b),
        PropertyValue::F32Array(values) => {
            for v in values {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        PropertyValue::F64Array(values) => {
            for v in values {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

fn value_len(value: &PropertyValue) -> Result<u16> {
    if let PropertyValue::Ascii(s) = value {
        if !s.is_ascii() {
            return Err(EncodeError::NonAscii("property value"));
        }
    }
    let len = value.encoded_len();
    u16::try_from(len).map_err(|_| EncodeError::ValueTooLong(len))
}

fn put_declaration(buf: &mut Vec<u8>, property: &Property) -> Result<()> {
    if !property.name.is_ascii() {
        return Err(EncodeError::NonAscii("property name"));
    }
    let name_len = u8::try_from(property.name.len())
        .map_err(|_| EncodeError::NameTooLong(property.name.len()))?;
    let value_len = value_len(&property.value)?;

    buf.push(property.id);
    buf.push(property.prefix as u8);
    buf.push(property.unit as u8);
    buf.push(property.data_type() as u8);
    buf.push(name_len);
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(property.name.as_bytes());
    put_value(buf, &property.value);
    Ok(())
}

fn put_reference(buf: &mut Vec<u8>, property: &Property) -> Result<()> {
    let value_len = value_len(&property.value)?;
    buf.push(property.id);
    buf.extend_from_slice(&value_len.to_le_bytes());
    put_value(buf, &property.value);
    Ok(())
}

fn put_declarations(buf: &mut Vec<u8>, properties: &[Property]) -> Result<()> {
    properties.iter().try_for_each(|p| put_declaration(buf, p))
}

fn put_references(buf: &mut Vec<u8>, properties: &[Property]) -> Result<()> {
    properties.iter().try_for_each(|p| put_reference(buf, p))
}

fn data_len(data: &[u8]) -> Result<[u8; 2]> {
    u16::try_from(data.len())
        .map(u16::to_le_bytes)
        .map_err(|_| EncodeError::DataTooLong(data.len()))
}

/// Encode a single property declaration payload
pub fn declaration(property: &Property) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_declaration(&mut buf, property)?;
    Ok(buf)
}

/// Encode a single property reference payload
pub fn reference(property: &Property) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_reference(&mut buf, property)?;
    Ok(buf)
}

pub fn node_add(properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![count(properties.len())?];
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn node_property_add(properties: &[Property]) -> Result<Vec<u8>> {
    node_add(properties)
}

pub fn node_property_update(properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![count(properties.len())?];
    put_references(&mut buf, properties)?;
    Ok(buf)
}

pub fn node_remove() -> Vec<u8> {
    Vec::new()
}

pub fn entity_add(entity_id: u8, name: &str, properties: &[Property]) -> Result<Vec<u8>> {
    if !name.is_ascii() {
        return Err(EncodeError::NonAscii("entity name"));
    }
    let name_len = u8::try_from(name.len()).map_err(|_| EncodeError::NameTooLong(name.len()))?;
    let mut buf = vec![entity_id, name_len, count(properties.len())?];
    buf.extend_from_slice(name.as_bytes());
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn entity_property_add(entity_id: u8, properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, count(properties.len())?];
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn entity_property_update(entity_id: u8, properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, count(properties.len())?];
    put_references(&mut buf, properties)?;
    Ok(buf)
}

pub fn entity_remove(entity_id: u8) -> Vec<u8> {
    vec![entity_id]
}

/// Encode a LinkAdd body
///
/// Source and target properties are references to properties already
/// declared on the entity; `properties` are declarations scoped to the link.
pub fn link_add(
    entity_id: u8,
    link_id: u8,
    source_properties: &[Property],
    target_properties: &[Property],
    properties: &[Property],
) -> Result<Vec<u8>> {
    let mut buf = vec![
        entity_id,
        link_id,
        count(source_properties.len())?,
        count(target_properties.len())?,
        count(properties.len())?,
    ];
    put_references(&mut buf, source_properties)?;
    put_references(&mut buf, target_properties)?;
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn link_property_add(entity_id: u8, link_id: u8, properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, link_id, count(properties.len())?];
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn link_property_update(
    entity_id: u8,
    link_id: u8,
    properties: &[Property],
) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, link_id, count(properties.len())?];
    put_references(&mut buf, properties)?;
    Ok(buf)
}

pub fn link_remove(entity_id: u8, link_id: u8) -> Vec<u8> {
    vec![entity_id, link_id]
}

fn frame_with_declarations(
    entity_id: u8,
    frame_id: u8,
    data: &[u8],
    properties: &[Property],
) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, frame_id];
    buf.extend_from_slice(&data_len(data)?);
    buf.push(count(properties.len())?);
    buf.extend_from_slice(data);
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

fn frame_with_data(entity_id: u8, frame_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, frame_id];
    buf.extend_from_slice(&data_len(data)?);
    buf.extend_from_slice(data);
    Ok(buf)
}

pub fn frame_produce(
    entity_id: u8,
    frame_id: u8,
    data: &[u8],
    properties: &[Property],
) -> Result<Vec<u8>> {
    frame_with_declarations(entity_id, frame_id, data, properties)
}

pub fn frame_property_add(entity_id: u8, frame_id: u8, properties: &[Property]) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, frame_id, count(properties.len())?];
    put_declarations(&mut buf, properties)?;
    Ok(buf)
}

pub fn frame_property_update(
    entity_id: u8,
    frame_id: u8,
    properties: &[Property],
) -> Result<Vec<u8>> {
    let mut buf = vec![entity_id, frame_id, count(properties.len())?];
    put_references(&mut buf, properties)?;
    Ok(buf)
}

pub fn frame_data_update(entity_id: u8, frame_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    frame_with_data(entity_id, frame_id, data)
}

pub fn frame_tx(entity_id: u8, frame_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    frame_with_data(entity_id, frame_id, data)
}

pub fn frame_rx(
    entity_id: u8,
    frame_id: u8,
    data: &[u8],
    properties: &[Property],
) -> Result<Vec<u8>> {
    frame_with_declarations(entity_id, frame_id, data, properties)
}

pub fn frame_consume(entity_id: u8, frame_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    frame_with_data(entity_id, frame_id, data)
}

impl Event {
    /// Encode the event-specific body, without any id byte
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Event::NodeAdd { properties } => node_add(properties),
            Event::NodePropertyAdd { properties } => node_property_add(properties),
            Event::NodePropertyUpdate { properties } => node_property_update(properties),
            Event::NodeRemove => Ok(node_remove()),
            Event::EntityAdd {
                entity_id,
                name,
                properties,
            } => entity_add(*entity_id, name, properties),
            Event::EntityPropertyAdd {
                entity_id,
                properties,
            } => entity_property_add(*entity_id, properties),
            Event::EntityPropertyUpdate {
                entity_id,
                properties,
            } => entity_property_update(*entity_id, properties),
            Event::EntityRemove { entity_id } => Ok(entity_remove(*entity_id)),
            Event::LinkAdd {
                entity_id,
                link_id,
                source_properties,
                target_properties,
                properties,
            } => link_add(
                *entity_id,
                *link_id,
                source_properties,
                target_properties,
                properties,
            ),
            Event::LinkPropertyAdd {
                entity_id,
                link_id,
                properties,
            } => link_property_add(*entity_id, *link_id, properties),
            Event::LinkPropertyUpdate {
                entity_id,
                link_id,
                properties,
            } => link_property_update(*entity_id, *link_id, properties),
            Event::LinkRemove { entity_id, link_id } => Ok(link_remove(*entity_id, *link_id)),
            Event::FrameProduce {
                entity_id,
                frame_id,
                data,
                properties,
            } => frame_produce(*entity_id, *frame_id, data, properties),
            Event::FramePropertyAdd {
                entity_id,
                frame_id,
                properties,
            } => frame_property_add(*entity_id, *frame_id, properties),
            Event::FramePropertyUpdate {
                entity_id,
                frame_id,
                properties,
            } => frame_property_update(*entity_id, *frame_id, properties),
            Event::FrameDataUpdate {
                entity_id,
                frame_id,
                data,
            } => frame_data_update(*entity_id, *frame_id, data),
            Event::FrameTx {
                entity_id,
                frame_id,
                data,
            } => frame_tx(*entity_id, *frame_id, data),
            Event::FrameRx {
                entity_id,
                frame_id,
                data,
                properties,
            } => frame_rx(*entity_id, *frame_id, data, properties),
            Event::FrameConsume {
                entity_id,
                frame_id,
                data,
            } => frame_consume(*entity_id, *frame_id, data),
        }
    }

    /// Encode `event_id ++ body`, the form a node sends over its serial line
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Encode a complete record: `node_id ++ event_id ++ body`
    pub fn encode_record(&self, node_id: u32) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let mut buf = Vec::with_capacity(body.len() + 5);
        buf.extend_from_slice(&header(node_id, self.kind()));
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Unit, UnitPrefix};

    #[test]
    fn test_declaration_layout() {
        let property = Property::new(1, "state", PropertyValue::from("ready"))
            .with_unit(UnitPrefix::Milli, Unit::Volt);
        let bytes = declaration(&property).unwrap();

        assert_eq!(&bytes[..7], &[1, 0x0D, 0x10, 0x0B, 5, 5, 0]);
        assert_eq!(&bytes[7..12], b"state");
        assert_eq!(&bytes[12..], b"ready");
    }

    #[test]
    fn test_reference_layout() {
        let property = Property::new(7, "count", PropertyValue::U32(0x01020304));
        let bytes = reference(&property).unwrap();
        assert_eq!(bytes, vec![7, 4, 0, 4, 3, 2, 1]);
    }

    #[test]
    fn test_header_is_little_endian() {
        assert_eq!(header(0x0A0B0C0D, EventKind::FrameTx), [0x0D, 0x0C, 0x0B, 0x0A, 0x34]);
    }

    #[test]
    fn test_frame_produce_layout() {
        let body = frame_produce(3, 4, &[0xAA, 0xBB], &[]).unwrap();
        assert_eq!(body, vec![3, 4, 2, 0, 0, 0xAA, 0xBB]);
    }

    #[test]
    fn test_link_add_layout() {
        let src = Property::new(1, "a", PropertyValue::U8(9));
        let body = link_add(1, 2, &[src], &[], &[]).unwrap();
        assert_eq!(body, vec![1, 2, 1, 0, 0, 1, 1, 0, 9]);
    }

    #[test]
    fn test_encode_prefixes_event_id() {
        let event = Event::EntityRemove { entity_id: 5 };
        assert_eq!(event.encode().unwrap(), vec![0x13, 5]);
        assert_eq!(event.encode_record(1).unwrap(), vec![1, 0, 0, 0, 0x13, 5]);
    }

    #[test]
    fn test_encoder_rejects_oversized_fields() {
        let long_name = "n".repeat(256);
        let property = Property::new(0, long_name, PropertyValue::Bool(true));
        assert_eq!(declaration(&property), Err(EncodeError::NameTooLong(256)));

        let big = Property::new(0, "v", PropertyValue::Bytes(vec![0; 70_000]));
        assert_eq!(reference(&big), Err(EncodeError::ValueTooLong(70_000)));

        let non_ascii = Property::new(0, "température", PropertyValue::Bool(true));
        assert!(matches!(declaration(&non_ascii), Err(EncodeError::NonAscii(_))));

        let too_many = vec![Property::new(0, "x", PropertyValue::U8(0)); 256];
        assert_eq!(node_add(&too_many), Err(EncodeError::TooManyItems(256)));
    }
}
