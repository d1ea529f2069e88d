//! Main decoder API
//!
//! The [`Decoder`] is stateful: declarations seen in earlier records are kept
//! so that later references (which carry only an id and a value) can be
//! resolved to a fully described [`Property`]. One decoder instance belongs to
//! one node session.

use crate::capture::{CaptureError, CaptureReader, CaptureRecord};
use crate::config::DecoderConfig;
use crate::declarations::{Declaration, DeclarationStats, Declarations, PropertyTable};
use crate::event::{Event, EventKind};
use crate::types::{hex_string, DecodeError, Property, PropertyValue, Result, Timestamp};
use crate::units::{DataType, Unit, UnitPrefix};
use byteorder::{ByteOrder, LittleEndian};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::io::Read;

/// Field-by-field reader over one record body
struct Fields<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8]> {
        let available = self.buf.len().saturating_sub(self.offset);
        if available < len {
            return Err(DecodeError::Truncated {
                field,
                offset: self.offset,
                needed: len,
                available,
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, field)?))
    }

    fn ascii(&mut self, len: usize, field: &'static str) -> Result<String> {
        let bytes = self.take(len, field)?;
        if !bytes.is_ascii() {
            return Err(DecodeError::NonAscii { field });
        }
        // ASCII is valid UTF-8
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    fn value(&mut self, data_type: DataType, len: usize) -> Result<PropertyValue> {
        const FIELD: &str = "property value";
        let value = match data_type {
            DataType::Bool => PropertyValue::Bool(self.u8(FIELD)? != 0),
            DataType::I8 => PropertyValue::I8(self.u8(FIELD)? as i8),
            DataType::I16 => PropertyValue::I16(LittleEndian::read_i16(self.take(2, FIELD)?)),
            DataType::I32 => PropertyValue::I32(LittleEndian::read_i32(self.take(4, FIELD)?)),
            DataType::I64 => PropertyValue::I64(LittleEndian::read_i64(self.take(8, FIELD)?)),
            DataType::U8 => PropertyValue::U8(self.u8(FIELD)?),
            DataType::U16 => PropertyValue::U16(self.u16(FIELD)?),
            DataType::U32 => PropertyValue::U32(LittleEndian::read_u32(self.take(4, FIELD)?)),
            DataType::U64 => PropertyValue::U64(LittleEndian::read_u64(self.take(8, FIELD)?)),
            DataType::F32 => PropertyValue::F32(LittleEndian::read_f32(self.take(4, FIELD)?)),
            DataType::F64 => PropertyValue::F64(LittleEndian::read_f64(self.take(8, FIELD)?)),
            DataType::AsciiArray => PropertyValue::Ascii(self.ascii(len, FIELD)?),
            DataType::ByteArray => PropertyValue::Bytes(self.take(len, FIELD)?.to_vec()),
            DataType::Invalid => PropertyValue::Invalid(self.take(len, FIELD)?.to_vec()),
            DataType::F32Array => {
                if len % 4 != 0 {
                    return Err(DecodeError::InvalidArrayLength { data_type, len });
                }
                let bytes = self.take(len, FIELD)?;
                let mut values = vec![0f32; len / 4];
                LittleEndian::read_f32_into(bytes, &mut values);
                PropertyValue::F32Array(values)
            }
            DataType::F64Array => {
                if len % 8 != 0 {
                    return Err(DecodeError::InvalidArrayLength { data_type, len });
                }
                let bytes = self.take(len, FIELD)?;
                let mut values = vec![0f64; len / 8];
                LittleEndian::read_f64_into(bytes, &mut values);
                PropertyValue::F64Array(values)
            }
        };
        Ok(value)
    }

    fn declaration(&mut self) -> Result<Property> {
        let id = self.u8("property id")?;
        let prefix = UnitPrefix::try_from(self.u8("unit prefix")?)?;
        let unit = Unit::try_from(self.u8("unit")?)?;
        let data_type = DataType::try_from(self.u8("data type")?)?;
        let name_len = self.u8("name length")? as usize;
        let value_len = self.u16("value length")? as usize;
        let name = self.ascii(name_len, "property name")?;
        let value = self.value(data_type, value_len)?;
        Ok(Property {
            id,
            name,
            prefix,
            unit,
            value,
        })
    }

    fn reference(&mut self, table: &PropertyTable) -> Result<Property> {
        let id = self.u8("property id")?;
        let value_len = self.u16("value length")? as usize;
        let declaration = table.get(id)?;
        let value = self.value(declaration.data_type, value_len)?;
        Ok(Property {
            id,
            name: declaration.name.clone(),
            prefix: declaration.prefix,
            unit: declaration.unit,
            value,
        })
    }

    fn declarations(&mut self, count: u8) -> Result<Vec<Property>> {
        (0..count).map(|_| self.declaration()).collect()
    }

    fn references(&mut self, count: u8, table: &PropertyTable) -> Result<Vec<Property>> {
        (0..count).map(|_| self.reference(table)).collect()
    }

    fn data(&mut self) -> Result<Vec<u8>> {
        let len = self.u16("data length")? as usize;
        Ok(self.take(len, "frame data")?.to_vec())
    }
}

/// Decode one property declaration starting at `offset`
///
/// # Returns
/// * The declared property and the offset just past it
pub fn decode_declaration(buf: &[u8], offset: usize) -> Result<(Property, usize)> {
    let mut fields = Fields::new(buf, offset);
    let property = fields.declaration()?;
    Ok((property, fields.offset))
}

/// Decode one property reference starting at `offset`, resolved against `table`
///
/// # Returns
/// * The referenced property with its declared metadata and the offset just past it
pub fn decode_reference(buf: &[u8], offset: usize, table: &PropertyTable) -> Result<(Property, usize)> {
    let mut fields = Fields::new(buf, offset);
    let property = fields.reference(table)?;
    Ok((property, fields.offset))
}

fn declare_all(table: &mut PropertyTable, properties: &[Property]) {
    for property in properties {
        table.declare(property.id, Declaration::from(property));
    }
}

/// A successfully decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Position of the record in the current session
    pub record_id: u64,
    pub timestamp: Timestamp,
    pub node_id: u32,
    pub event: Event,
    /// Name of the addressed entity, when the event has one
    pub entity_name: Option<String>,
}

struct PropertyMap<'a>(&'a [Property]);

impl Serialize for PropertyMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Entry<'a> {
            value: &'a PropertyValue,
            prefix: UnitPrefix,
            unit: Unit,
        }

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for property in self.0 {
            map.serialize_entry(
                &property.name,
                &Entry {
                    value: &property.value,
                    prefix: property.prefix,
                    unit: property.unit,
                },
            )?;
        }
        map.end()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("nodeId", &self.node_id)?;
        map.serialize_entry("eventId", &self.event.kind())?;
        map.serialize_entry("recordId", &self.record_id)?;
        if let Some(name) = &self.entity_name {
            map.serialize_entry("entityId", name)?;
        }
        if let Some(link_id) = self.event.link_id() {
            map.serialize_entry("linkId", &link_id)?;
        }
        if let Some(frame_id) = self.event.frame_id() {
            map.serialize_entry("frameId", &frame_id)?;
        }
        if let Some(data) = self.event.data() {
            map.serialize_entry("data", &hex_string(data))?;
        }
        if let Event::LinkAdd {
            source_properties,
            target_properties,
            ..
        } = &self.event
        {
            map.serialize_entry("sourceProperties", &PropertyMap(source_properties))?;
            map.serialize_entry("targetProperties", &PropertyMap(target_properties))?;
        }
        map.serialize_entry("properties", &PropertyMap(self.event.properties()))?;
        map.end()
    }
}

/// Error-tagged stand-in for a record that failed to decode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    pub record_id: u64,
    #[serde(serialize_with = "serialize_error")]
    pub error: DecodeError,
}

fn serialize_error<S: Serializer>(error: &DecodeError, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Outcome of decoding one record: a record, or a report of why it failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedOutput {
    Record(Record),
    Error(ErrorRecord),
}

/// The stateful event decoder
pub struct Decoder {
    config: DecoderConfig,
    declarations: Declarations,
    record_id: u64,
}

impl Decoder {
    /// Create a decoder with the default configuration
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        let declarations = if config.current_monitor {
            Declarations::with_current_monitor()
        } else {
            Declarations::new()
        };
        Self {
            config,
            declarations,
            record_id: 0,
        }
    }

    /// Forget entity, link and frame declarations and restart record numbering
    ///
    /// Node-scoped declarations are kept for the lifetime of the decoder.
    pub fn reset(&mut self) {
        log::debug!("Resetting decoder ({} records decoded)", self.record_id);
        self.declarations.reset();
        self.record_id = 0;
    }

    pub fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    pub fn stats(&self) -> DeclarationStats {
        self.declarations.stats()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode one record: `node_id:u32 ++ event_id:u8 ++ body`
    ///
    /// A failed record still consumes a record id. Declarations introduced by
    /// a record only take effect once the whole record decoded successfully.
    pub fn decode(&mut self, timestamp: Timestamp, buffer: &[u8]) -> Result<Record> {
        let record_id = self.record_id;
        self.record_id += 1;
        let mut fields = Fields::new(buffer, 0);
        let node_id = LittleEndian::read_u32(fields.take(4, "node id")?);
        let kind = EventKind::try_from(fields.u8("event id")?)?;

        let event = self.decode_event(kind, &mut fields)?;
        let entity_name = self.entity_name(&event);
        self.apply(&event);

        log::trace!("Decoded {} from node {}", kind, node_id);
        Ok(Record {
            record_id,
            timestamp,
            node_id,
            event,
            entity_name,
        })
    }

    /// Decode one record, turning a failure into an error-tagged output
    pub fn decode_or_report(&mut self, timestamp: Timestamp, buffer: &[u8]) -> DecodedOutput {
        let record_id = self.record_id;
        match self.decode(timestamp, buffer) {
            Ok(record) => DecodedOutput::Record(record),
            Err(error) => {
                log::warn!("Failed to decode record {}: {}", record_id, error);
                let node_id = (buffer.len() >= 4).then(|| LittleEndian::read_u32(buffer));
                DecodedOutput::Error(ErrorRecord {
                    timestamp,
                    node_id,
                    record_id,
                    error,
                })
            }
        }
    }

    /// Decode every record of a capture stream
    ///
    /// Records that fail to decode are yielded as [`DecodedOutput::Error`] and
    /// decoding continues; only container-level failures end the stream.
    pub fn decode_capture<R: Read>(&mut self, reader: CaptureReader<R>) -> DecodingIterator<'_, CaptureReader<R>> {
        DecodingIterator::new(reader, self)
    }

    fn decode_event(&self, kind: EventKind, fields: &mut Fields<'_>) -> Result<Event> {
        let declarations = &self.declarations;
        let event = match kind {
            EventKind::NodeAdd => {
                let count = fields.u8("property count")?;
                Event::NodeAdd {
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::NodePropertyAdd => {
                let count = fields.u8("property count")?;
                Event::NodePropertyAdd {
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::NodePropertyUpdate => {
                let count = fields.u8("property count")?;
                Event::NodePropertyUpdate {
                    properties: fields.references(count, declarations.node())?,
                }
            }
            EventKind::NodeRemove => Event::NodeRemove,
            EventKind::EntityAdd => {
                let entity_id = fields.u8("entity id")?;
                let name_len = fields.u8("entity name length")? as usize;
                let count = fields.u8("property count")?;
                let name = fields.ascii(name_len, "entity name")?;
                Event::EntityAdd {
                    entity_id,
                    name,
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::EntityPropertyAdd => {
                let entity_id = fields.u8("entity id")?;
                let count = fields.u8("property count")?;
                declarations.entity(entity_id)?;
                Event::EntityPropertyAdd {
                    entity_id,
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::EntityPropertyUpdate => {
                let entity_id = fields.u8("entity id")?;
                let count = fields.u8("property count")?;
                let entity = declarations.entity(entity_id)?;
                Event::EntityPropertyUpdate {
                    entity_id,
                    properties: fields.references(count, &entity.properties)?,
                }
            }
            EventKind::EntityRemove => {
                let entity_id = fields.u8("entity id")?;
                declarations.entity(entity_id)?;
                Event::EntityRemove { entity_id }
            }
            EventKind::LinkAdd => {
                let entity_id = fields.u8("entity id")?;
                let link_id = fields.u8("link id")?;
                let source_count = fields.u8("source property count")?;
                let target_count = fields.u8("target property count")?;
                let count = fields.u8("property count")?;
                let entity = declarations.entity(entity_id)?;
                Event::LinkAdd {
                    entity_id,
                    link_id,
                    source_properties: fields.references(source_count, &entity.properties)?,
                    target_properties: fields.references(target_count, &entity.properties)?,
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::LinkPropertyAdd => {
                let entity_id = fields.u8("entity id")?;
                let link_id = fields.u8("link id")?;
                let count = fields.u8("property count")?;
                declarations.link(entity_id, link_id)?;
                Event::LinkPropertyAdd {
                    entity_id,
                    link_id,
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::LinkPropertyUpdate => {
                let entity_id = fields.u8("entity id")?;
                let link_id = fields.u8("link id")?;
                let count = fields.u8("property count")?;
                let link = declarations.link(entity_id, link_id)?;
                Event::LinkPropertyUpdate {
                    entity_id,
                    link_id,
                    properties: fields.references(count, link)?,
                }
            }
            EventKind::LinkRemove => {
                let entity_id = fields.u8("entity id")?;
                let link_id = fields.u8("link id")?;
                declarations.link(entity_id, link_id)?;
                Event::LinkRemove { entity_id, link_id }
            }
            EventKind::FrameProduce | EventKind::FrameRx => {
                let entity_id = fields.u8("entity id")?;
                let frame_id = fields.u8("frame id")?;
                declarations.entity(entity_id)?;
                let data_len = fields.u16("data length")? as usize;
                let count = fields.u8("property count")?;
                let data = fields.take(data_len, "frame data")?.to_vec();
                let properties = fields.declarations(count)?;
                if kind == EventKind::FrameProduce {
                    Event::FrameProduce {
                        entity_id,
                        frame_id,
                        data,
                        properties,
                    }
                } else {
                    Event::FrameRx {
                        entity_id,
                        frame_id,
                        data,
                        properties,
                    }
                }
            }
            EventKind::FramePropertyAdd => {
                let entity_id = fields.u8("entity id")?;
                let frame_id = fields.u8("frame id")?;
                let count = fields.u8("property count")?;
                declarations.entity(entity_id)?;
                declarations.require_frame(frame_id, entity_id)?;
                Event::FramePropertyAdd {
                    entity_id,
                    frame_id,
                    properties: fields.declarations(count)?,
                }
            }
            EventKind::FramePropertyUpdate => {
                let entity_id = fields.u8("entity id")?;
                let frame_id = fields.u8("frame id")?;
                let count = fields.u8("property count")?;
                declarations.entity(entity_id)?;
                let scope = declarations.frame(frame_id, entity_id)?;
                Event::FramePropertyUpdate {
                    entity_id,
                    frame_id,
                    properties: fields.references(count, scope)?,
                }
            }
            EventKind::FrameDataUpdate | EventKind::FrameTx | EventKind::FrameConsume => {
                let entity_id = fields.u8("entity id")?;
                let frame_id = fields.u8("frame id")?;
                declarations.entity(entity_id)?;
                declarations.require_frame(frame_id, entity_id)?;
                let data = fields.data()?;
                match kind {
                    EventKind::FrameDataUpdate => Event::FrameDataUpdate {
                        entity_id,
                        frame_id,
                        data,
                    },
                    EventKind::FrameTx => Event::FrameTx {
                        entity_id,
                        frame_id,
                        data,
                    },
                    _ => Event::FrameConsume {
                        entity_id,
                        frame_id,
                        data,
                    },
                }
            }
        };
        Ok(event)
    }

    fn entity_name(&self, event: &Event) -> Option<String> {
        match event {
            Event::EntityAdd { name, .. } => Some(name.clone()),
            other => other
                .entity_id()
                .and_then(|id| self.declarations.entity(id).ok())
                .map(|entity| entity.name.clone()),
        }
    }

    /// Commit the declarations carried by a decoded event
    fn apply(&mut self, event: &Event) {
        let declarations = &mut self.declarations;
        // Lookups below were validated while decoding, so failures are unreachable
        match event {
            Event::NodeAdd { properties } | Event::NodePropertyAdd { properties } => {
                declare_all(declarations.node_mut(), properties);
            }
            Event::NodeRemove => declarations.clear(),
            Event::EntityAdd {
                entity_id,
                name,
                properties,
            } => {
                let entity = declarations.add_entity(*entity_id, name.clone());
                declare_all(&mut entity.properties, properties);
            }
            Event::EntityPropertyAdd {
                entity_id,
                properties,
            } => {
                if let Ok(entity) = declarations.entity_mut(*entity_id) {
                    declare_all(&mut entity.properties, properties);
                }
            }
            Event::EntityRemove { entity_id } => {
                let _ = declarations.remove_entity(*entity_id);
            }
            Event::LinkAdd {
                entity_id,
                link_id,
                properties,
                ..
            } => {
                if let Ok(entity) = declarations.entity_mut(*entity_id) {
                    let mut table = PropertyTable::new();
                    declare_all(&mut table, properties);
                    entity.links.insert(*link_id, table);
                }
            }
            Event::LinkPropertyAdd {
                entity_id,
                link_id,
                properties,
            } => {
                if let Ok(table) = declarations.link_mut(*entity_id, *link_id) {
                    declare_all(table, properties);
                }
            }
            Event::LinkRemove { entity_id, link_id } => {
                let _ = declarations.remove_link(*entity_id, *link_id);
            }
            Event::FrameProduce {
                entity_id,
                frame_id,
                properties,
                ..
            }
            | Event::FrameRx {
                entity_id,
                frame_id,
                properties,
                ..
            } => {
                let scope = declarations.open_frame(*frame_id, *entity_id);
                declare_all(scope, properties);
            }
            Event::FramePropertyAdd {
                entity_id,
                frame_id,
                properties,
            } => {
                if let Ok(scope) = declarations.frame_scope_mut(*frame_id, *entity_id) {
                    declare_all(scope, properties);
                }
            }
            Event::FrameConsume {
                entity_id,
                frame_id,
                ..
            } => declarations.close_frame(*frame_id, *entity_id),
            Event::NodePropertyUpdate { .. }
            | Event::EntityPropertyUpdate { .. }
            | Event::LinkPropertyUpdate { .. }
            | Event::FramePropertyUpdate { .. }
            | Event::FrameDataUpdate { .. }
            | Event::FrameTx { .. } => {}
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator that decodes captured records into structured output
///
/// Records from nodes outside the configured filter are skipped.
pub struct DecodingIterator<'a, I>
where
    I: Iterator<Item = std::result::Result<CaptureRecord, CaptureError>>,
{
    records: I,
    decoder: &'a mut Decoder,
}

impl<'a, I> DecodingIterator<'a, I>
where
    I: Iterator<Item = std::result::Result<CaptureRecord, CaptureError>>,
{
    pub fn new(records: I, decoder: &'a mut Decoder) -> Self {
        Self { records, decoder }
    }
}

impl<I> Iterator for DecodingIterator<'_, I>
where
    I: Iterator<Item = std::result::Result<CaptureRecord, CaptureError>>,
{
    type Item = std::result::Result<DecodedOutput, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            if let Some(node_id) = record.node_id() {
                if !self.decoder.config().should_process_node(node_id) {
                    log::trace!("Skipping record from node {}", node_id);
                    continue;
                }
            }

            return Some(Ok(self
                .decoder
                .decode_or_report(record.timestamp(), &record.payload)));
        }
    }
}
