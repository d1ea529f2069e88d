//! The 19 SensorLab event kinds
//!
//! An [`Event`] is the wire-level content of one record body. The same type is
//! produced by the decoder and consumed by the encoder, so a record survives a
//! round trip unchanged once the declarations it refers to are known.

use crate::types::{DecodeError, Property};
use serde::Serialize;
use std::fmt;

/// One-byte event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    NodeAdd = 0x00,
    NodePropertyAdd = 0x01,
    NodePropertyUpdate = 0x02,
    NodeRemove = 0x03,
    EntityAdd = 0x10,
    EntityPropertyAdd = 0x11,
    EntityPropertyUpdate = 0x12,
    EntityRemove = 0x13,
    LinkAdd = 0x20,
    LinkPropertyAdd = 0x21,
    LinkPropertyUpdate = 0x22,
    LinkRemove = 0x23,
    FrameProduce = 0x30,
    FramePropertyAdd = 0x31,
    FramePropertyUpdate = 0x32,
    FrameDataUpdate = 0x33,
    FrameTx = 0x34,
    FrameRx = 0x35,
    FrameConsume = 0x36,
}

impl EventKind {
    pub fn title(self) -> &'static str {
        match self {
            EventKind::NodeAdd => "NodeAdd",
            EventKind::NodePropertyAdd => "NodePropertyAdd",
            EventKind::NodePropertyUpdate => "NodePropertyUpdate",
            EventKind::NodeRemove => "NodeRemove",
            EventKind::EntityAdd => "EntityAdd",
            EventKind::EntityPropertyAdd => "EntityPropertyAdd",
            EventKind::EntityPropertyUpdate => "EntityPropertyUpdate",
            EventKind::EntityRemove => "EntityRemove",
            EventKind::LinkAdd => "LinkAdd",
            EventKind::LinkPropertyAdd => "LinkPropertyAdd",
            EventKind::LinkPropertyUpdate => "LinkPropertyUpdate",
            EventKind::LinkRemove => "LinkRemove",
            EventKind::FrameProduce => "FrameProduce",
            EventKind::FramePropertyAdd => "FramePropertyAdd",
            EventKind::FramePropertyUpdate => "FramePropertyUpdate",
            EventKind::FrameDataUpdate => "FrameDataUpdate",
            EventKind::FrameTx => "FrameTx",
            EventKind::FrameRx => "FrameRx",
            EventKind::FrameConsume => "FrameConsume",
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => EventKind::NodeAdd,
            0x01 => EventKind::NodePropertyAdd,
            0x02 => EventKind::NodePropertyUpdate,
            0x03 => EventKind::NodeRemove,
            0x10 => EventKind::EntityAdd,
            0x11 => EventKind::EntityPropertyAdd,
            0x12 => EventKind::EntityPropertyUpdate,
            0x13 => EventKind::EntityRemove,
            0x20 => EventKind::LinkAdd,
            0x21 => EventKind::LinkPropertyAdd,
            0x22 => EventKind::LinkPropertyUpdate,
            0x23 => EventKind::LinkRemove,
            0x30 => EventKind::FrameProduce,
            0x31 => EventKind::FramePropertyAdd,
            0x32 => EventKind::FramePropertyUpdate,
            0x33 => EventKind::FrameDataUpdate,
            0x34 => EventKind::FrameTx,
            0x35 => EventKind::FrameRx,
            0x36 => EventKind::FrameConsume,
            _ => return Err(DecodeError::UnknownEvent(code)),
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.title())
    }
}

/// Content of one event record body
///
/// Variants named `*Add` and `FrameProduce`/`FrameRx` carry property
/// declarations; `*Update` variants and the link endpoints carry references.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NodeAdd {
        properties: Vec<Property>,
    },
    NodePropertyAdd {
        properties: Vec<Property>,
    },
    NodePropertyUpdate {
        properties: Vec<Property>,
    },
    NodeRemove,
    EntityAdd {
        entity_id: u8,
        name: String,
        properties: Vec<Property>,
    },
    EntityPropertyAdd {
        entity_id: u8,
        properties: Vec<Property>,
    },
    EntityPropertyUpdate {
        entity_id: u8,
        properties: Vec<Property>,
    },
    EntityRemove {
        entity_id: u8,
    },
    LinkAdd {
        entity_id: u8,
        link_id: u8,
        /// References to properties of the owning entity
        source_properties: Vec<Property>,
        target_properties: Vec<Property>,
        properties: Vec<Property>,
    },
    LinkPropertyAdd {
        entity_id: u8,
        link_id: u8,
        properties: Vec<Property>,
    },
    LinkPropertyUpdate {
        entity_id: u8,
        link_id: u8,
        properties: Vec<Property>,
    },
    LinkRemove {
        entity_id: u8,
        link_id: u8,
    },
    FrameProduce {
        entity_id: u8,
        frame_id: u8,
        data: Vec<u8>,
        properties: Vec<Property>,
    },
    FramePropertyAdd {
        entity_id: u8,
        frame_id: u8,
        properties: Vec<Property>,
    },
    FramePropertyUpdate {
        entity_id: u8,
        frame_id: u8,
        properties: Vec<Property>,
    },
    FrameDataUpdate {
        entity_id: u8,
        frame_id: u8,
        data: Vec<u8>,
    },
    FrameTx {
        entity_id: u8,
        frame_id: u8,
        data: Vec<u8>,
    },
    FrameRx {
        entity_id: u8,
        frame_id: u8,
        data: Vec<u8>,
        properties: Vec<Property>,
    },
    FrameConsume {
        entity_id: u8,
        frame_id: u8,
        data: Vec<u8>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeAdd { .. } => EventKind::NodeAdd,
            Event::NodePropertyAdd { .. } => EventKind::NodePropertyAdd,
            Event::NodePropertyUpdate { .. } => EventKind::NodePropertyUpdate,
            Event::NodeRemove => EventKind::NodeRemove,
            Event::EntityAdd { .. } => EventKind::EntityAdd,
            Event::EntityPropertyAdd { .. } => EventKind::EntityPropertyAdd,
            Event::EntityPropertyUpdate { .. } => EventKind::EntityPropertyUpdate,
            Event::EntityRemove { .. } => EventKind::EntityRemove,
            Event::LinkAdd { .. } => EventKind::LinkAdd,
            Event::LinkPropertyAdd { .. } => EventKind::LinkPropertyAdd,
            Event::LinkPropertyUpdate { .. } => EventKind::LinkPropertyUpdate,
            Event::LinkRemove { .. } => EventKind::LinkRemove,
            Event::FrameProduce { .. } => EventKind::FrameProduce,
            Event::FramePropertyAdd { .. } => EventKind::FramePropertyAdd,
            Event::FramePropertyUpdate { .. } => EventKind::FramePropertyUpdate,
            Event::FrameDataUpdate { .. } => EventKind::FrameDataUpdate,
            Event::FrameTx { .. } => EventKind::FrameTx,
            Event::FrameRx { .. } => EventKind::FrameRx,
            Event::FrameConsume { .. } => EventKind::FrameConsume,
        }
    }

    /// Entity the event addresses, if any
    pub fn entity_id(&self) -> Option<u8> {
        match self {
            Event::NodeAdd { .. }
            | Event::NodePropertyAdd { .. }
            | Event::NodePropertyUpdate { .. }
            | Event::NodeRemove => None,
            Event::EntityAdd { entity_id, .. }
            | Event::EntityPropertyAdd { entity_id, .. }
            | Event::EntityPropertyUpdate { entity_id, .. }
            | Event::EntityRemove { entity_id }
            | Event::LinkAdd { entity_id, .. }
            | Event::LinkPropertyAdd { entity_id, .. }
            | Event::LinkPropertyUpdate { entity_id, .. }
            | Event::LinkRemove { entity_id, .. }
            | Event::FrameProduce { entity_id, .. }
            | Event::FramePropertyAdd { entity_id, .. }
            | Event::FramePropertyUpdate { entity_id, .. }
            | Event::FrameDataUpdate { entity_id, .. }
            | Event::FrameTx { entity_id, .. }
            | Event::FrameRx { entity_id, .. }
            | Event::FrameConsume { entity_id, .. } => Some(*entity_id),
        }
    }

    pub fn link_id(&self) -> Option<u8> {
        match self {
            Event::LinkAdd { link_id, .. }
            | Event::LinkPropertyAdd { link_id, .. }
            | Event::LinkPropertyUpdate { link_id, .. }
            | Event::LinkRemove { link_id, .. } => Some(*link_id),
            _ => None,
        }
    }

    pub fn frame_id(&self) -> Option<u8> {
        match self {
            Event::FrameProduce { frame_id, .. }
            | Event::FramePropertyAdd { frame_id, .. }
            | Event::FramePropertyUpdate { frame_id, .. }
            | Event::FrameDataUpdate { frame_id, .. }
            | Event::FrameTx { frame_id, .. }
            | Event::FrameRx { frame_id, .. }
            | Event::FrameConsume { frame_id, .. } => Some(*frame_id),
            _ => None,
        }
    }

    /// Frame payload bytes, for the frame events that carry one
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Event::FrameProduce { data, .. }
            | Event::FrameDataUpdate { data, .. }
            | Event::FrameTx { data, .. }
            | Event::FrameRx { data, .. }
            | Event::FrameConsume { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Declared or referenced properties of the addressed scope
    pub fn properties(&self) -> &[Property] {
        match self {
            Event::NodeAdd { properties }
            | Event::NodePropertyAdd { properties }
            | Event::NodePropertyUpdate { properties }
            | Event::EntityAdd { properties, .. }
            | Event::EntityPropertyAdd { properties, .. }
            | Event::EntityPropertyUpdate { properties, .. }
            | Event::LinkAdd { properties, .. }
            | Event::LinkPropertyAdd { properties, .. }
            | Event::LinkPropertyUpdate { properties, .. }
            | Event::FrameProduce { properties, .. }
            | Event::FramePropertyAdd { properties, .. }
            | Event::FramePropertyUpdate { properties, .. }
            | Event::FrameRx { properties, .. } => properties,
            _ => &[],
        }
    }
}
