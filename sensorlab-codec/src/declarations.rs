//! Declaration tables
//!
//! Everything the decoder has been told about a node: node-scoped properties,
//! live entities with their properties and links, and frame scopes. Frame
//! scopes are keyed by the `(frame_id, entity_id)` pair because one frame is
//! seen at successive entities (produced at one, received at another).

use crate::types::{node_properties, DecodeError, IdScope, Property, Result};
use crate::units::{DataType, Unit, UnitPrefix};
use std::collections::HashMap;

/// Metadata remembered from a property declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub prefix: UnitPrefix,
    pub unit: Unit,
    pub data_type: DataType,
}

impl From<&Property> for Declaration {
    fn from(property: &Property) -> Self {
        Self {
            name: property.name.clone(),
            prefix: property.prefix,
            unit: property.unit,
            data_type: property.data_type(),
        }
    }
}

/// Properties declared in one parent scope
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    properties: HashMap<u8, Declaration>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a declaration; a later declaration with the same id replaces it
    pub fn declare(&mut self, id: u8, declaration: Declaration) {
        self.properties.insert(id, declaration);
    }

    pub fn get(&self, id: u8) -> Result<&Declaration> {
        self.properties.get(&id).ok_or(DecodeError::UnknownId {
            scope: IdScope::Property,
            id,
        })
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// A live entity and everything scoped to it
#[derive(Debug, Clone, Default)]
pub struct EntityDeclarations {
    pub name: String,
    pub properties: PropertyTable,
    pub links: HashMap<u8, PropertyTable>,
}

/// Composite key of a frame scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub frame_id: u8,
    pub entity_id: u8,
}

impl FrameKey {
    pub fn new(frame_id: u8, entity_id: u8) -> Self {
        Self {
            frame_id,
            entity_id,
        }
    }
}

/// Statistics about the declarations currently held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeclarationStats {
    pub node_properties: usize,
    pub entities: usize,
    pub links: usize,
    pub frame_scopes: usize,
}

/// All declarations of one decoding session
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    node: PropertyTable,
    entities: HashMap<u8, EntityDeclarations>,
    frames: HashMap<FrameKey, PropertyTable>,
}

impl Declarations {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Create tables with the current monitor's node properties pre-declared
    pub fn with_current_monitor() -> Self {
        let mut declarations = Self::new();
        let monitor = [
            (node_properties::SHUNT_VOLTAGE, "Shunt voltage", UnitPrefix::Milli, Unit::Volt, DataType::F32Array),
            (node_properties::BUS_VOLTAGE, "Bus voltage", UnitPrefix::None, Unit::Volt, DataType::F32Array),
            (node_properties::CURRENT, "Current", UnitPrefix::Milli, Unit::Ampere, DataType::F32Array),
            (node_properties::POWER, "Power", UnitPrefix::Milli, Unit::Watt, DataType::F32Array),
            (node_properties::TIMESTAMP, "Timestamp", UnitPrefix::None, Unit::Second, DataType::F64Array),
        ];
        for (id, name, prefix, unit, data_type) in monitor {
            declarations.node.declare(
                id,
                Declaration {
                    name: name.to_string(),
                    prefix,
                    unit,
                    data_type,
                },
            );
        }
        declarations
    }

    /// Drop entity, link and frame declarations; node declarations survive
    pub fn reset(&mut self) {
        self.entities.clear();
        self.frames.clear();
    }

    /// Drop everything, node declarations included
    pub fn clear(&mut self) {
        self.node = PropertyTable::new();
        self.reset();
    }

    pub fn node(&self) -> &PropertyTable {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut PropertyTable {
        &mut self.node
    }

    /// Declare an entity, replacing any earlier entity with the same id
    pub fn add_entity(&mut self, entity_id: u8, name: String) -> &mut EntityDeclarations {
        self.remove_frames_at(entity_id);
        self.entities.insert(
            entity_id,
            EntityDeclarations {
                name,
                ..Default::default()
            },
        );
        self.entities.entry(entity_id).or_default()
    }

    pub fn entity(&self, entity_id: u8) -> Result<&EntityDeclarations> {
        self.entities.get(&entity_id).ok_or(DecodeError::UnknownId {
            scope: IdScope::Entity,
            id: entity_id,
        })
    }

    pub fn entity_mut(&mut self, entity_id: u8) -> Result<&mut EntityDeclarations> {
        self.entities.get_mut(&entity_id).ok_or(DecodeError::UnknownId {
            scope: IdScope::Entity,
            id: entity_id,
        })
    }

    /// Remove an entity with its properties, links and frame scopes
    pub fn remove_entity(&mut self, entity_id: u8) -> Result<EntityDeclarations> {
        let entity = self.entities.remove(&entity_id).ok_or(DecodeError::UnknownId {
            scope: IdScope::Entity,
            id: entity_id,
        })?;
        self.remove_frames_at(entity_id);
        Ok(entity)
    }

    fn remove_frames_at(&mut self, entity_id: u8) {
        self.frames.retain(|key, _| key.entity_id != entity_id);
    }

    pub fn link(&self, entity_id: u8, link_id: u8) -> Result<&PropertyTable> {
        self.entity(entity_id)?
            .links
            .get(&link_id)
            .ok_or(DecodeError::UnknownId {
                scope: IdScope::Link { entity_id },
                id: link_id,
            })
    }

    pub fn link_mut(&mut self, entity_id: u8, link_id: u8) -> Result<&mut PropertyTable> {
        self.entity_mut(entity_id)?
            .links
            .get_mut(&link_id)
            .ok_or(DecodeError::UnknownId {
                scope: IdScope::Link { entity_id },
                id: link_id,
            })
    }

    pub fn remove_link(&mut self, entity_id: u8, link_id: u8) -> Result<()> {
        self.entity_mut(entity_id)?
            .links
            .remove(&link_id)
            .map(|_| ())
            .ok_or(DecodeError::UnknownId {
                scope: IdScope::Link { entity_id },
                id: link_id,
            })
    }

    /// Whether the frame id is currently open at any entity
    pub fn frame_known(&self, frame_id: u8) -> bool {
        self.frames.keys().any(|key| key.frame_id == frame_id)
    }

    /// Fail unless the frame id is open at some entity
    pub fn require_frame(&self, frame_id: u8, entity_id: u8) -> Result<()> {
        if self.frame_known(frame_id) {
            Ok(())
        } else {
            Err(DecodeError::UnknownId {
                scope: IdScope::Frame { entity_id },
                id: frame_id,
            })
        }
    }

    /// Open a fresh frame scope at an entity, closing older scopes of the same frame
    pub fn open_frame(&mut self, frame_id: u8, entity_id: u8) -> &mut PropertyTable {
        self.frames.retain(|key, _| key.frame_id != frame_id);
        self.frames
            .entry(FrameKey::new(frame_id, entity_id))
            .or_default()
    }

    /// Scope of a frame at an entity, opening it if the frame is known elsewhere
    pub fn frame_scope_mut(&mut self, frame_id: u8, entity_id: u8) -> Result<&mut PropertyTable> {
        self.require_frame(frame_id, entity_id)?;
        Ok(self
            .frames
            .entry(FrameKey::new(frame_id, entity_id))
            .or_default())
    }

    pub fn frame(&self, frame_id: u8, entity_id: u8) -> Result<&PropertyTable> {
        self.frames
            .get(&FrameKey::new(frame_id, entity_id))
            .ok_or(DecodeError::UnknownId {
                scope: IdScope::Frame { entity_id },
                id: frame_id,
            })
    }

    pub fn close_frame(&mut self, frame_id: u8, entity_id: u8) {
        self.frames.remove(&FrameKey::new(frame_id, entity_id));
    }

    pub fn stats(&self) -> DeclarationStats {
        DeclarationStats {
            node_properties: self.node.len(),
            entities: self.entities.len(),
            links: self.entities.values().map(|e| e.links.len()).sum(),
            frame_scopes: self.frames.len(),
        }
    }
}
