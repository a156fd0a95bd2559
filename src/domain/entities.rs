//! Domain entity identities and change records.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity types whose mutations can invalidate cached pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    City,
    Country,
    Airport,
    Flight,
    Stay,
    Booking,
    Image,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::City => "City",
            EntityType::Country => "Country",
            EntityType::Airport => "Airport",
            EntityType::Flight => "Flight",
            EntityType::Stay => "Stay",
            EntityType::Booking => "Booking",
            EntityType::Image => "Image",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one domain entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

/// A recorded mutation to one domain entity.
///
/// Immutable once read from the tracker. Ordering within a batch carries no
/// meaning beyond "changed since the requested revision".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Modification time, unix milliseconds.
    pub modified_utc: i64,
}

impl EntityChange {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, modified_utc: i64) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            modified_utc,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.clone())
    }
}

/// Result of asking the tracker for changes since a revision.
///
/// `TooMuch` is a control-flow sentinel, not an error: the true change count
/// exceeded the requested cap and consumers must assume everything changed.
#[derive(Debug, Clone)]
pub enum ChangeBatch {
    TooMuch,
    Changes(Vec<EntityChange>),
}

/// Group changes by entity type, preserving per-type order.
pub fn group_by_entity_type(changes: &[EntityChange]) -> HashMap<EntityType, Vec<EntityChange>> {
    let mut grouped: HashMap<EntityType, Vec<EntityChange>> = HashMap::new();
    for change in changes {
        grouped
            .entry(change.entity_type)
            .or_default()
            .push(change.clone());
    }
    grouped
}
