//! Immutable edit records exchanged between replicas.
//!
//! An [`Operation`] is created once by its origin site and never mutated.
//! Its JSON form is the interop wire format:
//!
//! ```json
//! {
//!   "id": "A-1",
//!   "siteId": "A",
//!   "kind": "add",
//!   "payload": { "id": "obj1", "x": 100, "y": 100 },
//!   "timestamp": 1704067200000,
//!   "vectorClock": { "A": 1 },
//!   "parentId": null
//! }
//! ```

use crate::clock::{SiteId, VectorClock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Identifier of a board entity (shape, connector, sticky note, ...).
pub type EntityId = String;

/// Globally unique operation identifier, `{siteId}-{sequence}`.
pub type OperationId = String;

/// Generic field map of an entity.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Positional fields touched by [`OpKind::Move`].
pub const POSITION_FIELDS: [&str; 2] = ["x", "y"];

/// The kind of edit an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Create an entity
    Add,
    /// Shallow-merge fields into an entity
    Update,
    /// Delete an entity permanently
    Delete,
    /// Update restricted to positional fields
    Move,
}

impl OpKind {
    /// `true` for kinds that modify fields of an existing entity.
    #[must_use]
    pub fn is_field_edit(self) -> bool {
        matches!(self, OpKind::Update | OpKind::Move)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Add => write!(f, "add"),
            OpKind::Update => write!(f, "update"),
            OpKind::Delete => write!(f, "delete"),
            OpKind::Move => write!(f, "move"),
        }
    }
}

impl std::str::FromStr for OpKind {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(OpKind::Add),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            "move" => Ok(OpKind::Move),
            other => Err(OperationError::InvalidOperation(format!(
                "unknown kind '{other}'"
            ))),
        }
    }
}

/// Target entity plus the fields written by an operation.
///
/// Serialized as a flat map with the entity id under the reserved key `"id"`.
/// Deserialization fails when `"id"` is missing or not a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Target entity
    #[serde(rename = "id")]
    pub entity_id: EntityId,
    /// Written fields, excluding the reserved id
    #[serde(flatten)]
    pub fields: Fields,
}

impl Payload {
    /// Create a payload for `entity_id` with no fields.
    #[must_use]
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields: Fields::new(),
        }
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Positional subset of the fields.
    #[must_use]
    pub fn position(&self) -> Fields {
        self.fields
            .iter()
            .filter(|(k, _)| POSITION_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// An immutable intent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique id used for deduplication
    pub id: OperationId,
    /// Originating replica
    pub site_id: SiteId,
    /// Kind of edit
    pub kind: OpKind,
    /// Target entity and written fields
    pub payload: Payload,
    /// Wall-clock milliseconds at creation, tie-break only
    pub timestamp: u64,
    /// Creator's clock after incrementing its own counter
    pub vector_clock: VectorClock,
    /// Explicit causal predecessor
    pub parent_id: Option<OperationId>,
}

impl Operation {
    /// Target entity id.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.payload.entity_id
    }

    /// Sequence number of this operation at its origin site.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.vector_clock.get(&self.site_id)
    }

    /// Fields this operation writes when applied: positional fields for a
    /// move, nothing for a delete, the whole payload otherwise.
    #[must_use]
    pub fn written_fields(&self) -> Fields {
        match self.kind {
            OpKind::Add | OpKind::Update => self.payload.fields.clone(),
            OpKind::Move => self.payload.position(),
            OpKind::Delete => Fields::new(),
        }
    }

    /// Canonical id for an operation created by `site` at `sequence`.
    #[must_use]
    pub fn make_id(site: &str, sequence: u64) -> OperationId {
        format!("{site}-{sequence}")
    }

    /// Deterministic last-write-wins ordering: timestamp, then site id,
    /// then operation id.
    #[must_use]
    pub fn lww_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.site_id.cmp(&other.site_id))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Check structural invariants of an operation received from outside.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InvalidOperation`] if the entity id or site
    /// id is empty, the origin counter is zero, or the id does not match
    /// `{siteId}-{vectorClock[siteId]}`.
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.site_id.is_empty() {
            return Err(OperationError::InvalidOperation(format!(
                "{}: empty siteId",
                self.id
            )));
        }
        if self.payload.entity_id.is_empty() {
            return Err(OperationError::InvalidOperation(format!(
                "{}: empty payload id",
                self.id
            )));
        }
        let sequence = self.sequence();
        if sequence == 0 {
            return Err(OperationError::InvalidOperation(format!(
                "{}: vectorClock has no counter for origin site {}",
                self.id, self.site_id
            )));
        }
        let expected = Self::make_id(&self.site_id, sequence);
        if self.id != expected {
            return Err(OperationError::InvalidOperation(format!(
                "{}: id does not match origin sequence, expected {expected}",
                self.id
            )));
        }
        Ok(())
    }
}

/// Errors raised at the operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Operation violates a structural invariant
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Current wall clock time in milliseconds since UNIX epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
