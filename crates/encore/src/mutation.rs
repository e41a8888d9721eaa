//! The mutation abstraction consumed by the interceptor.
//!
//! The persistence layer constructs one [`Mutation`] per write and hands it to
//! the interceptor together with the operation's tagged outcome. The core
//! never inspects entity schemas; it only reads the diff the mutation exposes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventIdUnresolvable;

/// A single create/update/delete operation against a persisted entity.
///
/// `SoftDeleteOne` is never produced by the persistence layer itself; it is
/// the interceptor's classification of an update that a request-shape override
/// marked as a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    UpdateOne,
    Delete,
    DeleteOne,
    SoftDeleteOne,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::UpdateOne => "update_one",
            Operation::Delete => "delete",
            Operation::DeleteOne => "delete_one",
            Operation::SoftDeleteOne => "soft_delete_one",
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Operation::Update | Operation::UpdateOne)
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Operation::Delete | Operation::DeleteOne | Operation::SoftDeleteOne
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of executing a mutation.
///
/// Bulk updates and deletes return a bare row count; everything else returns
/// the post-mutation entity value. The tag is decided at the call site, so the
/// interceptor never has to inspect the value's shape dynamically.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The post-mutation entity, serialized by the persistence layer.
    Entity(Value),
    /// Number of rows affected by a bulk operation.
    RowCount(u64),
}

impl MutationOutcome {
    pub fn is_row_count(&self) -> bool {
        matches!(self, MutationOutcome::RowCount(_))
    }
}

/// An opaque mutation descriptor: entity kind, operation, and diff.
///
/// Constructed by the persistence layer per write, consumed once by the
/// interceptor, discarded after dispatch.
pub trait Mutation: Send + Sync {
    /// Entity kind, e.g. `Organization`.
    fn type_name(&self) -> &str;

    /// Raw persistence-layer operation. Never `SoftDeleteOne`.
    fn op(&self) -> Operation;

    fn changed_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn cleared_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn changed_edges(&self) -> Vec<String> {
        Vec::new()
    }

    /// Edge name → IDs added to that edge.
    fn added_ids(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    /// Edge name → IDs removed from that edge.
    fn removed_ids(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    /// The proposed value for a changed field, when readable.
    fn field(&self, _name: &str) -> Option<Value> {
        None
    }

    /// The mutated row's identifier, when the mutation itself knows it.
    /// Required for the soft-delete path, where the outcome is an update
    /// result that must be reported as a delete-shaped event.
    fn id(&self) -> Option<String> {
        None
    }
}

/// Identifier of the mutated row, resolved either from the mutation's return
/// value or from the mutation itself for soft deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventId {
    #[serde(default)]
    pub id: String,
}

impl EventId {
    /// Parse the id out of an entity-shaped outcome value.
    pub fn from_outcome(outcome: &MutationOutcome) -> Result<Self, EventIdUnresolvable> {
        let MutationOutcome::Entity(value) = outcome else {
            return Err(EventIdUnresolvable);
        };

        let event: EventId =
            serde_json::from_value(value.clone()).map_err(|_| EventIdUnresolvable)?;
        if event.id.is_empty() {
            return Err(EventIdUnresolvable);
        }

        Ok(event)
    }

    /// Resolve the id from the mutation itself (soft-delete path).
    pub fn from_mutation(mutation: &dyn Mutation) -> Result<Self, EventIdUnresolvable> {
        match mutation.id() {
            Some(id) if !id.is_empty() => Ok(EventId { id }),
            _ => Err(EventIdUnresolvable),
        }
    }
}

/// A concrete, buildable [`Mutation`] for embedders whose persistence layer
/// produces plain diffs, and for tests.
#[derive(Debug, Clone, Default)]
pub struct MutationRecord {
    type_name: String,
    op: Option<Operation>,
    id: Option<String>,
    fields: BTreeMap<String, Value>,
    cleared: BTreeSet<String>,
    edges: BTreeSet<String>,
    added: BTreeMap<String, Vec<String>>,
    removed: BTreeMap<String, Vec<String>>,
}

impl MutationRecord {
    pub fn new(type_name: impl Into<String>, op: Operation) -> Self {
        Self {
            type_name: type_name.into(),
            op: Some(op),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_cleared_field(mut self, name: impl Into<String>) -> Self {
        self.cleared.insert(name.into());
        self
    }

    pub fn with_added_ids(mut self, edge: impl Into<String>, ids: Vec<String>) -> Self {
        let edge = edge.into();
        self.edges.insert(edge.clone());
        self.added.insert(edge, ids);
        self
    }

    pub fn with_removed_ids(mut self, edge: impl Into<String>, ids: Vec<String>) -> Self {
        let edge = edge.into();
        self.edges.insert(edge.clone());
        self.removed.insert(edge, ids);
        self
    }
}

impl Mutation for MutationRecord {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn op(&self) -> Operation {
        self.op.unwrap_or(Operation::Update)
    }

    fn changed_fields(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn cleared_fields(&self) -> Vec<String> {
        self.cleared.iter().cloned().collect()
    }

    fn changed_edges(&self) -> Vec<String> {
        self.edges.iter().cloned().collect()
    }

    fn added_ids(&self) -> BTreeMap<String, Vec<String>> {
        self.added.clone()
    }

    fn removed_ids(&self) -> BTreeMap<String, Vec<String>> {
        self.removed.clone()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn id(&self) -> Option<String> {
        self.id.clone()
    }
}
