//! Envelope building: payloads, headers, topic derivation.
//!
//! A captured mutation becomes one [`MutationPayload`], carried unchanged by
//! both delivery mechanisms. The durable path persists the serialized
//! [`Envelope`], so everything here is plain JSON-compatible data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ContextFlags;
use crate::mutation::{EventId, Mutation, Operation};

/// Header property carrying the mutated entity's id.
pub const PROPERTY_ID: &str = "ID";
/// Header property carrying the mutated entity's type name.
pub const PROPERTY_MUTATION_TYPE: &str = "mutation_type";

const WORKFLOW_TOPIC_PREFIX: &str = "workflow.mutation.";
const NOTIFICATION_TOPIC_PREFIX: &str = "notification.mutation.";

/// The immutable unit of work produced from one captured mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPayload {
    pub mutation_type: String,
    pub operation: Operation,
    pub entity_id: String,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub cleared_fields: Vec<String>,
    #[serde(default)]
    pub changed_edges: Vec<String>,
    #[serde(default)]
    pub added_ids: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub removed_ids: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub proposed_changes: BTreeMap<String, Value>,
}

impl MutationPayload {
    /// Capture a mutation's diff under the resolved logical operation.
    pub fn from_mutation(
        mutation: &dyn Mutation,
        operation: Operation,
        event_id: &EventId,
    ) -> Self {
        let changed_fields = mutation.changed_fields();
        let proposed_changes = changed_fields
            .iter()
            .filter_map(|field| mutation.field(field).map(|value| (field.clone(), value)))
            .collect();

        Self {
            mutation_type: mutation.type_name().to_string(),
            operation,
            entity_id: event_id.id.clone(),
            changed_fields,
            cleared_fields: mutation.cleared_fields(),
            changed_edges: mutation.changed_edges(),
            added_ids: mutation.added_ids(),
            removed_ids: mutation.removed_ids(),
            proposed_changes,
        }
    }
}

/// String-valued envelope properties.
///
/// Headers mirror scalar proposed changes so consumers that cannot
/// deserialize the full payload (status-only readers, for example) still have
/// a fallback channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Build the standard header set for a payload: scalar proposed changes
    /// first, then the reserved `ID` and `mutation_type` properties.
    pub fn from_payload(payload: &MutationPayload) -> Self {
        let mut headers = Headers::new();

        for (field, value) in &payload.proposed_changes {
            if let Some(text) = scalar_to_string(value) {
                headers.set(field.clone(), text);
            }
        }

        headers.set(PROPERTY_ID, payload.entity_id.clone());
        headers.set(PROPERTY_MUTATION_TYPE, payload.mutation_type.clone());

        headers
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The serializable, addressable unit dispatched to a delivery mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: Headers,
    /// Codec-encoded payload. For mutation topics this is a
    /// [`MutationPayload`] in its JSON form.
    pub payload: Value,
    /// Detached snapshot of the emitting context's flags, so durable
    /// consumers see the same bypass/allow decisions the emitter saw.
    #[serde(default)]
    pub flags: ContextFlags,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            occurred_at: Utc::now(),
            headers,
            payload,
            flags: ContextFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: ContextFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The direct (legacy) topic for an entity type.
pub fn direct_topic(entity_type: &str) -> String {
    entity_type.to_string()
}

/// The workflow concern topic, e.g. `workflow.mutation.organization`.
pub fn workflow_topic(entity_type: &str) -> String {
    format!("{WORKFLOW_TOPIC_PREFIX}{}", entity_type.to_ascii_lowercase())
}

/// The notification concern topic, e.g. `notification.mutation.organization`.
pub fn notification_topic(entity_type: &str) -> String {
    format!(
        "{NOTIFICATION_TOPIC_PREFIX}{}",
        entity_type.to_ascii_lowercase()
    )
}

/// All topic names derivable for one entity type, in dispatch order.
pub fn mutation_topics(entity_type: &str) -> [String; 3] {
    [
        direct_topic(entity_type),
        workflow_topic(entity_type),
        notification_topic(entity_type),
    ]
}
