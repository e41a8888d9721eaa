//! Workflow trigger matching over delivered mutation envelopes.
//!
//! The workflow engine itself (definition storage, rule evaluation, instance
//! state) is an external collaborator behind [`WorkflowEngine`]. This module
//! owns the listener side: deciding which delivered mutations are worth
//! showing to the engine, shaping the trigger query, and completing
//! assignments on status transitions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{RegistryError, WorkflowError};
use crate::mutation::Operation;
use crate::payload::{workflow_topic, MutationPayload, PROPERTY_ID};
use crate::registry::{Definition, ListenerContext, TopicRegistry};
use crate::topic::Topic;

/// Entity type whose status transitions complete assignments.
pub const ASSIGNMENT_ENTITY: &str = "WorkflowAssignment";
/// The assignment field whose transition drives completion.
pub const STATUS_FIELD: &str = "status";
/// Initial assignment status; a transition back to it is a no-op.
pub const STATUS_PENDING: &str = "pending";

/// Coarse event label shown to the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn from_operation(op: Operation) -> Self {
        match op {
            Operation::Create => EventType::Create,
            op if op.is_delete() => EventType::Delete,
            _ => EventType::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

/// Everything the engine needs to evaluate trigger conditions for one
/// delivered mutation.
#[derive(Debug, Clone)]
pub struct TriggerQuery {
    pub object_type: String,
    pub entity_type: String,
    pub event_type: EventType,
    pub entity_id: String,
    pub changed_fields: Vec<String>,
    pub changed_edges: Vec<String>,
    pub added_ids: BTreeMap<String, Vec<String>>,
    pub removed_ids: BTreeMap<String, Vec<String>>,
    pub proposed_changes: BTreeMap<String, Value>,
    /// Current entity snapshot, loaded with an elevated read.
    pub entity: Value,
}

/// A definition the engine reports as matching a trigger query.
#[derive(Debug, Clone)]
pub struct DefinitionMatch {
    pub id: String,
    /// Pre-commit approval definitions run through a synchronous path and
    /// are never triggered from delivered envelopes.
    pub pre_commit_approval: bool,
}

/// The external workflow engine collaborator.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Classify an entity type into the engine's workflow object type.
    async fn classify(&self, entity_type: &str) -> Result<String, WorkflowError>;

    /// Fields eligible to trigger workflows for an object type. Empty means
    /// every changed field is eligible.
    async fn eligible_fields(&self, object_type: &str) -> Result<BTreeSet<String>, WorkflowError>;

    /// Load the current entity snapshot with an elevated read context; the
    /// matcher runs as an internal process and must see rows the original
    /// caller might not be authorized to read.
    async fn load_entity(
        &self,
        object_type: &str,
        entity_id: &str,
    ) -> Result<Value, WorkflowError>;

    async fn find_matching_definitions(
        &self,
        query: &TriggerQuery,
    ) -> Result<Vec<DefinitionMatch>, WorkflowError>;

    async fn trigger_workflow(
        &self,
        definition_id: &str,
        query: &TriggerQuery,
    ) -> Result<(), WorkflowError>;

    async fn complete_assignment(
        &self,
        assignment_id: &str,
        status: &str,
    ) -> Result<(), WorkflowError>;
}

/// Listener-side matcher consuming `workflow.mutation.*` envelopes.
pub struct WorkflowMutationListener {
    engine: Arc<dyn WorkflowEngine>,
}

impl WorkflowMutationListener {
    pub fn new(engine: Arc<dyn WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Evaluate one delivered mutation for workflow triggering.
    pub async fn handle_mutation(
        &self,
        ctx: &ListenerContext,
        payload: &MutationPayload,
    ) -> Result<(), WorkflowError> {
        if ctx.flags.workflow_bypass && !ctx.flags.allow_workflow_emission {
            debug!(entity = %payload.mutation_type, "workflow bypass; mutation not evaluated");
            return Ok(());
        }

        if !matches!(
            payload.operation,
            Operation::Create | Operation::Update | Operation::UpdateOne
        ) {
            return Ok(());
        }
        let event_type = EventType::from_operation(payload.operation);

        let object_type = match self.engine.classify(&payload.mutation_type).await {
            Ok(object_type) => object_type,
            Err(WorkflowError::UnsupportedObjectType(entity)) => {
                debug!(entity = %entity, "no workflow object type; mutation not evaluated");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let changed_fields = if event_type == EventType::Create {
            payload.changed_fields.clone()
        } else {
            let eligible = self.engine.eligible_fields(&object_type).await?;
            let filtered: Vec<String> = if eligible.is_empty() {
                payload.changed_fields.clone()
            } else {
                payload
                    .changed_fields
                    .iter()
                    .filter(|field| eligible.contains(*field))
                    .cloned()
                    .collect()
            };

            if filtered.is_empty() && payload.changed_edges.is_empty() {
                debug!(
                    entity = %payload.mutation_type,
                    "no eligible field or edge changed; mutation not evaluated"
                );
                return Ok(());
            }

            filtered
        };

        let entity_id = resolve_entity_id(ctx, payload);
        let Some(entity_id) = entity_id else {
            debug!(entity = %payload.mutation_type, "no entity id; mutation not evaluated");
            return Ok(());
        };

        let entity = self.engine.load_entity(&object_type, &entity_id).await?;

        let query = TriggerQuery {
            object_type,
            entity_type: payload.mutation_type.clone(),
            event_type,
            entity_id,
            changed_fields,
            changed_edges: payload.changed_edges.clone(),
            added_ids: payload.added_ids.clone(),
            removed_ids: payload.removed_ids.clone(),
            proposed_changes: payload.proposed_changes.clone(),
            entity,
        };

        debug!(
            entity = %query.entity_type,
            event = event_type.as_str(),
            entity_id = %query.entity_id,
            "evaluating workflow triggers"
        );

        let matches = self.engine.find_matching_definitions(&query).await?;
        for definition in matches {
            if definition.pre_commit_approval {
                continue;
            }

            match self.engine.trigger_workflow(&definition.id, &query).await {
                Ok(()) => {}
                // benign race with a concurrent trigger for the same instance
                Err(WorkflowError::AlreadyActive) => {}
                Err(err) => {
                    error!(
                        definition = %definition.id,
                        entity = %query.entity_type,
                        error = %err,
                        "workflow trigger failed"
                    );
                }
            }
        }

        Ok(())
    }

    /// Evaluate one delivered assignment mutation for completion.
    pub async fn handle_assignment_mutation(
        &self,
        ctx: &ListenerContext,
        payload: &MutationPayload,
    ) -> Result<(), WorkflowError> {
        if !payload.operation.is_update() {
            return Ok(());
        }

        if !payload.changed_fields.iter().any(|f| f == STATUS_FIELD) {
            return Ok(());
        }

        let Some(next_status) = resolve_next_status(ctx, payload) else {
            debug!(assignment = %payload.entity_id, "next status unresolvable; ignored");
            return Ok(());
        };
        if next_status == STATUS_PENDING {
            return Ok(());
        }

        let Some(assignment_id) = resolve_entity_id(ctx, payload) else {
            return Ok(());
        };

        self.engine
            .complete_assignment(&assignment_id, &next_status)
            .await
    }
}

fn resolve_entity_id(ctx: &ListenerContext, payload: &MutationPayload) -> Option<String> {
    if !payload.entity_id.is_empty() {
        return Some(payload.entity_id.clone());
    }
    ctx.headers
        .get(PROPERTY_ID)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn resolve_next_status(ctx: &ListenerContext, payload: &MutationPayload) -> Option<String> {
    if let Some(Value::String(status)) = payload.proposed_changes.get(STATUS_FIELD) {
        return Some(status.clone());
    }
    ctx.headers.get(STATUS_FIELD).map(str::to_string)
}

/// Attach the workflow trigger listener for each entity type, plus the
/// assignment completion listener, to the registry's workflow topics.
pub fn attach_workflow_listeners(
    registry: &TopicRegistry,
    engine: Arc<dyn WorkflowEngine>,
    entity_types: &[&str],
) -> Result<(), RegistryError> {
    for entity_type in entity_types {
        let listener = Arc::new(WorkflowMutationListener::new(Arc::clone(&engine)));
        let topic: Topic<MutationPayload> = Topic::new(workflow_topic(entity_type));
        registry.attach(
            Definition::new(
                topic,
                format!("workflow-trigger-{}", entity_type.to_ascii_lowercase()),
                move |ctx, payload: MutationPayload| {
                    let listener = Arc::clone(&listener);
                    async move {
                        listener.handle_mutation(&ctx, &payload).await?;
                        Ok(())
                    }
                },
            )
            .for_operations([Operation::Create, Operation::Update, Operation::UpdateOne]),
        )?;
    }

    let listener = Arc::new(WorkflowMutationListener::new(engine));
    let topic: Topic<MutationPayload> = Topic::new(workflow_topic(ASSIGNMENT_ENTITY));
    registry.attach(
        Definition::new(
            topic,
            "workflow-assignment-completion",
            move |ctx, payload: MutationPayload| {
                let listener = Arc::clone(&listener);
                async move {
                    listener.handle_assignment_mutation(&ctx, &payload).await?;
                    Ok(())
                }
            },
        )
        .for_operations([Operation::Update, Operation::UpdateOne]),
    )?;

    Ok(())
}
