//! Topic registry: idempotent registration, listener attachment, interest
//! lookups.
//!
//! The registry is read-mostly after startup and must support concurrent
//! lookups from many mutation paths, so entries live in a `DashMap`.
//! Registration happens at process initialization and is safe against
//! concurrent idempotent re-registration.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::context::ContextFlags;
use crate::error::{DispatchError, RegistryError};
use crate::mutation::Operation;
use crate::payload::{mutation_topics, Headers, MutationPayload};
use crate::topic::{Codec, EmitMode, JsonCodec, Topic, TopicPolicy};

/// Context handed to a listener alongside its decoded payload.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub topic: String,
    /// Envelope id for durable deliveries; `None` for pool deliveries.
    pub event_id: Option<Uuid>,
    pub headers: Headers,
    pub flags: ContextFlags,
}

/// A topic registration: name, codec, and delivery policy.
pub struct Registration<P> {
    pub topic: Topic<P>,
    pub codec: Box<dyn Codec<P>>,
    pub policy: TopicPolicy,
}

impl<P> Registration<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    /// Register with the JSON codec, which every mutation topic uses.
    pub fn json(topic: Topic<P>, policy: TopicPolicy) -> Self {
        Self {
            topic,
            codec: Box::new(JsonCodec::new()),
            policy,
        }
    }
}

type TypedHandler<P> =
    dyn Fn(ListenerContext, P) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A listener definition bound to a typed topic.
pub struct Definition<P> {
    pub topic: Topic<P>,
    pub name: String,
    /// Operations this listener is interested in; `None` means all.
    pub operations: Option<HashSet<Operation>>,
    handler: Arc<TypedHandler<P>>,
}

impl<P: Send + 'static> Definition<P> {
    pub fn new<F, Fut>(topic: Topic<P>, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ListenerContext, P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            topic,
            name: name.into(),
            operations: None,
            handler: Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload))),
        }
    }

    pub fn for_operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }
}

/// A type-erased listener: decodes the raw payload internally and runs the
/// typed handler it wraps.
pub type ErasedListener =
    dyn Fn(ListenerContext, &Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[derive(Clone)]
pub struct ListenerSnapshot {
    pub name: String,
    pub handler: Arc<ErasedListener>,
}

/// Listener snapshot for one dispatch. Most topics have a handful of
/// listeners, so the set lives inline.
pub type ListenerSet = SmallVec<[ListenerSnapshot; 4]>;

struct CodecHolder<P> {
    codec: Box<dyn Codec<P>>,
}

struct ListenerEntry {
    id: Uuid,
    name: String,
    operations: Option<HashSet<Operation>>,
    handler: Arc<ErasedListener>,
}

struct TopicEntry {
    policy: TopicPolicy,
    payload_type: TypeId,
    codec: Arc<dyn Any + Send + Sync>,
    listeners: Vec<ListenerEntry>,
}

/// Maps topic names to a codec, a delivery policy, and attached listeners.
#[derive(Default)]
pub struct TopicRegistry {
    topics: DashMap<String, TopicEntry>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topic. Registering an already-registered topic with an
    /// equivalent definition (same payload type and policy) succeeds;
    /// a conflicting re-registration is an error.
    pub fn register<P: 'static>(&self, registration: Registration<P>) -> Result<(), RegistryError> {
        let name = registration.topic.name.clone();

        match self.topics.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let entry = existing.get();
                if entry.payload_type == TypeId::of::<P>() && entry.policy == registration.policy {
                    Ok(())
                } else {
                    Err(RegistryError::Conflict { topic: name })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(TopicEntry {
                    policy: registration.policy,
                    payload_type: TypeId::of::<P>(),
                    codec: Arc::new(CodecHolder {
                        codec: registration.codec,
                    }),
                    listeners: Vec::new(),
                });
                Ok(())
            }
        }
    }

    /// Attach a listener to a registered topic. The listener's payload type
    /// must match the registration.
    pub fn attach<P: 'static>(&self, definition: Definition<P>) -> Result<Uuid, RegistryError> {
        let name = definition.topic.name.clone();
        let mut entry =
            self.topics
                .get_mut(&name)
                .ok_or_else(|| RegistryError::ListenerTopicNotRegistered {
                    topic: name.clone(),
                })?;

        if entry.payload_type != TypeId::of::<P>() {
            return Err(RegistryError::ListenerPayloadMismatch { topic: name });
        }

        let holder = Arc::clone(&entry.codec)
            .downcast::<CodecHolder<P>>()
            .map_err(|_| RegistryError::ListenerPayloadMismatch {
                topic: name.clone(),
            })?;

        let typed = Arc::clone(&definition.handler);
        let erased: Arc<ErasedListener> = Arc::new(move |ctx, raw| {
            match holder.codec.decode(raw) {
                Ok(payload) => typed(ctx, payload),
                Err(err) => Box::pin(async move { Err(anyhow::Error::new(err)) }),
            }
        });

        let id = Uuid::new_v4();
        entry.listeners.push(ListenerEntry {
            id,
            name: definition.name,
            operations: definition.operations,
            handler: erased,
        });

        Ok(id)
    }

    /// Detach a previously attached listener.
    pub fn detach(&self, topic: &str, listener_id: Uuid) -> Result<(), RegistryError> {
        let mut entry =
            self.topics
                .get_mut(topic)
                .ok_or_else(|| RegistryError::UnknownTopic {
                    topic: topic.to_string(),
                })?;
        entry.listeners.retain(|listener| listener.id != listener_id);
        Ok(())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn policy(&self, topic: &str) -> Option<TopicPolicy> {
        self.topics.get(topic).map(|entry| entry.policy.clone())
    }

    /// Whether dispatching on this topic for this operation can reach any
    /// consumer. Durable topics are always of interest: their envelopes are
    /// consumed by an out-of-process worker regardless of local listeners.
    pub fn interested_in(&self, topic: &str, operation: Operation) -> bool {
        let Some(entry) = self.topics.get(topic) else {
            return false;
        };

        if entry.policy.emit_mode == EmitMode::Durable {
            return true;
        }

        entry
            .listeners
            .iter()
            .any(|listener| listener_matches(listener, operation))
    }

    /// Encode a payload with the topic's registered codec.
    pub fn encode<P: 'static>(&self, topic: &str, payload: &P) -> Result<Value, DispatchError> {
        let entry = self
            .topics
            .get(topic)
            .ok_or_else(|| RegistryError::UnknownTopic {
                topic: topic.to_string(),
            })?;

        if entry.payload_type != TypeId::of::<P>() {
            return Err(RegistryError::ListenerPayloadMismatch {
                topic: topic.to_string(),
            }
            .into());
        }

        let holder = Arc::clone(&entry.codec)
            .downcast::<CodecHolder<P>>()
            .map_err(|_| RegistryError::ListenerPayloadMismatch {
                topic: topic.to_string(),
            })?;

        Ok(holder.codec.encode(payload)?)
    }

    /// Snapshot of the listeners interested in an operation, for dispatch.
    pub(crate) fn listeners_for(
        &self,
        topic: &str,
        operation: Option<Operation>,
    ) -> ListenerSet {
        let Some(entry) = self.topics.get(topic) else {
            return ListenerSet::new();
        };

        entry
            .listeners
            .iter()
            .filter(|listener| match operation {
                Some(op) => listener_matches(listener, op),
                None => true,
            })
            .map(|listener| ListenerSnapshot {
                name: listener.name.clone(),
                handler: Arc::clone(&listener.handler),
            })
            .collect()
    }
}

fn listener_matches(listener: &ListenerEntry, operation: Operation) -> bool {
    match &listener.operations {
        Some(operations) => operations.contains(&operation),
        None => true,
    }
}

/// Register the direct, workflow, and notification topics for one entity
/// type, all carrying [`MutationPayload`] under the same policy.
pub fn register_mutation_topics(
    registry: &TopicRegistry,
    entity_type: &str,
    policy: TopicPolicy,
) -> Result<(), RegistryError> {
    for name in mutation_topics(entity_type) {
        registry.register(Registration::<MutationPayload>::json(
            Topic::new(name),
            policy.clone(),
        ))?;
    }

    Ok(())
}
