//! Error taxonomy for registration, dispatch, and workflow triggering.

use thiserror::Error;

/// Errors raised by topic registration and listener attachment.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A topic was re-registered with an incompatible payload type or policy.
    ///
    /// Re-registering with an equivalent definition is not an error; only a
    /// conflicting definition is fatal at startup.
    #[error("topic `{topic}` is already registered with a conflicting definition")]
    Conflict { topic: String },

    /// The topic has not been registered.
    #[error("topic `{topic}` is not registered")]
    UnknownTopic { topic: String },

    /// A listener was attached before its topic contract was registered.
    #[error("topic `{topic}` must be registered before attaching listeners")]
    ListenerTopicNotRegistered { topic: String },

    /// A listener's payload type does not match the topic registration.
    #[error("listener payload type does not match registration for topic `{topic}`")]
    ListenerPayloadMismatch { topic: String },
}

/// Payload encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors on the emission path. These never propagate to the caller of the
/// originating mutation; the interceptor logs them and applies its fallback
/// policy instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No durable dispatcher is configured on the runtime.
    #[error("durable runtime is not configured")]
    RuntimeUnavailable,

    /// Envelope construction failed; dispatch to this target is aborted and
    /// other targets are unaffected.
    #[error("envelope construction failed: {0}")]
    Envelope(#[from] CodecError),

    /// The durable store rejected or failed the enqueue.
    #[error("durable enqueue failed: {0}")]
    Enqueue(#[source] anyhow::Error),

    /// The in-process pool has been closed and accepts no new emissions.
    #[error("event pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The mutated entity's identifier could not be resolved.
#[derive(Debug, Error)]
#[error("unable to determine the event id for the mutated entity")]
pub struct EventIdUnresolvable;

/// Errors surfaced by the workflow trigger matcher and its engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Benign race: another trigger already created an instance for the same
    /// trigger. Never logged as an error.
    #[error("a workflow is already active for this trigger")]
    AlreadyActive,

    /// The entity type has no workflow object classification.
    #[error("unsupported workflow object type `{0}`")]
    UnsupportedObjectType(String),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}
