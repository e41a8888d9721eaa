//! Commit-gated mutation event dispatch.
//!
//! `encore-core` sits between a transactional persistence layer and its
//! downstream consumers. Every committed write becomes an envelope that fans
//! out to concern-scoped topics, delivered through an in-process listener
//! pool, a durable outbox, or both, with a per-entity migration mode between
//! the two. A workflow trigger matcher consumes the delivered envelopes to
//! start workflow instances and complete assignments.
//!
//! The pieces compose explicitly; there is no global runtime:
//!
//! - [`TopicRegistry`] maps topic names to codecs, policies, and listeners.
//! - [`Runtime`] binds a registry to an [`EventPool`] and an optional
//!   [`DurableDispatcher`].
//! - [`MutationInterceptor`] captures mutation diffs, gates emission on the
//!   transaction's [`TxHandle`], and fans out per the [`DispatchConfig`]
//!   mode.
//! - [`WorkflowMutationListener`] evaluates delivered mutations against the
//!   external [`WorkflowEngine`].

pub mod config;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod mutation;
pub mod outbox;
pub mod payload;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod topic;
pub mod tx;
pub mod workflow;

pub use config::{DispatchConfig, TopicMode};
pub use context::{ContextFlags, DispatchContext};
pub use error::{CodecError, DispatchError, EventIdUnresolvable, RegistryError, WorkflowError};
pub use interceptor::MutationInterceptor;
pub use mutation::{EventId, Mutation, MutationOutcome, MutationRecord, Operation};
pub use outbox::{DurableDispatcher, EmitReceipt, MemoryOutbox, MUTATION_DISPATCH_KIND};
pub use payload::{
    direct_topic, mutation_topics, notification_topic, workflow_topic, Envelope, Headers,
    MutationPayload, PROPERTY_ID, PROPERTY_MUTATION_TYPE,
};
pub use pool::{EventPool, FailureHandler, ListenerFailure, PoolConfig};
pub use registry::{
    register_mutation_topics, Definition, ErasedListener, ListenerContext, ListenerSet,
    ListenerSnapshot, Registration, TopicRegistry,
};
pub use runtime::{Emitted, Runtime, RuntimeBuilder};
pub use topic::{Codec, EmitMode, JsonCodec, Topic, TopicPolicy};
pub use tx::TxHandle;
pub use workflow::{
    attach_workflow_listeners, DefinitionMatch, EventType, TriggerQuery, WorkflowEngine,
    WorkflowMutationListener, ASSIGNMENT_ENTITY, STATUS_FIELD, STATUS_PENDING,
};
