//! Durable dispatch seam.
//!
//! A [`DurableDispatcher`] accepts a serialized envelope and persists it as a
//! job for an out-of-process worker. The postgres-backed store lives in its
//! own crate; [`MemoryOutbox`] here backs tests and single-process embedders.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::payload::Envelope;
use crate::topic::TopicPolicy;

/// Job kind under which dispatched mutation envelopes are enqueued.
pub const MUTATION_DISPATCH_KIND: &str = "mutation_dispatch";

/// Proof that a durable store accepted an envelope.
#[derive(Debug, Clone)]
pub struct EmitReceipt {
    pub envelope_id: Uuid,
    pub topic: String,
    pub queue_class: String,
    /// Store-assigned job id, when the store surfaces one.
    pub job_id: Option<i64>,
    /// The store had already accepted this envelope id; nothing new was
    /// written.
    pub duplicate: bool,
}

/// Persists envelopes for exactly-once post-commit consumption.
#[async_trait]
pub trait DurableDispatcher: Send + Sync {
    async fn dispatch_durable(
        &self,
        envelope: &Envelope,
        policy: &TopicPolicy,
    ) -> Result<EmitReceipt, DispatchError>;
}

/// In-memory durable store. Accepted envelopes are held in arrival order and
/// deduplicated by envelope id.
#[derive(Default)]
pub struct MemoryOutbox {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    envelopes: Vec<Envelope>,
    seen: HashSet<Uuid>,
    failing: bool,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted envelope, in arrival order.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.state.lock().expect("outbox lock poisoned").envelopes.clone()
    }

    pub fn envelopes_for_topic(&self, topic: &str) -> Vec<Envelope> {
        self.envelopes()
            .into_iter()
            .filter(|envelope| envelope.topic == topic)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("outbox lock poisoned").envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent enqueues fail, to exercise fallback paths.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().expect("outbox lock poisoned").failing = failing;
    }
}

#[async_trait]
impl DurableDispatcher for MemoryOutbox {
    async fn dispatch_durable(
        &self,
        envelope: &Envelope,
        policy: &TopicPolicy,
    ) -> Result<EmitReceipt, DispatchError> {
        let mut state = self.state.lock().expect("outbox lock poisoned");

        if state.failing {
            return Err(DispatchError::Enqueue(anyhow::anyhow!(
                "memory outbox is configured to fail"
            )));
        }

        let duplicate = !state.seen.insert(envelope.id);
        if !duplicate {
            state.envelopes.push(envelope.clone());
        }

        Ok(EmitReceipt {
            envelope_id: envelope.id,
            topic: envelope.topic.clone(),
            queue_class: policy.queue_class.clone(),
            job_id: None,
            duplicate,
        })
    }
}
