//! The mutation interceptor: capture a diff, gate on commit, fan out.
//!
//! One interceptor instance serves the whole process. It owns the deduplicated
//! list of runtimes it fans out to and the dispatch configuration; per
//! mutation it builds the envelopes up front, then either defers the fan-out
//! to the transaction's post-commit queue or runs it immediately when no
//! transaction is in scope.
//!
//! Nothing here ever propagates an error to the mutation's caller. A mutation
//! that committed must not be failed retroactively by its event plumbing.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::{DispatchConfig, TopicMode};
use crate::context::DispatchContext;
use crate::mutation::{EventId, Mutation, MutationOutcome, Operation};
use crate::payload::{mutation_topics, workflow_topic, Envelope, Headers, MutationPayload};
use crate::runtime::Runtime;

pub struct MutationInterceptor {
    config: DispatchConfig,
    runtimes: Vec<Arc<Runtime>>,
}

impl MutationInterceptor {
    /// Build an interceptor over an explicit runtime list. Runtimes passed
    /// more than once (the same `Arc`) are deduplicated, so an embedder can
    /// wire the same runtime through several subsystems without double
    /// delivery.
    pub fn new(config: DispatchConfig, runtimes: impl IntoIterator<Item = Arc<Runtime>>) -> Self {
        let mut deduped: Vec<Arc<Runtime>> = Vec::new();
        for runtime in runtimes {
            if !deduped
                .iter()
                .any(|existing| Arc::ptr_eq(existing, &runtime))
            {
                deduped.push(runtime);
            }
        }

        Self {
            config,
            runtimes: deduped,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Capture a completed mutation and schedule its emission.
    ///
    /// Call after the write has executed, while the surrounding transaction
    /// (if any) is still open. With a transaction in scope the fan-out runs
    /// from the post-commit queue; a rollback discards it. Without one the
    /// fan-out runs before this call returns.
    pub async fn after_mutation(
        &self,
        ctx: &DispatchContext,
        mutation: &dyn Mutation,
        outcome: &MutationOutcome,
    ) {
        if ctx.skip_emission {
            debug!(entity = mutation.type_name(), "emission skipped by context");
            return;
        }

        let operation = resolve_operation(ctx, mutation);

        // Hard deletes of mirrored types re-arrive through the paired
        // soft-delete update, which emits for them.
        if matches!(operation, Operation::Delete | Operation::DeleteOne)
            && self
                .config
                .soft_delete_mirrored_types
                .contains(mutation.type_name())
        {
            debug!(
                entity = mutation.type_name(),
                op = %operation,
                "soft-delete mirrored type; the update path emits for this delete"
            );
            return;
        }

        // Bulk operations return a row count and carry no addressable entity.
        // A soft delete also surfaces as a row count but its id is readable
        // from the mutation, so it still emits.
        if outcome.is_row_count() && operation != Operation::SoftDeleteOne {
            debug!(
                entity = mutation.type_name(),
                op = %operation,
                "bulk mutation outcome; no event emitted"
            );
            return;
        }

        let event_id = if operation == Operation::SoftDeleteOne {
            EventId::from_mutation(mutation)
        } else {
            EventId::from_outcome(outcome)
        };
        let Ok(event_id) = event_id else {
            debug!(
                entity = mutation.type_name(),
                op = %operation,
                "event id unresolvable; no event emitted"
            );
            return;
        };

        let payload = MutationPayload::from_mutation(mutation, operation, &event_id);
        let headers = Headers::from_payload(&payload);
        let raw = match serde_json::to_value(&payload) {
            Ok(raw) => raw,
            Err(err) => {
                error!(
                    entity = %payload.mutation_type,
                    error = %err,
                    "failed to serialize mutation payload; no event emitted"
                );
                return;
            }
        };

        let workflow = workflow_topic(&payload.mutation_type);
        let mut envelopes = Vec::new();
        for topic in mutation_topics(&payload.mutation_type) {
            if topic == workflow && !self.config.workflow_listeners_enabled {
                continue;
            }
            if !self
                .runtimes
                .iter()
                .any(|runtime| runtime.interested_in(&topic, operation))
            {
                continue;
            }

            envelopes
                .push(Envelope::new(topic, raw.clone(), headers.clone()).with_flags(ctx.flags));
        }

        if envelopes.is_empty() {
            debug!(
                entity = %payload.mutation_type,
                op = %operation,
                "no interested topic; nothing to dispatch"
            );
            return;
        }

        let job = DispatchJob {
            runtimes: self.runtimes.clone(),
            mode: self.config.effective_topic_mode(&payload.mutation_type),
            fail_on_enqueue_error: self.config.mutation_outbox_fail_on_enqueue_error,
            operation,
            envelopes,
        };

        match &ctx.tx {
            Some(tx) => {
                let deferred = job.clone();
                let registered = tx.on_commit(move || deferred.run());
                if !registered {
                    // The transaction already resolved; treat as committed.
                    job.run().await;
                }
            }
            None => job.run().await,
        }
    }
}

fn resolve_operation(ctx: &DispatchContext, mutation: &dyn Mutation) -> Operation {
    let op = mutation.op();
    if ctx.soft_delete && op.is_update() {
        Operation::SoftDeleteOne
    } else {
        op
    }
}

/// The deferred fan-out for one captured mutation.
#[derive(Clone)]
struct DispatchJob {
    runtimes: Vec<Arc<Runtime>>,
    mode: TopicMode,
    fail_on_enqueue_error: bool,
    operation: Operation,
    envelopes: Vec<Envelope>,
}

impl DispatchJob {
    async fn run(self) {
        for envelope in &self.envelopes {
            let durable_ok = match self.mode {
                TopicMode::LegacyOnly => false,
                TopicMode::DualEmit | TopicMode::V2Only => self.enqueue_durable(envelope).await,
            };

            // The inline fallback is unconditional: a v2-only envelope skips
            // it only when the durable enqueue actually succeeded.
            let deliver_inline = match self.mode {
                TopicMode::LegacyOnly | TopicMode::DualEmit => true,
                TopicMode::V2Only => !durable_ok,
            };

            if deliver_inline {
                self.deliver_inline(envelope).await;
            }
        }
    }

    /// Try each runtime's durable store until one accepts the envelope; at
    /// most one durable job exists per envelope.
    async fn enqueue_durable(&self, envelope: &Envelope) -> bool {
        let mut last_error = None;
        for runtime in &self.runtimes {
            if !runtime.has_durable() {
                continue;
            }

            match runtime.dispatch_durable(envelope).await {
                Ok(receipt) => {
                    debug!(
                        topic = %receipt.topic,
                        envelope_id = %receipt.envelope_id,
                        queue = %receipt.queue_class,
                        duplicate = receipt.duplicate,
                        "durable enqueue accepted"
                    );
                    return true;
                }
                Err(err) => last_error = Some(err),
            }
        }

        match last_error {
            Some(err) if self.fail_on_enqueue_error => {
                error!(
                    topic = %envelope.topic,
                    envelope_id = %envelope.id,
                    error = %err,
                    "durable enqueue failed; falling back to inline delivery"
                );
            }
            Some(err) => {
                warn!(
                    topic = %envelope.topic,
                    envelope_id = %envelope.id,
                    error = %err,
                    "durable enqueue failed; falling back to inline delivery"
                );
            }
            None => {
                warn!(
                    topic = %envelope.topic,
                    envelope_id = %envelope.id,
                    "no runtime has a durable store; falling back to inline delivery"
                );
            }
        }

        false
    }

    async fn deliver_inline(&self, envelope: &Envelope) {
        for runtime in &self.runtimes {
            if let Err(err) = runtime.emit_inline(envelope, Some(self.operation)).await {
                warn!(
                    topic = %envelope.topic,
                    envelope_id = %envelope.id,
                    error = %err,
                    "inline delivery failed"
                );
            }
        }
    }
}
