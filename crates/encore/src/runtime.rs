//! The dispatch runtime: one registry, one pool, an optional durable store.
//!
//! A runtime is plain data handed explicitly to whoever emits; there is no
//! process-global instance. Embedders that fan out to several runtimes pass
//! them all to the interceptor, which deduplicates shared instances.

use std::sync::Arc;

use tracing::debug;

use crate::error::DispatchError;
use crate::mutation::Operation;
use crate::outbox::{DurableDispatcher, EmitReceipt};
use crate::payload::{Envelope, Headers};
use crate::pool::{EventPool, FailureHandler, ListenerFailure, PoolConfig};
use crate::registry::{ListenerContext, TopicRegistry};
use crate::topic::{EmitMode, Topic, TopicPolicy};

/// Result of a typed emit, by the topic's delivery policy.
#[derive(Debug)]
pub enum Emitted {
    /// The envelope was accepted by the durable store.
    Durable(EmitReceipt),
    /// The envelope was delivered inline; failed listeners are reported.
    Inline(Vec<ListenerFailure>),
}

pub struct RuntimeBuilder {
    registry: Arc<TopicRegistry>,
    pool_config: PoolConfig,
    failure_handler: Option<Arc<FailureHandler>>,
    durable: Option<Arc<dyn DurableDispatcher>>,
}

impl RuntimeBuilder {
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn failure_handler(mut self, handler: Arc<FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn durable(mut self, dispatcher: Arc<dyn DurableDispatcher>) -> Self {
        self.durable = Some(dispatcher);
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let mut pool = EventPool::new(self.pool_config);
        if let Some(handler) = self.failure_handler {
            pool = pool.with_failure_handler(handler);
        }

        Arc::new(Runtime {
            registry: self.registry,
            pool,
            durable: self.durable,
        })
    }
}

pub struct Runtime {
    registry: Arc<TopicRegistry>,
    pool: EventPool,
    durable: Option<Arc<dyn DurableDispatcher>>,
}

impl Runtime {
    pub fn builder(registry: Arc<TopicRegistry>) -> RuntimeBuilder {
        RuntimeBuilder {
            registry,
            pool_config: PoolConfig::default(),
            failure_handler: None,
            durable: None,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Whether an emission on this topic for this operation would reach any
    /// consumer of this runtime.
    pub fn interested_in(&self, topic: &str, operation: Operation) -> bool {
        self.registry.interested_in(topic, operation)
    }

    /// Typed emit: encode the payload with the topic's codec and route by the
    /// topic's registered policy.
    pub async fn emit<P: 'static>(
        &self,
        topic: &Topic<P>,
        payload: &P,
        headers: Headers,
    ) -> Result<Emitted, DispatchError> {
        let raw = self.registry.encode(&topic.name, payload)?;
        let envelope = Envelope::new(topic.name.clone(), raw, headers);

        let policy = self
            .registry
            .policy(&topic.name)
            .unwrap_or_default();

        match policy.emit_mode {
            EmitMode::Durable => Ok(Emitted::Durable(self.dispatch_durable(&envelope).await?)),
            EmitMode::Immediate => Ok(Emitted::Inline(self.emit_inline(&envelope, None).await?)),
        }
    }

    /// Deliver an envelope inline through the pool to every listener that
    /// matches the operation. Best-effort: listener failures come back as
    /// data, not as an error.
    pub async fn emit_inline(
        &self,
        envelope: &Envelope,
        operation: Option<Operation>,
    ) -> Result<Vec<ListenerFailure>, DispatchError> {
        let listeners = self.registry.listeners_for(&envelope.topic, operation);
        if listeners.is_empty() {
            debug!(topic = %envelope.topic, "no inline listeners; dropping envelope");
            return Ok(Vec::new());
        }

        let context = ListenerContext {
            topic: envelope.topic.clone(),
            event_id: Some(envelope.id),
            headers: envelope.headers.clone(),
            flags: envelope.flags,
        };

        self.pool.deliver(context, &envelope.payload, listeners).await
    }

    /// Hand an envelope to the durable store under its topic's policy.
    pub async fn dispatch_durable(
        &self,
        envelope: &Envelope,
    ) -> Result<EmitReceipt, DispatchError> {
        let durable = self
            .durable
            .as_ref()
            .ok_or(DispatchError::RuntimeUnavailable)?;

        let policy = self
            .registry
            .policy(&envelope.topic)
            .unwrap_or_else(TopicPolicy::durable);

        durable.dispatch_durable(envelope, &policy).await
    }

    /// Consume a claimed envelope on the worker side: decode it with the
    /// registered codec and run the matching listeners inline.
    pub async fn consume(
        &self,
        envelope: &Envelope,
        operation: Option<Operation>,
    ) -> Result<Vec<ListenerFailure>, DispatchError> {
        self.emit_inline(envelope, operation).await
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutbox;
    use crate::registry::{Definition, Registration};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    fn immediate_topic() -> Topic<Ping> {
        Topic::new("runtime.test.ping")
    }

    fn durable_topic() -> Topic<Ping> {
        Topic::new("runtime.test.ping.durable")
    }

    #[tokio::test]
    async fn typed_emit_routes_immediate_topics_through_the_pool() {
        let registry = Arc::new(TopicRegistry::new());
        registry
            .register(Registration::json(immediate_topic(), TopicPolicy::immediate()))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .attach(Definition::new(
                immediate_topic(),
                "recorder",
                move |_ctx, ping: Ping| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(ping);
                        Ok(())
                    }
                },
            ))
            .unwrap();

        let runtime = Runtime::builder(registry).build();
        let emitted = runtime
            .emit(&immediate_topic(), &Ping { n: 7 }, Headers::new())
            .await
            .unwrap();

        assert!(matches!(emitted, Emitted::Inline(failures) if failures.is_empty()));
        assert_eq!(*seen.lock().unwrap(), vec![Ping { n: 7 }]);
    }

    #[tokio::test]
    async fn typed_emit_routes_durable_topics_to_the_store() {
        let registry = Arc::new(TopicRegistry::new());
        registry
            .register(Registration::json(durable_topic(), TopicPolicy::durable()))
            .unwrap();

        let outbox = Arc::new(MemoryOutbox::new());
        let runtime = Runtime::builder(registry)
            .durable(Arc::clone(&outbox) as Arc<dyn DurableDispatcher>)
            .build();

        let emitted = runtime
            .emit(&durable_topic(), &Ping { n: 1 }, Headers::new())
            .await
            .unwrap();

        let Emitted::Durable(receipt) = emitted else {
            panic!("expected a durable receipt");
        };
        assert_eq!(receipt.topic, "runtime.test.ping.durable");
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn consume_replays_a_stored_envelope_to_listeners() {
        let registry = Arc::new(TopicRegistry::new());
        registry
            .register(Registration::json(durable_topic(), TopicPolicy::durable()))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .attach(Definition::new(
                durable_topic(),
                "worker",
                move |_ctx, ping: Ping| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(ping);
                        Ok(())
                    }
                },
            ))
            .unwrap();

        let outbox = Arc::new(MemoryOutbox::new());
        let runtime = Runtime::builder(registry)
            .durable(Arc::clone(&outbox) as Arc<dyn DurableDispatcher>)
            .build();

        runtime
            .emit(&durable_topic(), &Ping { n: 42 }, Headers::new())
            .await
            .unwrap();

        // worker side: claim the stored envelope and replay it
        let stored = outbox.envelopes();
        let failures = runtime.consume(&stored[0], None).await.unwrap();

        assert!(failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![Ping { n: 42 }]);
    }

    #[tokio::test]
    async fn closed_runtime_rejects_inline_emission() {
        let registry = Arc::new(TopicRegistry::new());
        registry
            .register(Registration::json(immediate_topic(), TopicPolicy::immediate()))
            .unwrap();
        registry
            .attach(Definition::new(immediate_topic(), "noop", |_, _: Ping| {
                async { Ok(()) }
            }))
            .unwrap();

        let runtime = Runtime::builder(registry).build();
        runtime.close();

        let envelope = Envelope::new(
            "runtime.test.ping",
            serde_json::json!({"n": 1}),
            Headers::new(),
        );
        let err = runtime.emit_inline(&envelope, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::PoolClosed));
    }

    #[tokio::test]
    async fn durable_dispatch_without_a_store_is_unavailable() {
        let registry = Arc::new(TopicRegistry::new());
        registry
            .register(Registration::json(durable_topic(), TopicPolicy::durable()))
            .unwrap();

        let runtime = Runtime::builder(registry).build();
        let envelope = Envelope::new(
            "runtime.test.ping.durable",
            serde_json::json!({"n": 1}),
            Headers::new(),
        );

        let err = runtime.dispatch_durable(&envelope).await.unwrap_err();
        assert!(matches!(err, DispatchError::RuntimeUnavailable));
    }
}
