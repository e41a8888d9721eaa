//! In-process listener execution with bounded concurrency.
//!
//! The pool is the legacy delivery mechanism: listeners run inline in the
//! emitting process, fanned out onto tasks and throttled by a semaphore so a
//! burst of mutations cannot starve the runtime. Delivery is best-effort;
//! listener failures are logged and reported, never propagated to the
//! mutation that produced the event.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error};

use crate::error::DispatchError;
use crate::registry::{ListenerContext, ListenerSet};

/// A single listener invocation that returned an error or panicked.
#[derive(Debug)]
pub struct ListenerFailure {
    pub topic: String,
    pub listener: String,
    pub error: anyhow::Error,
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum listener invocations running at once, across all emissions.
    pub max_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
        }
    }
}

/// Strategy invoked for each failed listener, after the failure is logged.
pub type FailureHandler = dyn Fn(&ListenerFailure) + Send + Sync;

/// Bounded executor for inline listener delivery.
pub struct EventPool {
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    on_failure: Option<Arc<FailureHandler>>,
}

impl EventPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            on_failure: None,
        }
    }

    /// Install a failure strategy. The default is log-and-continue; a handler
    /// observes failures in addition to the log line and must not panic.
    pub fn with_failure_handler(mut self, handler: Arc<FailureHandler>) -> Self {
        self.on_failure = Some(handler);
        self
    }

    /// Run every listener against the event, bounded by the pool's
    /// concurrency limit, and collect the failures.
    ///
    /// Listeners for one event run concurrently; this call resolves once all
    /// of them have settled.
    pub async fn deliver(
        &self,
        context: ListenerContext,
        payload: &Value,
        listeners: ListenerSet,
    ) -> Result<Vec<ListenerFailure>, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::PoolClosed);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.deliver_inner(context, payload, listeners).await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }

        Ok(result)
    }

    async fn deliver_inner(
        &self,
        context: ListenerContext,
        payload: &Value,
        listeners: ListenerSet,
    ) -> Vec<ListenerFailure> {
        let topic = context.topic.clone();
        debug!(topic = %topic, listeners = listeners.len(), "delivering pool event");

        let mut handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("pool semaphore closed");
            let ctx = context.clone();
            let raw = payload.clone();
            let name = listener.name.clone();
            let handler = listener.handler;

            handles.push((
                name,
                tokio::spawn(async move {
                    let _permit = permit;
                    handler(ctx, &raw).await
                }),
            ));
        }

        let mut failures = Vec::new();
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("listener panicked: {join_err}")),
            };

            if let Err(err) = outcome {
                error!(topic = %topic, listener = %name, error = %err, "pool listener failed");
                let failure = ListenerFailure {
                    topic: topic.clone(),
                    listener: name,
                    error: err,
                };
                if let Some(handler) = &self.on_failure {
                    handler(&failure);
                }
                failures.push(failure);
            }
        }

        failures
    }

    /// Stop accepting new emissions. In-flight deliveries complete.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until no delivery is in flight. Used by shutdown paths and tests
    /// that emit from detached post-commit tasks.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::payload::Headers;
    use crate::registry::{ErasedListener, ListenerSnapshot};
    use serde_json::json;
    use std::sync::Mutex;

    fn context(topic: &str) -> ListenerContext {
        ListenerContext {
            topic: topic.to_string(),
            event_id: None,
            headers: Headers::new(),
            flags: ContextFlags::default(),
        }
    }

    fn snapshot(name: &str, handler: Arc<ErasedListener>) -> ListenerSnapshot {
        ListenerSnapshot {
            name: name.to_string(),
            handler,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_listeners_and_collects_failures() {
        let pool = EventPool::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let ok_seen = Arc::clone(&seen);
        let ok: Arc<ErasedListener> = Arc::new(move |_ctx, raw| {
            let seen = Arc::clone(&ok_seen);
            let raw = raw.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(raw);
                Ok(())
            })
        });
        let failing: Arc<ErasedListener> =
            Arc::new(|_ctx, _raw| Box::pin(async { Err(anyhow::anyhow!("boom")) }));

        let failures = pool
            .deliver(
                context("Organization"),
                &json!({"entity_id": "org-1"}),
                vec![snapshot("ok", ok), snapshot("failing", failing)].into(),
            )
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].listener, "failing");
    }

    #[tokio::test]
    async fn failure_handler_observes_each_failure() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let pool = EventPool::default().with_failure_handler(Arc::new(move |failure| {
            sink.lock().unwrap().push(failure.listener.clone());
        }));

        let failing: Arc<ErasedListener> =
            Arc::new(|_ctx, _raw| Box::pin(async { Err(anyhow::anyhow!("boom")) }));
        pool.deliver(
            context("Organization"),
            &json!({}),
            vec![snapshot("failing", failing)].into(),
        )
        .await
        .unwrap();

        assert_eq!(*observed.lock().unwrap(), vec!["failing".to_string()]);
    }

    #[tokio::test]
    async fn closed_pool_rejects_emission() {
        let pool = EventPool::default();
        pool.close();

        let err = pool
            .deliver(context("Organization"), &json!({}), ListenerSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PoolClosed));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let pool = EventPool::new(PoolConfig { max_concurrency: 2 });
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut listeners = Vec::new();
        for n in 0..8 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let handler: Arc<ErasedListener> = Arc::new(move |_ctx, _raw| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(fastrand::u64(5..15))).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            listeners.push(snapshot(&format!("listener-{n}"), handler));
        }

        let failures = pool
            .deliver(context("Organization"), &json!({}), listeners.into())
            .await
            .unwrap();

        assert!(failures.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn wait_idle_returns_once_deliveries_settle() {
        let pool = Arc::new(EventPool::default());

        let handler: Arc<ErasedListener> = Arc::new(|_ctx, _raw| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(())
            })
        });

        let delivering = Arc::clone(&pool);
        let task = tokio::spawn(async move {
            delivering
                .deliver(context("Organization"), &json!({}), vec![snapshot("slow", handler)].into())
                .await
                .unwrap()
        });

        task.await.unwrap();
        pool.wait_idle().await;
    }
}
