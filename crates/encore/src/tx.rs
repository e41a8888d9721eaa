//! Post-commit callback gating.
//!
//! The persistence layer owns the real database transaction. It hands the
//! interceptor a [`TxHandle`] and resolves it after the COMMIT or ROLLBACK
//! completes. Callbacks registered before resolution run, in registration
//! order, only on commit; a rollback discards them all.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

enum TxState {
    Open(Vec<CommitCallback>),
    Resolved,
}

/// Handle to an in-flight transaction's post-commit callback queue.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct TxHandle {
    state: Arc<Mutex<TxState>>,
}

impl TxHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TxState::Open(Vec::new()))),
        }
    }

    /// Register a callback to run after a successful commit. Returns `false`
    /// when the transaction has already been resolved; the caller then
    /// decides whether to run the work inline.
    pub fn on_commit<F, Fut>(&self, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().expect("tx state lock poisoned");
        match &mut *state {
            TxState::Open(callbacks) => {
                callbacks.push(Box::new(move || Box::pin(callback())));
                true
            }
            TxState::Resolved => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            *self.state.lock().expect("tx state lock poisoned"),
            TxState::Resolved
        )
    }

    /// Run all registered callbacks in registration order. Call only after
    /// the database COMMIT has succeeded. Idempotent: a second call is a
    /// no-op.
    pub async fn commit(&self) {
        let callbacks = {
            let mut state = self.state.lock().expect("tx state lock poisoned");
            match std::mem::replace(&mut *state, TxState::Resolved) {
                TxState::Open(callbacks) => callbacks,
                TxState::Resolved => Vec::new(),
            }
        };

        for callback in callbacks {
            callback().await;
        }
    }

    /// Discard all registered callbacks. Call after a ROLLBACK.
    pub fn rollback(&self) {
        let mut state = self.state.lock().expect("tx state lock poisoned");
        *state = TxState::Resolved;
    }
}

impl Default for TxHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn commit_runs_callbacks_in_registration_order() {
        let tx = TxHandle::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            assert!(tx.on_commit(move || async move {
                order.lock().unwrap().push(n);
            }));
        }

        tx.commit().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn rollback_discards_callbacks() {
        let tx = TxHandle::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        tx.on_commit(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.rollback();
        tx.commit().await; // resolved; nothing left to run
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_commit_after_resolution_is_rejected() {
        let tx = TxHandle::new();
        tx.commit().await;

        assert!(!tx.on_commit(|| async {}));
        assert!(tx.is_resolved());
    }
}
