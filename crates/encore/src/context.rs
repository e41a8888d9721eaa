//! Ambient request context for the emission path.
//!
//! The interceptor receives one [`DispatchContext`] per mutation. Everything
//! an emission needs is copied out of it up front, so dispatch never holds a
//! reference back into the request: a client disconnect or request timeout
//! cannot abort best-effort post-commit delivery.

use serde::{Deserialize, Serialize};

use crate::tx::TxHandle;

/// Flags that travel with an emitted event, detached from the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFlags {
    /// The mutation ran under a workflow bypass; trigger matching is skipped
    /// unless emission is explicitly allow-listed.
    #[serde(default)]
    pub workflow_bypass: bool,
    /// Explicit allow-list marker overriding `workflow_bypass`.
    #[serde(default)]
    pub allow_workflow_emission: bool,
}

/// Per-mutation ambient context handed to the interceptor.
#[derive(Clone, Default)]
pub struct DispatchContext {
    /// Suppress emission entirely, used for secondary/cascading writes that
    /// would otherwise double-emit.
    pub skip_emission: bool,
    /// Request-shape override: this update must be reported as a soft delete.
    pub soft_delete: bool,
    pub flags: ContextFlags,
    /// Transaction handle when the mutation executes inside a transaction;
    /// emission is then gated on commit.
    pub tx: Option<TxHandle>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(mut self, tx: TxHandle) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn skipping_emission(mut self) -> Self {
        self.skip_emission = true;
        self
    }

    pub fn as_soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn with_workflow_bypass(mut self) -> Self {
        self.flags.workflow_bypass = true;
        self
    }

    pub fn allowing_workflow_emission(mut self) -> Self {
        self.flags.allow_workflow_emission = true;
        self
    }
}
