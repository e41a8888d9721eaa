//! Dispatch configuration and per-entity delivery mode resolution.
//!
//! Migration from inline pool delivery to the durable outbox happens per
//! entity type. The resolution order is: outbox master switch, then the
//! allow-list, then an explicit per-entity mode, then the dual-emit default.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;

/// How a committed mutation on one entity type is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    /// Inline pool delivery only.
    LegacyOnly,
    /// Durable enqueue and inline delivery, for migration soak.
    DualEmit,
    /// Durable enqueue only; inline is a fallback on enqueue failure.
    V2Only,
}

fn default_true() -> bool {
    true
}

/// Configuration for the mutation dispatch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Master switch for the durable outbox. Off means every entity type is
    /// [`TopicMode::LegacyOnly`].
    #[serde(default)]
    pub mutation_outbox_enabled: bool,

    /// Escalate a failed durable enqueue to an error-level log. The inline
    /// fallback still runs either way; a mutation that committed is never
    /// left without a delivery attempt.
    #[serde(default)]
    pub mutation_outbox_fail_on_enqueue_error: bool,

    /// Entity types eligible for the outbox. Empty means all.
    #[serde(default)]
    pub mutation_outbox_topics: BTreeSet<String>,

    /// Default to [`TopicMode::DualEmit`] for outbox-eligible entity types
    /// without an explicit mode.
    #[serde(default)]
    pub dual_emit_enabled: bool,

    /// Explicit per-entity-type overrides.
    #[serde(default)]
    pub topic_modes: BTreeMap<String, TopicMode>,

    /// Entity types whose hard deletes are mirrored by a soft-delete update.
    /// Raw delete operations on these types are suppressed; the paired update
    /// path emits the delete-shaped event.
    #[serde(default)]
    pub soft_delete_mirrored_types: BTreeSet<String>,

    /// Emit on the `workflow.mutation.*` concern topics.
    #[serde(default = "default_true")]
    pub workflow_listeners_enabled: bool,

    #[serde(skip)]
    pub pool: PoolConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mutation_outbox_enabled: false,
            mutation_outbox_fail_on_enqueue_error: false,
            mutation_outbox_topics: BTreeSet::new(),
            dual_emit_enabled: false,
            topic_modes: BTreeMap::new(),
            soft_delete_mirrored_types: BTreeSet::new(),
            workflow_listeners_enabled: true,
            pool: PoolConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Resolve the delivery mode for one entity type.
    pub fn effective_topic_mode(&self, entity_type: &str) -> TopicMode {
        if !self.mutation_outbox_enabled {
            return TopicMode::LegacyOnly;
        }

        if !self.mutation_outbox_topics.is_empty()
            && !self.mutation_outbox_topics.contains(entity_type)
        {
            return TopicMode::LegacyOnly;
        }

        if let Some(mode) = self.topic_modes.get(entity_type) {
            return *mode;
        }

        if self.dual_emit_enabled {
            TopicMode::DualEmit
        } else {
            TopicMode::V2Only
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_disabled_means_legacy_everywhere() {
        let config = DispatchConfig::default();
        assert_eq!(
            config.effective_topic_mode("Organization"),
            TopicMode::LegacyOnly
        );
    }

    #[test]
    fn allow_list_miss_falls_back_to_legacy() {
        let config = DispatchConfig {
            mutation_outbox_enabled: true,
            mutation_outbox_topics: ["Organization".to_string()].into(),
            ..DispatchConfig::default()
        };

        assert_eq!(
            config.effective_topic_mode("Organization"),
            TopicMode::V2Only
        );
        assert_eq!(config.effective_topic_mode("Control"), TopicMode::LegacyOnly);
    }

    #[test]
    fn explicit_mode_overrides_the_dual_emit_default() {
        let config = DispatchConfig {
            mutation_outbox_enabled: true,
            dual_emit_enabled: true,
            topic_modes: [("Organization".to_string(), TopicMode::V2Only)].into(),
            ..DispatchConfig::default()
        };

        assert_eq!(
            config.effective_topic_mode("Organization"),
            TopicMode::V2Only
        );
        assert_eq!(config.effective_topic_mode("Control"), TopicMode::DualEmit);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: DispatchConfig = serde_json::from_str(
            r#"{
                "mutation_outbox_enabled": true,
                "topic_modes": {"Organization": "dual_emit"}
            }"#,
        )
        .unwrap();

        assert!(config.mutation_outbox_enabled);
        assert!(config.workflow_listeners_enabled);
        assert_eq!(config.pool.max_concurrency, 100);
        assert_eq!(
            config.effective_topic_mode("Organization"),
            TopicMode::DualEmit
        );
    }
}
