//! Typed topics, codecs, and delivery policies.
//!
//! A [`Topic`] binds a runtime-routable name to a concrete payload type at
//! registration time, so listener payloads are checked at compile time while
//! routing stays by name.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// A named logical channel carrying payloads of type `P`.
#[derive(Debug)]
pub struct Topic<P> {
    pub name: String,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Topic<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _payload: PhantomData,
        }
    }
}

impl<P> Clone for Topic<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

/// Encodes and decodes a topic's payload for envelope transport.
pub trait Codec<P>: Send + Sync {
    fn encode(&self, payload: &P) -> Result<Value, CodecError>;
    fn decode(&self, raw: &Value) -> Result<P, CodecError>;
}

/// JSON codec; sufficient for every mutation topic.
pub struct JsonCodec<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> Default for JsonCodec<P> {
    fn default() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<P> JsonCodec<P> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P> Codec<P> for JsonCodec<P>
where
    P: Serialize + DeserializeOwned,
{
    fn encode(&self, payload: &P) -> Result<Value, CodecError> {
        serde_json::to_value(payload).map_err(CodecError::Encode)
    }

    fn decode(&self, raw: &Value) -> Result<P, CodecError> {
        serde_json::from_value(raw.clone()).map_err(CodecError::Decode)
    }
}

/// How a topic's envelopes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitMode {
    /// Delivered inline through the in-process event pool.
    Immediate,
    /// Persisted to the durable outbox for an out-of-process worker.
    Durable,
}

/// Delivery policy attached at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPolicy {
    pub emit_mode: EmitMode,
    /// Queue the durable job is enqueued onto.
    #[serde(default = "default_queue_class")]
    pub queue_class: String,
}

fn default_queue_class() -> String {
    "default".to_string()
}

impl Default for TopicPolicy {
    fn default() -> Self {
        Self {
            emit_mode: EmitMode::Immediate,
            queue_class: default_queue_class(),
        }
    }
}

impl TopicPolicy {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn durable() -> Self {
        Self {
            emit_mode: EmitMode::Durable,
            queue_class: default_queue_class(),
        }
    }

    pub fn with_queue_class(mut self, queue_class: impl Into<String>) -> Self {
        self.queue_class = queue_class.into();
        self
    }
}
