//! Opaque edit steps
//!
//! A step is an atomic document edit produced by the external rich-text
//! model. The relay never interprets step payloads; it only inspects the
//! optional `from`/`to` range fields for boundary validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single serialized edit step.
///
/// The payload is owned by the document-model collaborator. Composition,
/// inversion and application all happen on the other side of the
/// `StepApplier` seam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(Value);

impl Step {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Raw JSON payload.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Start of the step's range, if the payload carries one.
    pub fn from_pos(&self) -> Option<u64> {
        self.0.get("from").and_then(Value::as_u64)
    }

    /// End of the step's range, if the payload carries one.
    pub fn to_pos(&self) -> Option<u64> {
        self.0.get("to").and_then(Value::as_u64)
    }
}

impl From<Value> for Step {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
