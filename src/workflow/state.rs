//! Per-node, serialisable state slice (spec §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::error::WorkflowError;

/// The mutable state a single node accumulates across its lifetime. Carried
/// verbatim in the message envelope's `states` map so a step can be resumed
/// without replaying anything before `currentPosition`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeState {
    #[serde(default, rename = "rawInput", skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,

    #[serde(
        default,
        rename = "transformedInput",
        skip_serializing_if = "Option::is_none"
    )]
    pub transformed_input: Option<Value>,

    #[serde(default, rename = "rawOutput", skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,

    #[serde(
        default,
        rename = "transformedOutput",
        skip_serializing_if = "Option::is_none"
    )]
    pub transformed_output: Option<Value>,

    /// Exported via `export.as`; always an object, written only there.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    /// Loop item/index, the bound caught error, and similar ephemeral
    /// bindings a node's children need from their parent's scope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,

    #[serde(default, rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, rename = "attemptCount")]
    pub attempt_count: u32,

    /// The last error raised at or below this node, kept so a Try can
    /// re-evaluate its catch filter after resuming from a RETRY outbox row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_error: Option<WorkflowError>,

    /// Fields present on the wire but not recognised by this build; kept
    /// so a round trip never drops data (spec §6.1 backward compatibility).
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl NodeState {
    pub fn new() -> Self {
        NodeState::default()
    }

    /// Invariant 1: `transformedOutput` implies `rawOutput`.
    pub fn is_valid(&self) -> bool {
        if self.transformed_output.is_some() && self.raw_output.is_none() {
            return false;
        }
        if !self.context.is_null() && !self.context.is_object() {
            return false;
        }
        true
    }

    pub fn set_raw_output(&mut self, value: Value) {
        self.raw_output = Some(value);
    }

    pub fn set_transformed_output(&mut self, value: Value) {
        debug_assert!(self.raw_output.is_some());
        self.transformed_output = Some(value);
    }

    pub fn merge_context(&mut self, exported: Value) {
        debug_assert!(exported.is_object());
        if self.context.is_null() {
            self.context = serde_json::json!({});
        }
        if let (Some(existing), Some(new)) = (self.context.as_object_mut(), exported.as_object())
        {
            for (k, v) in new {
                existing.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_state_is_valid() {
        assert!(NodeState::new().is_valid());
    }

    #[test]
    fn transformed_output_without_raw_output_is_invalid() {
        let mut state = NodeState::new();
        state.transformed_output = Some(json!(1));
        assert!(!state.is_valid());
    }

    #[test]
    fn non_object_context_is_invalid() {
        let mut state = NodeState::new();
        state.context = json!("not an object");
        assert!(!state.is_valid());
    }

    #[test]
    fn merge_context_adds_keys_without_clobbering_others() {
        let mut state = NodeState::new();
        state.merge_context(json!({"a": 1}));
        state.merge_context(json!({"b": 2}));
        assert_eq!(state.context, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn round_trips_preserving_unknown_fields() {
        let mut state = NodeState::new();
        state.set_raw_output(json!(1));
        state
            .unknown
            .insert("futureField".to_string(), json!("kept"));

        let encoded = serde_json::to_value(&state).unwrap();
        let decoded: NodeState = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.unknown.get("futureField"), Some(&json!("kept")));
        assert_eq!(decoded.raw_output, Some(json!(1)));
    }
}
