//! The compact message envelope (spec §6.1): `{n, v, s, p}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::position::Position;
use crate::workflow::state::NodeState;

/// A correlation back-pointer, carried on messages that start or complete
/// a sub-workflow, a fork branch, or an external-event wait.
///
/// The parent's own envelope travels with the dispatched message rather
/// than living in a side table: the consumer needs nothing but the
/// delivered message to resume the parent once the child returns, matching
/// the rest of this system's "state travels in the envelope" design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    /// Opaque id of the parent workflow instance.
    pub parent_instance_id: String,
    /// The parent's suspended position, so its `WorkflowInstance` can be
    /// rehydrated and resumed once this message completes.
    pub parent_position: String,
    /// The parent's envelope at the moment it suspended, encoded. Resuming
    /// means decoding this, applying the child's output at `parent_position`
    /// (and `branch_index`, for a fork branch), then running one more step.
    pub parent_envelope: String,
    /// Which fork branch this message represents, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
}

/// The wire envelope. Field names are deliberately short (spec: "a compact
/// encoding") since this is what crosses the broker on every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Workflow name.
    pub n: String,
    /// Workflow version.
    pub v: String,
    /// `Position` (as a JSON-Pointer string) to `NodeState`.
    pub s: HashMap<String, NodeState>,
    /// Current position, as a JSON-Pointer string.
    pub p: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Correlation>,

    /// The instance id, carried so completion messages can be correlated
    /// back without a separate side-channel lookup.
    pub instance_id: String,
}

impl Message {
    pub fn states_map(&self) -> HashMap<Position, NodeState> {
        self.s
            .iter()
            .map(|(k, v)| (Position::from_pointer(k), v.clone()))
            .collect()
    }

    pub fn position(&self) -> Position {
        Position::from_pointer(&self.p)
    }

    pub fn from_states(
        instance_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        states: &HashMap<Position, NodeState>,
        position: &Position,
        correlation: Option<Correlation>,
    ) -> Self {
        Message {
            n: name.into(),
            v: version.into(),
            s: states
                .iter()
                .map(|(k, v)| (k.to_pointer(), v.clone()))
                .collect(),
            p: position.to_pointer(),
            correlation,
            instance_id: instance_id.into(),
        }
    }

    /// Serialize to the wire format. Encoding is plain JSON; brokers that
    /// need a binary envelope wrap this at their own boundary.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(bytes: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_bit_identical_on_recognised_fields() {
        let mut states = HashMap::new();
        let pos = Position::root().child_name("do");
        let mut state = NodeState::new();
        state.set_raw_output(json!(1));
        states.insert(pos.clone(), state);

        let msg = Message::from_states("inst-1", "greet", "1.0", &states, &pos, None);
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded.n, msg.n);
        assert_eq!(decoded.v, msg.v);
        assert_eq!(decoded.p, msg.p);
        assert_eq!(decoded.instance_id, msg.instance_id);
    }

    #[test]
    fn unknown_state_fields_survive_round_trip() {
        let mut state = NodeState::new();
        state.unknown.insert("futureField".into(), json!(42));
        let mut states = HashMap::new();
        let pos = Position::root();
        states.insert(pos.clone(), state);

        let msg = Message::from_states("inst-1", "wf", "1.0", &states, &pos, None);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let restored = decoded.states_map();
        assert_eq!(
            restored.get(&pos).unwrap().unknown.get("futureField"),
            Some(&json!(42))
        );
    }
}
