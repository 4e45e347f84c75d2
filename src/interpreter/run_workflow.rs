//! `RunWorkflowInstance` (spec §4.3.10): shapes the outbound start message.
//! Suspension (`WAITING` on the correlated child) and resumption when the
//! child's completion message arrives are driven by
//! [`crate::workflow::instance::WorkflowInstance`].

use std::collections::HashMap;

use crate::message::{Correlation, Message};
use crate::position::Position;
use crate::workflow::state::NodeState;
use crate::workflow::task::RunWorkflowTask;

/// Build the message that starts the sub-workflow, carrying a correlation
/// back-pointer to the parent instance and position.
pub fn start_message(
    task: &RunWorkflowTask,
    parent_instance_id: &str,
    parent_position: &Position,
    parent_envelope: &str,
    input: serde_json::Value,
) -> Message {
    let mut root_state = NodeState::new();
    root_state.raw_input = Some(task.input.clone().unwrap_or(input));

    let mut states = HashMap::new();
    states.insert(Position::root(), root_state);

    Message::from_states(
        uuid::Uuid::now_v7().to_string(),
        &task.name,
        &task.version,
        &states,
        &Position::root(),
        Some(Correlation {
            parent_instance_id: parent_instance_id.to_string(),
            parent_position: parent_position.to_pointer(),
            parent_envelope: parent_envelope.to_string(),
            branch_index: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::TaskBase;

    #[test]
    fn start_message_carries_correlation_back_to_parent() {
        let task = RunWorkflowTask {
            base: TaskBase::default(),
            name: "factorial".to_string(),
            version: "1.0".to_string(),
            input: Some(serde_json::json!({"n": 4})),
        };
        let parent_pos = Position::root().child_name("do");
        let msg = start_message(
            &task,
            "parent-1",
            &parent_pos,
            "{}",
            serde_json::Value::Null,
        );

        assert_eq!(msg.n, "factorial");
        let correlation = msg.correlation.unwrap();
        assert_eq!(correlation.parent_instance_id, "parent-1");
        assert_eq!(correlation.parent_position, parent_pos.to_pointer());
    }
}
