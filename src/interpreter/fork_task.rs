//! `ForkInstance` (supplemented, SPEC_FULL §11): branch-position shaping
//! and fan-in completion rules. The actual dispatch of one message per
//! branch and bookkeeping of returned branch outputs is driven by
//! [`crate::workflow::instance::WorkflowInstance`], since it needs the
//! compiled graph and the instance's states map.

use serde_json::Value;

use crate::position::{Position, Token};

/// The canonical position of the `i`th branch of the fork at `fork_position`.
pub fn branch_position(fork_position: &Position, index: usize, name: &str) -> Position {
    fork_position
        .child_token(Token::Fork)
        .child_index(index)
        .child_name(name)
}

/// Whether the fork is done waiting on its branches.
///
/// `compete: true` completes as soon as any branch completes (the rest are
/// abandoned without a cancellation signal — spec Non-goals rule out
/// distributed consensus). `compete: false` fans in, needing every branch.
pub fn is_satisfied(compete: bool, completed: usize, total: usize) -> bool {
    if compete {
        completed >= 1
    } else {
        completed >= total
    }
}

/// The fork's `rawOutput` once satisfied: the winning branch's output alone
/// under `compete: true`, or every branch's output in declaration order
/// under `compete: false`.
pub fn collect_output(compete: bool, branch_outputs: &[Option<Value>]) -> Value {
    if compete {
        branch_outputs
            .iter()
            .find_map(|o| o.clone())
            .unwrap_or(Value::Null)
    } else {
        Value::Array(
            branch_outputs
                .iter()
                .map(|o| o.clone().unwrap_or(Value::Null))
                .collect(),
        )
    }
}
