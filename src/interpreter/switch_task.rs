//! `SwitchInstance` (spec §4.3.3).

use serde_json::Value;

use crate::expr::{eval_predicate, Scope};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::Then;

/// Evaluate the case list in order, returning the passthrough output (the
/// task never transforms its input) and the matched case's `then`. The
/// first case with no `when` acts as the default.
pub fn execute(task: &crate::workflow::task::SwitchTask, scope: &Scope) -> Result<(Value, Then), WorkflowError> {
    for case in &task.switch {
        let matched = match &case.when {
            Some(expr) => eval_predicate(expr, scope),
            None => true,
        };
        if matched {
            return Ok((scope_input(scope), case.then.clone()));
        }
    }
    Err(WorkflowError::configuration(
        "switch matched no case and declared no default",
    ))
}

fn scope_input(scope: &Scope) -> Value {
    crate::expr::eval(".", scope).unwrap_or(Value::Null)
}
