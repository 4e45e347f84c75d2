//! `EmitInstance` (supplemented, SPEC_FULL §11): constructs the event
//! payload. Handing it to the broker producer is the Consumer's job — the
//! driver surfaces the constructed event in `RunOutcome::emitted` and
//! completes the node immediately with the same value as `rawOutput`.

use serde_json::{Map, Value};

use crate::expr::{eval, Scope};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::EmitTask;

pub fn execute(task: &EmitTask, scope: &Scope) -> Result<Value, WorkflowError> {
    let mut event = Map::new();
    for (key, valuable) in &task.event.with {
        let value = match valuable.as_expression() {
            Some(expr) => eval(expr, scope)?,
            None => valuable.as_literal().clone(),
        };
        event.insert(key.clone(), value);
    }
    Ok(Value::Object(event))
}
