//! `SetInstance` (spec §4.3.5).

use serde_json::{Map, Value};

use crate::expr::{eval, Scope};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::SetTask;

/// Evaluate every `set` entry against `scope`, returning the resulting
/// object (optionally shallow-merged over `transformed_input`).
pub fn execute(
    task: &SetTask,
    transformed_input: &Value,
    scope: &Scope,
) -> Result<Value, WorkflowError> {
    let mut object = Map::new();
    for (key, valuable) in &task.set {
        let value = match valuable.as_expression() {
            Some(expr) => eval(expr, scope)?,
            None => valuable.as_literal().clone(),
        };
        object.insert(key.clone(), value);
    }

    let mut result = Value::Object(object);
    if task.merge {
        if let (Value::Object(base), Value::Object(overlay)) =
            (transformed_input.clone(), result.clone())
        {
            let mut merged = base;
            for (k, v) in overlay {
                merged.insert(k, v);
            }
            result = Value::Object(merged);
        }
    }
    Ok(result)
}
