//! `RaiseInstance` (spec §4.3.6).

use crate::expr::{eval, Scope};
use crate::workflow::error::{ErrorKind, WorkflowError};
use crate::workflow::task::RaiseTask;

/// Build the `WorkflowError` a raise task throws. `title`/`detail` may
/// themselves be `${...}` expressions.
pub fn execute(task: &RaiseTask, scope: &Scope) -> WorkflowError {
    let kind = kind_from_type_uri(&task.raise.error_type);
    let title = resolve(&task.raise.title, scope);
    let mut error = WorkflowError::new(kind, title);
    if let Some(status) = task.raise.status {
        error = error.with_status(status);
    }
    if let Some(detail) = &task.raise.detail {
        error = error.with_detail(resolve(detail, scope));
    }
    error
}

fn resolve(text: &str, scope: &Scope) -> String {
    match text.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        Some(expr) => eval(expr, scope)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| text.to_string()),
        None => text.to_string(),
    }
}

fn kind_from_type_uri(type_uri: &str) -> ErrorKind {
    let suffix = type_uri.rsplit('/').next().unwrap_or(type_uri);
    match suffix {
        "configuration" => ErrorKind::Configuration,
        "validation" => ErrorKind::Validation,
        "expression" => ErrorKind::Expression,
        "authentication" => ErrorKind::Authentication,
        "authorization" => ErrorKind::Authorization,
        "timeout" => ErrorKind::Timeout,
        "communication" => ErrorKind::Communication,
        _ => ErrorKind::Runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::TaskBase;
    use serde_json::json;

    #[test]
    fn builds_error_from_static_fields() {
        let task = RaiseTask {
            base: TaskBase::default(),
            raise: crate::workflow::task::RaiseSpec {
                error_type: "https://serverlessworkflow.io/dsl/errors/types/validation"
                    .to_string(),
                title: "bad input".to_string(),
                status: Some(422),
                detail: None,
            },
        };
        let scope = Scope::new(json!(null));
        let err = execute(&task, &scope);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.status, 422);
    }
}
