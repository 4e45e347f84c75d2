//! `RunScriptInstance` / `RunShellInstance` (spec §4.3.9).

use serde_json::{json, Value};
use tokio::process::Command;

use crate::expr::{eval, Scope};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::{ReturnMode, RunTask, Valuable};

/// Launch the subprocess described by `task`. `shell` selects between the
/// `run/shell` (a `command` line run through `sh -c`) and `run/script`
/// (`language` + `code`, dispatched to the matching interpreter binary)
/// forms; both share argument/return semantics.
pub async fn execute(task: &RunTask, scope: &Scope, shell: bool) -> Result<Value, WorkflowError> {
    if !task.await_completion {
        spawn_detached(task, scope, shell)?;
        return Ok(Value::String(String::new()));
    }

    let mut command = build_command(task, scope, shell)?;
    let output = command
        .output()
        .await
        .map_err(|e| WorkflowError::runtime(format!("failed to launch subprocess: {e}")))?;

    Ok(shape_output(task.return_mode, &output))
}

fn spawn_detached(task: &RunTask, scope: &Scope, shell: bool) -> Result<(), WorkflowError> {
    let mut command = build_command(task, scope, shell)?;
    command
        .spawn()
        .map_err(|e| WorkflowError::runtime(format!("failed to spawn detached subprocess: {e}")))?;
    Ok(())
}

fn build_command(task: &RunTask, scope: &Scope, shell: bool) -> Result<Command, WorkflowError> {
    let mut command = if shell {
        let line = task
            .command
            .as_deref()
            .ok_or_else(|| WorkflowError::configuration("run/shell requires `command`"))?;
        let mut c = Command::new("sh");
        c.arg("-c").arg(resolve_str(line, scope)?);
        c
    } else {
        let interpreter = match task.language.as_deref() {
            Some("python") => "python3",
            Some("js") | Some("javascript") | None => "node",
            Some(other) => {
                return Err(WorkflowError::configuration(format!(
                    "unsupported run/script language `{other}`"
                )))
            }
        };
        let code = task
            .code
            .as_deref()
            .ok_or_else(|| WorkflowError::configuration("run/script requires `code`"))?;
        let mut c = Command::new(interpreter);
        c.arg("-c").arg(resolve_str(code, scope)?);
        c
    };

    for (key, valuable) in &task.arguments {
        let value = resolve_valuable(valuable, scope)?;
        command.arg(resolve_str(key, scope)?);
        command.arg(to_arg_string(&value));
    }
    for (key, valuable) in &task.environment {
        let value = resolve_valuable(valuable, scope)?;
        command.env(key, to_arg_string(&value));
    }
    Ok(command)
}

fn shape_output(mode: ReturnMode, output: &std::process::Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    match mode {
        ReturnMode::Stdout => json!(stdout),
        ReturnMode::Stderr => json!(stderr),
        ReturnMode::Code => json!(code),
        ReturnMode::None => Value::Null,
        ReturnMode::All => json!({
            "stdout": stdout,
            "stderr": stderr,
            "code": code,
        }),
    }
}

fn resolve_valuable(valuable: &Valuable, scope: &Scope) -> Result<Value, WorkflowError> {
    match valuable.as_expression() {
        Some(expr) => Ok(eval(expr, scope)?),
        None => Ok(valuable.as_literal().clone()),
    }
}

fn resolve_str(text: &str, scope: &Scope) -> Result<String, WorkflowError> {
    match text.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        Some(expr) => Ok(to_arg_string(&eval(expr, scope)?)),
        None => Ok(text.to_string()),
    }
}

fn to_arg_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
