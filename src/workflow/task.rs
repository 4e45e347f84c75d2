//! The parsed task tree: the shape a workflow definition takes before it is
//! compiled into a [`Node`](super::node::Node) graph.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reliability::RetryPolicy;

/// Fields every task carries regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskBase {
    #[serde(default, rename = "input")]
    pub input: Option<IoSpec>,
    #[serde(default, rename = "output")]
    pub output: Option<IoSpec>,
    #[serde(default, rename = "export")]
    pub export: Option<ExportSpec>,
    #[serde(default)]
    pub then: Option<Then>,
}

/// `input.from` / `output.as`, each an expression string plus an optional
/// JSON Schema to validate against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IoSpec {
    #[serde(default, rename = "from")]
    pub from: Option<String>,
    #[serde(default, rename = "as")]
    pub as_expr: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// `export.as`: an expression producing the object merged into `context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSpec {
    #[serde(rename = "as")]
    pub as_expr: String,
}

/// The `then` directive resolved at the end of `complete()` (spec §4.3.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThenKeyword {
    Continue,
    End,
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Then {
    Keyword(ThenKeyword),
    /// A named sibling to jump to within the current scope.
    Named(String),
}

/// A value that is either a literal JSON value or a JQ expression string
/// (spec §4.3.5: "only values syntactically marked as expressions are
/// evaluated"). Expressions are written wrapped in `${ ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Valuable {
    Literal(Value),
}

impl Valuable {
    /// Returns the JQ expression source if this value is an expression
    /// (`${...}`), or `None` if it is a plain literal.
    pub fn as_expression(&self) -> Option<&str> {
        match self {
            Valuable::Literal(Value::String(s)) => {
                s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}'))
            }
            _ => None,
        }
    }

    pub fn as_literal(&self) -> &Value {
        match self {
            Valuable::Literal(v) => v,
        }
    }
}

/// The `Task` variant tree (spec §3). Composite variants hold their
/// children as nested `Task`s; the compile pass in [`super::node`] turns
/// this into an immutable, flat-indexed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Do(DoTask),
    For(ForTask),
    Switch(SwitchTask),
    Try(TryTask),
    Set(SetTask),
    Raise(RaiseTask),
    Wait(WaitTask),
    CallHttp(CallHttpTask),
    RunScript(RunTask),
    RunShell(RunTask),
    RunWorkflow(RunWorkflowTask),
    Emit(EmitTask),
    Listen(ListenTask),
    Fork(ForkTask),
}

/// A named entry in a `do` list: `{ name: task }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTask {
    pub name: String,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoTask {
    #[serde(flatten)]
    pub base: TaskBase,
    #[serde(rename = "do")]
    pub children: Vec<NamedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForTask {
    #[serde(flatten)]
    pub base: TaskBase,
    /// Expression producing the iterable.
    #[serde(rename = "in")]
    pub in_expr: String,
    /// Binding name for the current item; defaults to `item`.
    #[serde(default = "default_each")]
    pub each: String,
    /// Binding name for the zero-based index; defaults to `index`.
    #[serde(default = "default_at")]
    pub at: String,
    /// Predicate evaluated at the start of every iteration.
    #[serde(default, rename = "while")]
    pub while_expr: Option<String>,
    #[serde(rename = "do")]
    pub children: Vec<NamedTask>,
}

fn default_each() -> String {
    "item".to_string()
}

fn default_at() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub name: String,
    #[serde(default)]
    pub when: Option<String>,
    pub then: Then,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub switch: Vec<SwitchCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFilter {
    /// Matched against `WorkflowError.error_type`; `*` suffix means prefix
    /// match (glob on the type URI, per spec §7).
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatchSpec {
    #[serde(default)]
    pub errors: Option<ErrorFilter>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "exceptWhen")]
    pub except_when: Option<String>,
    /// Binding name for the caught error; defaults to `error`.
    #[serde(default = "default_error_as")]
    pub as_name: String,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default, rename = "do")]
    pub children: Vec<NamedTask>,
}

fn default_error_as() -> String {
    "error".to_string()
}

/// The retry clause's backoff and limits, before being turned into a
/// [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default)]
    pub limit_attempt_count: Option<u32>,
    #[serde(default)]
    pub limit_attempt_duration: Option<Duration>,
    #[serde(default)]
    pub limit_duration: Option<Duration>,
    #[serde(default)]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub backoff: Option<crate::reliability::Backoff>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "exceptWhen")]
    pub except_when: Option<String>,
}

impl RetrySpec {
    pub fn to_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        policy.backoff = self.backoff.unwrap_or(policy.backoff);
        // `limit.attempt.count` counts retries, not total executions, but
        // `RetryPolicy::max_attempts` counts the initial attempt too.
        policy.max_attempts = self
            .limit_attempt_count
            .map(|n| n + 1)
            .unwrap_or(policy.max_attempts);
        if let Some(delay) = self.delay {
            policy.initial_interval = delay;
            if matches!(policy.backoff, crate::reliability::Backoff::Constant) {
                policy.max_interval = delay;
            }
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter.clamp(0.0, 1.0);
        }
        policy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryTask {
    #[serde(flatten)]
    pub base: TaskBase,
    #[serde(rename = "try")]
    pub children: Vec<NamedTask>,
    pub catch: CatchSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub set: BTreeMap<String, Valuable>,
    /// If true, shallow-merge `set`'s result over `transformedInput` rather
    /// than replacing it outright.
    #[serde(default)]
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub raise: RaiseSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseSpec {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTask {
    #[serde(flatten)]
    pub base: TaskBase,
    /// Either a structured duration object or an ISO-8601 duration string;
    /// parsed in [`crate::interpreter::wait_task`].
    pub wait: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpOutput {
    Content,
    Raw,
    Response,
}

impl Default for HttpOutput {
    fn default() -> Self {
        HttpOutput::Content
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHttpTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, Valuable>,
    #[serde(default)]
    pub headers: BTreeMap<String, Valuable>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub authentication: Option<crate::auth::AuthPolicy>,
    #[serde(default)]
    pub output: HttpOutput,
    #[serde(default)]
    pub redirect: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
    Stdout,
    Stderr,
    Code,
    All,
    None,
}

impl Default for ReturnMode {
    fn default() -> Self {
        ReturnMode::Stdout
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTask {
    #[serde(flatten)]
    pub base: TaskBase,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub arguments: BTreeMap<String, Valuable>,
    #[serde(default)]
    pub environment: BTreeMap<String, Valuable>,
    #[serde(default = "default_true")]
    pub await_completion: bool,
    #[serde(default, rename = "return")]
    pub return_mode: ReturnMode,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWorkflowTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub event: EmitEventSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventSpec {
    pub with: BTreeMap<String, Valuable>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    One,
    Any,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub to: ListenToSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenToSpec {
    pub mode: ListenMode,
    /// Correlation filters; an incoming event must match every entry's
    /// key/value against the event envelope.
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkTask {
    #[serde(flatten)]
    pub base: TaskBase,
    pub fork: ForkSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkSpec {
    pub branches: Vec<NamedTask>,
    #[serde(default)]
    pub compete: bool,
}

impl Task {
    pub fn base(&self) -> &TaskBase {
        match self {
            Task::Do(t) => &t.base,
            Task::For(t) => &t.base,
            Task::Switch(t) => &t.base,
            Task::Try(t) => &t.base,
            Task::Set(t) => &t.base,
            Task::Raise(t) => &t.base,
            Task::Wait(t) => &t.base,
            Task::CallHttp(t) => &t.base,
            Task::RunScript(t) => &t.base,
            Task::RunShell(t) => &t.base,
            Task::RunWorkflow(t) => &t.base,
            Task::Emit(t) => &t.base,
            Task::Listen(t) => &t.base,
            Task::Fork(t) => &t.base,
        }
    }
}
