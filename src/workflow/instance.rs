//! The top-level driver (spec §4.4): position advancement, error routing,
//! suspension. `WorkflowInstance` is reconstructed fresh from a `Message`
//! on every step and never outlives one `run()` call (spec §3).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::expr::{eval, Scope};
use crate::interpreter;
use crate::message::Message;
use crate::position::{Position, Segment, Token};
use crate::workflow::error::WorkflowError;
use crate::workflow::node::{CompiledWorkflow, Node};
use crate::workflow::state::NodeState;
use crate::workflow::task::{IoSpec, Task, Then, ThenKeyword};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Waiting,
    Completed,
    Faulted,
    Cancelled,
}

/// What the driver needs the Consumer to schedule on `WAITING`.
#[derive(Debug, Clone)]
pub enum WaitRequest {
    /// Enqueue an `outbox_wait` row and resume this exact position when
    /// `resume_at` passes.
    Delay { resume_at: DateTime<Utc> },
    /// Enqueue an `outbox_retry` row (the failing Try's position, with
    /// `attemptCount` already incremented).
    Retry { resume_at: DateTime<Utc> },
    /// Suspend with no outbox row; resumption is driven by a correlated
    /// inbound message (`RunWorkflow` completion, `Fork` branch return, or
    /// `Listen`'s external event).
    ExternalEvent,
    /// `RunWorkflow`/`Fork` fan-out: the driver has messages to emit and
    /// then must suspend for their return.
    Dispatch { messages: Vec<DispatchTarget> },
}

/// One outbound dispatch: the message to publish, plus (for a `Fork`
/// branch, which has no standing name/version of its own) the ad-hoc
/// definition the consumer must register before the message can be
/// processed.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub message: Message,
    /// `(name, version, definitionYaml)` for a target with no pre-existing
    /// Definition Store entry — a `Fork` branch, compiled from its own task
    /// subtree rather than looked up by name.
    pub definition: Option<(String, String, String)>,
}

/// The outcome of one `run()` call (spec §4.4).
#[derive(Debug)]
pub enum RunOutcome {
    Completed { output: Value, emitted: Vec<Value> },
    Faulted { error: WorkflowError, emitted: Vec<Value> },
    Waiting { request: WaitRequest, emitted: Vec<Value> },
}

enum Interrupt {
    End(Value),
    Waiting(WaitRequest),
    Fault(WorkflowError),
}

impl From<WorkflowError> for Interrupt {
    fn from(err: WorkflowError) -> Self {
        Interrupt::Fault(err)
    }
}

impl From<crate::expr::ExprError> for Interrupt {
    fn from(err: crate::expr::ExprError) -> Self {
        Interrupt::Fault(err.into())
    }
}

pub struct WorkflowInstance {
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub compiled: Arc<CompiledWorkflow>,
    pub states: HashMap<Position, NodeState>,
    pub current_position: Position,
    pub status: Status,
    pub workflow_input: Value,
    pub secrets: HashMap<String, String>,
    pub http_client: reqwest::Client,
    emitted: Vec<Value>,
}

impl WorkflowInstance {
    pub fn new(
        instance_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        compiled: Arc<CompiledWorkflow>,
        workflow_input: Value,
    ) -> Self {
        let mut states = HashMap::new();
        let mut root_state = NodeState::new();
        root_state.raw_input = Some(workflow_input.clone());
        states.insert(Position::root(), root_state);

        WorkflowInstance {
            instance_id: instance_id.into(),
            name: name.into(),
            version: version.into(),
            compiled,
            states,
            current_position: Position::root(),
            status: Status::Pending,
            workflow_input,
            secrets: HashMap::new(),
            http_client: reqwest::Client::new(),
            emitted: Vec::new(),
        }
    }

    /// Rehydrate from an inbound [`Message`] and the compiled definition it
    /// names.
    pub fn from_message(message: &Message, compiled: Arc<CompiledWorkflow>) -> Self {
        let states = message.states_map();
        let workflow_input = states
            .get(&Position::root())
            .and_then(|s| s.raw_input.clone())
            .unwrap_or(Value::Null);

        WorkflowInstance {
            instance_id: message.instance_id.clone(),
            name: message.n.clone(),
            version: message.v.clone(),
            compiled,
            states,
            current_position: message.position(),
            status: Status::Running,
            workflow_input,
            secrets: HashMap::new(),
            http_client: reqwest::Client::new(),
            emitted: Vec::new(),
        }
    }

    /// Re-encode the current states map and position into a `Message`, for
    /// persisting an outbox row or emitting a follow-up message.
    pub fn to_message(&self, correlation: Option<crate::message::Correlation>) -> Message {
        Message::from_states(
            self.instance_id.clone(),
            &self.name,
            &self.version,
            &self.states,
            &self.current_position,
            correlation,
        )
    }

    pub async fn run(&mut self) -> RunOutcome {
        self.status = Status::Running;
        let resume_target = self.current_position.clone();
        let root = self.compiled.root().clone();

        let outcome = match self.exec_node(&root, Some(&resume_target), None).await {
            Ok((value, _then)) => {
                self.status = Status::Completed;
                RunOutcome::Completed {
                    output: value,
                    emitted: std::mem::take(&mut self.emitted),
                }
            }
            Err(Interrupt::End(value)) => {
                self.status = Status::Completed;
                RunOutcome::Completed {
                    output: value,
                    emitted: std::mem::take(&mut self.emitted),
                }
            }
            Err(Interrupt::Waiting(req)) => {
                self.status = Status::Waiting;
                RunOutcome::Waiting {
                    request: req,
                    emitted: std::mem::take(&mut self.emitted),
                }
            }
            Err(Interrupt::Fault(err)) => {
                self.status = Status::Faulted;
                RunOutcome::Faulted {
                    error: err,
                    emitted: std::mem::take(&mut self.emitted),
                }
            }
        };
        outcome
    }

    #[async_recursion::async_recursion]
    async fn exec_node(
        &mut self,
        position: &Position,
        resume_target: Option<&Position>,
        input_override: Option<Value>,
    ) -> Result<(Value, Then), Interrupt> {
        let node = self
            .compiled
            .get(position)
            .cloned()
            .ok_or_else(|| WorkflowError::configuration(format!("no node at {position}")))?;

        self.ensure_started(&node, input_override)?;
        let transformed_input = self
            .states
            .get(position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);

        let (raw_output, then_override) = match &node.task {
            Task::Do(_) => {
                let list = position.child_token(Token::Do);
                let out = self
                    .run_list(&list, transformed_input.clone(), resume_target)
                    .await?;
                (out, None)
            }
            Task::For(t) => {
                let out = self.exec_for(&node, t.clone(), resume_target).await?;
                (out, None)
            }
            Task::Switch(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                let (out, then) = interpreter::switch_task::execute(t, &scope)?;
                (out, Some(then))
            }
            Task::Try(t) => {
                let out = self.exec_try(&node, t.clone(), resume_target).await?;
                (out, None)
            }
            Task::Set(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                (
                    interpreter::set_task::execute(t, &transformed_input, &scope)?,
                    None,
                )
            }
            Task::Raise(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                return Err(interpreter::raise_task::execute(t, &scope)
                    .at(position)
                    .into());
            }
            Task::Wait(t) => match self.exec_wait(&node, t.clone())? {
                Outcome::Completed(v) => (v, None),
                Outcome::Waiting(req) => return Err(Interrupt::Waiting(req)),
            },
            Task::CallHttp(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                let out = interpreter::call_http::execute(
                    t,
                    &scope,
                    &self.secrets,
                    &self.http_client,
                )
                .await?;
                (out, None)
            }
            Task::RunScript(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                (interpreter::run_task::execute(t, &scope, false).await?, None)
            }
            Task::RunShell(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                (interpreter::run_task::execute(t, &scope, true).await?, None)
            }
            Task::RunWorkflow(t) => match self.exec_run_workflow(&node, t.clone())? {
                Outcome::Completed(v) => (v, None),
                Outcome::Waiting(req) => return Err(Interrupt::Waiting(req)),
            },
            Task::Emit(t) => {
                let scope = self.scope_for(position, transformed_input.clone());
                let event = interpreter::emit_task::execute(t, &scope)?;
                self.emitted.push(event.clone());
                (event, None)
            }
            Task::Listen(t) => match self.exec_listen(&node, t.clone())? {
                Outcome::Completed(v) => (v, None),
                Outcome::Waiting(req) => return Err(Interrupt::Waiting(req)),
            },
            Task::Fork(t) => match self.exec_fork(&node, t.clone(), resume_target).await? {
                Outcome::Completed(v) => (v, None),
                Outcome::Waiting(req) => return Err(Interrupt::Waiting(req)),
            },
        };

        let then = then_override.unwrap_or_else(|| {
            node.task
                .base()
                .then
                .clone()
                .unwrap_or(Then::Keyword(ThenKeyword::Continue))
        });
        let transformed_output = self.complete_node(&node, raw_output)?;
        Ok((transformed_output, then))
    }

    async fn run_list(
        &mut self,
        list: &Position,
        default_output: Value,
        resume_target: Option<&Position>,
    ) -> Result<Value, Interrupt> {
        let children = self.compiled.scope_children(list).to_vec();
        if children.is_empty() {
            return Ok(default_output);
        }

        let mut idx = match resume_target {
            Some(target) => children
                .iter()
                .position(|(_, pos)| is_prefix(pos, target))
                .unwrap_or(0),
            None => 0,
        };
        let mut last_output = default_output;
        let mut next_input_override = None;

        loop {
            if idx >= children.len() {
                return Ok(last_output);
            }
            let (_, child_pos) = children[idx].clone();
            let rt = resume_target.filter(|t| is_prefix(&child_pos, t));
            let (output, then) = self
                .exec_node(&child_pos, rt, next_input_override.take())
                .await?;
            last_output = output.clone();

            match then {
                Then::Keyword(ThenKeyword::Continue) => idx += 1,
                Then::Keyword(ThenKeyword::End) => return Err(Interrupt::End(output)),
                Then::Keyword(ThenKeyword::Exit) => return Ok(output),
                Then::Named(name) => match children.iter().position(|(n, _)| n == &name) {
                    Some(next) => {
                        idx = next;
                        next_input_override = Some(output);
                    }
                    None => {
                        return Err(WorkflowError::configuration(format!(
                            "`then: {name}` has no matching sibling in this scope"
                        ))
                        .at(&child_pos)
                        .into())
                    }
                },
            }
        }
    }

    fn ensure_started(&mut self, node: &Node, input_override: Option<Value>) -> Result<(), Interrupt> {
        if self.states.contains_key(&node.position) {
            return Ok(());
        }
        let raw_input = input_override.unwrap_or_else(|| self.predecessor_output(node));
        let mut state = NodeState::new();
        state.raw_input = Some(raw_input.clone());
        state.started_at = Some(Utc::now());

        let transformed = match node.task.base().input.as_ref().and_then(|i| io_expr(i)) {
            Some(expr) => {
                let scope = self.scope_for(&node.position, raw_input.clone());
                eval(expr, &scope)?
            }
            None => raw_input.clone(),
        };
        state.transformed_input = Some(transformed);
        self.states.insert(node.position.clone(), state);
        Ok(())
    }

    /// The positional predecessor's output: the scope's own input for the
    /// first child, otherwise the preceding sibling's output. Only correct
    /// when control flow actually fell through in list order; a named
    /// `then` jump overrides this via `ensure_started`'s `input_override`,
    /// since the jumped-to node's real predecessor is whichever sibling
    /// named it, not whoever sits before it positionally.
    fn predecessor_output(&self, node: &Node) -> Value {
        if node.position.is_root() {
            return self.workflow_input.clone();
        }
        let siblings = self.compiled.scope_children(&node.scope);
        let idx = siblings
            .iter()
            .position(|(_, p)| p == &node.position)
            .unwrap_or(0);

        if idx == 0 {
            let owner = owning_task_position(&node.scope);
            self.states
                .get(&owner)
                .and_then(|s| s.transformed_input.clone())
                .unwrap_or(Value::Null)
        } else {
            let (_, prev) = &siblings[idx - 1];
            self.states
                .get(prev)
                .and_then(|s| s.transformed_output.clone().or_else(|| s.raw_output.clone()))
                .unwrap_or(Value::Null)
        }
    }

    fn complete_node(&mut self, node: &Node, raw_output: Value) -> Result<Value, Interrupt> {
        {
            let state = self
                .states
                .get_mut(&node.position)
                .expect("ensure_started always inserts a state first");
            state.set_raw_output(raw_output.clone());
        }

        let transformed = match node.task.base().output.as_ref().and_then(|o| o.as_expr.as_deref())
        {
            Some(expr) => {
                let scope = self.scope_for(&node.position, raw_output.clone());
                eval(expr, &scope)?
            }
            None => raw_output.clone(),
        };
        {
            let state = self.states.get_mut(&node.position).unwrap();
            state.set_transformed_output(transformed.clone());
        }

        if let Some(export) = &node.task.base().export {
            let scope = self.scope_for(&node.position, transformed.clone());
            let exported = eval(&export.as_expr, &scope)?;
            if !exported.is_object() {
                return Err(WorkflowError::validation(
                    "export.as must evaluate to an object",
                )
                .at(&node.position)
                .into());
            }
            let state = self.states.get_mut(&node.position).unwrap();
            state.merge_context(exported);
        }

        Ok(transformed)
    }

    /// Build the layered expression scope (workflow -> task -> node ->
    /// loop) for evaluating an expression with `.` bound to `dot`.
    fn scope_for(&self, position: &Position, dot: Value) -> Scope {
        let mut scope = Scope::new(dot.clone());
        let input = self
            .states
            .get(position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or_else(|| dot.clone());
        scope = scope.with("input", input);

        if let Some(state) = self.states.get(position) {
            if let Some(output) = &state.raw_output {
                scope = scope.with("output", output.clone());
            }
            for (k, v) in &state.variables {
                scope = scope.with(k.clone(), v.clone());
            }
        }

        scope = scope.with(
            "workflow",
            json!({
                "input": self.workflow_input,
                "name": self.name,
                "version": self.version,
            }),
        );
        scope = scope.with("runtime", json!({}));
        scope = scope.with(
            "secrets",
            Value::Object(
                self.secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        scope = scope.with("context", self.collect_context(position));
        scope
    }

    fn collect_context(&self, position: &Position) -> Value {
        let mut merged = serde_json::Map::new();
        let mut ancestors = Vec::new();
        let mut current = Some(position.clone());
        while let Some(p) = current {
            ancestors.push(p.clone());
            current = p.parent();
        }
        for ancestor in ancestors.into_iter().rev() {
            if let Some(state) = self.states.get(&ancestor) {
                if let Some(obj) = state.context.as_object() {
                    for (k, v) in obj {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Value::Object(merged)
    }

    async fn exec_for(
        &mut self,
        node: &Node,
        task: crate::workflow::task::ForTask,
        resume_target: Option<&Position>,
    ) -> Result<Value, Interrupt> {
        let transformed_input = self
            .states
            .get(&node.position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);

        let scope = self.scope_for(&node.position, transformed_input.clone());
        let items = eval(&task.in_expr, &scope)?;
        let items = match items {
            Value::Array(items) => items,
            other => vec![other],
        };
        if items.is_empty() {
            return Ok(transformed_input);
        }

        let start_index = self
            .states
            .get(&node.position)
            .and_then(|s| s.get_variable("forIndex"))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(0);

        let mut accumulator = self
            .states
            .get(&node.position)
            .and_then(|s| s.get_variable("forAccumulator"))
            .cloned()
            .unwrap_or(transformed_input);

        let list = node.position.child_token(Token::For).child_token(Token::Do);

        for index in start_index..items.len() {
            let item = items[index].clone();
            let loop_scope = self
                .scope_for(&node.position, accumulator.clone())
                .with(task.each.clone(), item.clone())
                .with(task.at.clone(), json!(index));

            if let Some(while_expr) = &task.while_expr {
                if !crate::expr::eval_predicate(while_expr, &loop_scope) {
                    break;
                }
            }

            {
                let state = self.states.get_mut(&node.position).unwrap();
                state.set_variable(task.each.clone(), item.clone());
                state.set_variable(task.at.clone(), json!(index));
                state.set_variable("forIndex", json!(index));
                state.set_variable("forAccumulator", accumulator.clone());
            }

            let rt = resume_target.filter(|t| is_prefix(&list, t));
            accumulator = self.run_list(&list, accumulator, rt).await?;

            let state = self.states.get_mut(&node.position).unwrap();
            state.set_variable("forAccumulator", accumulator.clone());
            state.set_variable("forIndex", json!(index + 1));
        }

        Ok(accumulator)
    }

    async fn exec_try(
        &mut self,
        node: &Node,
        task: crate::workflow::task::TryTask,
        resume_target: Option<&Position>,
    ) -> Result<Value, Interrupt> {
        let transformed_input = self
            .states
            .get(&node.position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);

        let try_do = node.position.child_token(Token::Try).child_token(Token::Do);
        let rt = resume_target.filter(|t| is_prefix(&try_do, t) || is_prefix(&node.position, t));

        match self.run_list(&try_do, transformed_input.clone(), rt).await {
            Ok(v) => Ok(v),
            Err(Interrupt::Fault(err)) => self.handle_try_error(node, &task, err).await,
            Err(other) => Err(other),
        }
    }

    async fn handle_try_error(
        &mut self,
        node: &Node,
        task: &crate::workflow::task::TryTask,
        err: WorkflowError,
    ) -> Result<Value, Interrupt> {
        let catch = &task.catch;
        let scope = self
            .scope_for(&node.position, Value::Null)
            .with(catch.as_name.clone(), serde_json::to_value(&err).unwrap_or(Value::Null));

        if !error_matches(catch.errors.as_ref(), &err) {
            return Err(Interrupt::Fault(err));
        }
        if let Some(when) = &catch.when {
            if !crate::expr::eval_predicate(when, &scope) {
                return Err(Interrupt::Fault(err));
            }
        }
        if let Some(except_when) = &catch.except_when {
            if crate::expr::eval_predicate(except_when, &scope) {
                return Err(Interrupt::Fault(err));
            }
        }

        if let Some(retry_spec) = &catch.retry {
            let policy = retry_spec.to_policy();
            let attempt = {
                let state = self.states.entry(node.position.clone()).or_default();
                state.attempt_count += 1;
                state.attempt_count
            };
            if policy.should_retry(Some(err.kind.as_str())) && policy.has_attempts_remaining(attempt)
            {
                let state = self.states.get_mut(&node.position).unwrap();
                state.pending_error = Some(err);
                let resume_at = Utc::now()
                    + chrono::Duration::from_std(policy.delay_for_attempt(attempt + 1))
                        .unwrap_or_default();
                self.current_position = node.position.clone();
                return Err(Interrupt::Waiting(WaitRequest::Retry { resume_at }));
            }
        }

        let catch_do = node
            .position
            .child_token(Token::Try)
            .child_token(Token::Catch)
            .child_token(Token::Do);
        self.run_list(&catch_do, Value::Null, None).await
    }

    fn exec_wait(
        &mut self,
        node: &Node,
        task: crate::workflow::task::WaitTask,
    ) -> Result<Outcome, Interrupt> {
        let already_resumed = self
            .states
            .get(&node.position)
            .map(|s| s.raw_output.is_some())
            .unwrap_or(false);

        if already_resumed {
            let transformed_input = self
                .states
                .get(&node.position)
                .and_then(|s| s.transformed_input.clone())
                .unwrap_or(Value::Null);
            return Ok(Outcome::Completed(transformed_input));
        }

        let duration = interpreter::wait_task::parse_duration(&task.wait)?;
        let resume_at = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_default();

        let transformed_input = self
            .states
            .get(&node.position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);
        let state = self.states.get_mut(&node.position).unwrap();
        state.set_raw_output(transformed_input);
        self.current_position = node.position.clone();
        Ok(Outcome::Waiting(WaitRequest::Delay { resume_at }))
    }

    fn exec_run_workflow(
        &mut self,
        node: &Node,
        task: crate::workflow::task::RunWorkflowTask,
    ) -> Result<Outcome, Interrupt> {
        let already_resumed = self
            .states
            .get(&node.position)
            .map(|s| s.raw_output.is_some())
            .unwrap_or(false);
        if already_resumed {
            let output = self
                .states
                .get(&node.position)
                .and_then(|s| s.raw_output.clone())
                .unwrap_or(Value::Null);
            return Ok(Outcome::Completed(output));
        }

        let transformed_input = self
            .states
            .get(&node.position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);
        self.current_position = node.position.clone();
        let parent_envelope = self
            .to_message(None)
            .encode()
            .expect("Message serializes to JSON");
        let message = interpreter::run_workflow::start_message(
            &task,
            &self.instance_id,
            &node.position,
            &parent_envelope,
            transformed_input,
        );
        Ok(Outcome::Waiting(WaitRequest::Dispatch {
            messages: vec![DispatchTarget {
                message,
                definition: None,
            }],
        }))
    }

    fn exec_listen(
        &mut self,
        node: &Node,
        task: crate::workflow::task::ListenTask,
    ) -> Result<Outcome, Interrupt> {
        let already_resumed = self
            .states
            .get(&node.position)
            .map(|s| s.raw_output.is_some())
            .unwrap_or(false);
        if already_resumed {
            let output = self
                .states
                .get(&node.position)
                .and_then(|s| s.raw_output.clone())
                .unwrap_or(Value::Null);
            return Ok(Outcome::Completed(output));
        }
        let _ = &task.to;
        self.current_position = node.position.clone();
        Ok(Outcome::Waiting(WaitRequest::ExternalEvent))
    }

    async fn exec_fork(
        &mut self,
        node: &Node,
        task: crate::workflow::task::ForkTask,
        _resume_target: Option<&Position>,
    ) -> Result<Outcome, Interrupt> {
        let received: usize = self
            .states
            .get(&node.position)
            .map(|s| s.variables.keys().filter(|k| k.starts_with("branch:")).count())
            .unwrap_or(0);
        let total = task.fork.branches.len();

        if interpreter::fork_task::is_satisfied(task.fork.compete, received, total) {
            let outputs: Vec<Option<Value>> = (0..total)
                .map(|i| {
                    self.states
                        .get(&node.position)
                        .and_then(|s| s.get_variable(&format!("branch:{i}")))
                        .cloned()
                })
                .collect();
            return Ok(Outcome::Completed(interpreter::fork_task::collect_output(
                task.fork.compete,
                &outputs,
            )));
        }

        // Some, but not all, branches have reported back: keep waiting for
        // the rest rather than re-dispatching every branch again.
        if received > 0 {
            self.current_position = node.position.clone();
            return Ok(Outcome::Waiting(WaitRequest::ExternalEvent));
        }

        let transformed_input = self
            .states
            .get(&node.position)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);

        self.current_position = node.position.clone();
        let parent_envelope = self
            .to_message(None)
            .encode()
            .expect("Message serializes to JSON");

        // A branch has no standing name/version of its own: it's a subtree
        // of this workflow's own definition, not a separately-published
        // one. Give it a synthetic, unique (name, version) and carry its
        // compiled task body as an ad-hoc definition the consumer registers
        // before the dispatched message can be processed.
        let messages = task
            .fork
            .branches
            .iter()
            .enumerate()
            .map(|(i, branch)| {
                let mut states = HashMap::new();
                let mut root_state = NodeState::new();
                root_state.raw_input = Some(transformed_input.clone());
                states.insert(Position::root(), root_state);
                let branch_name = format!("{}~fork~{}~{i}", self.name, node.position.to_pointer());
                let branch_yaml = serde_yaml::to_string(&branch.task)
                    .expect("a compiled branch task re-serializes to YAML");
                let message = Message::from_states(
                    uuid::Uuid::now_v7().to_string(),
                    &branch_name,
                    &self.version,
                    &states,
                    &Position::root(),
                    Some(crate::message::Correlation {
                        parent_instance_id: self.instance_id.clone(),
                        parent_position: node.position.to_pointer(),
                        parent_envelope: parent_envelope.clone(),
                        branch_index: Some(i),
                    }),
                );
                DispatchTarget {
                    message,
                    definition: Some((branch_name, self.version.clone(), branch_yaml)),
                }
            })
            .collect();

        Ok(Outcome::Waiting(WaitRequest::Dispatch { messages }))
    }

    /// Feed a correlated completion back into the suspended node that
    /// started it (`RunWorkflow`, a `Fork` branch, or a `Listen` event).
    pub fn resolve_correlation(
        &mut self,
        position: &Position,
        branch_index: Option<usize>,
        output: Value,
    ) {
        let state = self.states.entry(position.clone()).or_default();
        match branch_index {
            Some(i) => {
                state.set_variable(format!("branch:{i}"), output);
            }
            None => {
                state.set_raw_output(output);
            }
        }
    }

}

enum Outcome {
    Completed(Value),
    Waiting(WaitRequest),
}

fn io_expr(spec: &IoSpec) -> Option<&str> {
    spec.from.as_deref()
}

fn is_prefix(ancestor: &Position, target: &Position) -> bool {
    target.segments().starts_with(ancestor.segments())
}

fn owning_task_position(scope: &Position) -> Position {
    let mut pos = scope.clone();
    while matches!(pos.last(), Some(Segment::Token(_))) {
        pos = pos.parent().unwrap_or_else(Position::root);
    }
    pos
}

fn error_matches(filter: Option<&crate::workflow::task::ErrorFilter>, err: &WorkflowError) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if let Some(status) = filter.status {
        if status != err.status {
            return false;
        }
    }
    if let Some(type_filter) = &filter.error_type {
        if let Some(prefix) = type_filter.strip_suffix('*') {
            if !err.error_type.starts_with(prefix) {
                return false;
            }
        } else if &err.error_type != type_filter {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::CompiledWorkflow;
    use crate::workflow::task::{
        CatchSpec, DoTask, NamedTask, RaiseSpec, RaiseTask, SetTask, TaskBase, TryTask, Valuable,
    };
    use std::collections::BTreeMap;

    fn set(name: &str, value: &str, then: Option<Then>) -> NamedTask {
        let mut map = BTreeMap::new();
        map.insert("value".to_string(), Valuable::Literal(json!(value)));
        NamedTask {
            name: name.to_string(),
            task: Task::Set(SetTask {
                base: TaskBase {
                    then,
                    ..Default::default()
                },
                set: map,
                merge: false,
            }),
        }
    }

    async fn run_to_completion(root: Task) -> Value {
        let compiled = Arc::new(CompiledWorkflow::compile(root).unwrap());
        let mut instance =
            WorkflowInstance::new("t1", "wf", "1.0", compiled, Value::String(String::new()));
        match instance.run().await {
            RunOutcome::Completed { output, .. } => output,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_set_chains_outputs_through_the_pipe() {
        let mut concat = BTreeMap::new();
        concat.insert(
            "value".to_string(),
            Valuable::Literal(json!("${.value + \"2\"}")),
        );
        let b = NamedTask {
            name: "b".to_string(),
            task: Task::Set(SetTask {
                base: TaskBase::default(),
                set: concat,
                merge: false,
            }),
        };
        let mut concat3 = BTreeMap::new();
        concat3.insert(
            "value".to_string(),
            Valuable::Literal(json!("${.value + \"3\"}")),
        );
        let c = NamedTask {
            name: "c".to_string(),
            task: Task::Set(SetTask {
                base: TaskBase {
                    output: Some(IoSpec {
                        from: None,
                        as_expr: Some(".value".to_string()),
                        schema: None,
                    }),
                    ..Default::default()
                },
                set: concat3,
                merge: false,
            }),
        };
        let root = Task::Do(DoTask {
            base: TaskBase::default(),
            children: vec![set("a", "1", None), b, c],
        });

        let output = run_to_completion(root).await;
        assert_eq!(output, json!("123"));
    }

    #[tokio::test]
    async fn named_then_jumps_over_a_sibling() {
        let first = set("first", "1", Some(Then::Named("third".to_string())));
        let second = set("second", "skip-me", None);
        let mut third_set = BTreeMap::new();
        third_set.insert(
            "value".to_string(),
            Valuable::Literal(json!("${.value + \"3\"}")),
        );
        let third = NamedTask {
            name: "third".to_string(),
            task: Task::Set(SetTask {
                base: TaskBase::default(),
                set: third_set,
                merge: false,
            }),
        };
        let root = Task::Do(DoTask {
            base: TaskBase::default(),
            children: vec![first, second, third],
        });

        let output = run_to_completion(root).await;
        assert_eq!(output, json!({"value": "13"}));
    }

    #[tokio::test]
    async fn try_without_matching_catch_propagates_to_fault() {
        let raise = NamedTask {
            name: "boom".to_string(),
            task: Task::Raise(RaiseTask {
                base: TaskBase::default(),
                raise: RaiseSpec {
                    error_type: "https://serverlessworkflow.io/dsl/errors/types/communication"
                        .to_string(),
                    title: "down".to_string(),
                    status: Some(503),
                    detail: None,
                },
            }),
        };
        let try_task = Task::Try(TryTask {
            base: TaskBase::default(),
            children: vec![raise],
            catch: CatchSpec {
                errors: Some(crate::workflow::task::ErrorFilter {
                    error_type: Some(
                        "https://serverlessworkflow.io/dsl/errors/types/validation".to_string(),
                    ),
                    status: None,
                }),
                ..Default::default()
            },
        });

        let compiled = Arc::new(CompiledWorkflow::compile(try_task).unwrap());
        let mut instance = WorkflowInstance::new("t1", "wf", "1.0", compiled, Value::Null);
        match instance.run().await {
            RunOutcome::Faulted { error, .. } => assert_eq!(error.status, 503),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn for_loop_sums_the_input_array() {
        use crate::workflow::task::ForTask;

        let mut add_item = BTreeMap::new();
        add_item.insert(
            "value".to_string(),
            Valuable::Literal(json!("${.value + $item}")),
        );
        let accumulate = NamedTask {
            name: "accumulate".to_string(),
            task: Task::Set(SetTask {
                base: TaskBase::default(),
                set: add_item,
                merge: false,
            }),
        };
        let for_task = Task::For(ForTask {
            base: TaskBase {
                input: Some(IoSpec {
                    from: Some(".".to_string()),
                    as_expr: None,
                    schema: None,
                }),
                output: Some(IoSpec {
                    from: None,
                    as_expr: Some(".value".to_string()),
                    schema: None,
                }),
                ..Default::default()
            },
            in_expr: ".numbers".to_string(),
            each: "item".to_string(),
            at: "index".to_string(),
            while_expr: None,
            children: vec![accumulate],
        });

        let compiled = Arc::new(CompiledWorkflow::compile(for_task).unwrap());
        let mut instance = WorkflowInstance::new(
            "t1",
            "wf",
            "1.0",
            compiled,
            json!({"value": 0, "numbers": [1, 2, 3, 4]}),
        );
        match instance.run().await {
            RunOutcome::Completed { output, .. } => assert_eq!(output, json!(10)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_suspends_then_resumes_from_a_re_decoded_message() {
        use crate::workflow::task::WaitTask;

        let wait_task = Task::Wait(WaitTask {
            base: TaskBase::default(),
            wait: json!({"seconds": 5}),
        });
        let compiled = Arc::new(CompiledWorkflow::compile(wait_task).unwrap());
        let mut instance =
            WorkflowInstance::new("t1", "wf", "1.0", compiled.clone(), json!("hello"));

        let request = match instance.run().await {
            RunOutcome::Waiting { request, .. } => request,
            other => panic!("expected a wait suspension, got {other:?}"),
        };
        assert!(matches!(request, WaitRequest::Delay { .. }));

        // Round-trip through the envelope the way the outbox would deliver it.
        let encoded = instance.to_message(None).encode().unwrap();
        let redelivered = crate::message::Message::decode(&encoded).unwrap();
        let mut resumed = WorkflowInstance::from_message(&redelivered, compiled);

        match resumed.run().await {
            RunOutcome::Completed { output, .. } => assert_eq!(output, json!("hello")),
            other => panic!("expected completion on resume, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fork_waits_for_every_branch_before_collecting_output() {
        use crate::workflow::task::{ForkSpec, ForkTask};

        let fork_task = Task::Fork(ForkTask {
            base: TaskBase::default(),
            fork: ForkSpec {
                branches: vec![set("left", "L", None), set("right", "R", None)],
                compete: false,
            },
        });
        let compiled = Arc::new(CompiledWorkflow::compile(fork_task).unwrap());
        let mut instance = WorkflowInstance::new("t1", "wf", "1.0", compiled, Value::Null);

        let messages = match instance.run().await {
            RunOutcome::Waiting {
                request: WaitRequest::Dispatch { messages },
                ..
            } => messages,
            other => panic!("expected a dispatch suspension, got {other:?}"),
        };
        assert_eq!(messages.len(), 2);

        // Run each branch as its own standalone instance, the way a second
        // consumer would after decoding the registered ad-hoc definition.
        let mut branch_outputs = Vec::new();
        for target in &messages {
            let (_, _, yaml) = target.definition.as_ref().expect("fork branch carries a definition");
            let branch_task: Task = serde_yaml::from_str(yaml).unwrap();
            let branch_compiled = Arc::new(CompiledWorkflow::compile(branch_task).unwrap());
            let mut branch = WorkflowInstance::from_message(&target.message, branch_compiled);
            match branch.run().await {
                RunOutcome::Completed { output, .. } => branch_outputs.push(output),
                other => panic!("expected branch completion, got {other:?}"),
            }
        }

        let fork_position = Position::root();

        // Feeding only the first branch back isn't enough to satisfy fan-in.
        instance.resolve_correlation(&fork_position, Some(0), branch_outputs[0].clone());
        match instance.run().await {
            RunOutcome::Waiting {
                request: WaitRequest::ExternalEvent,
                ..
            } => {}
            other => panic!("expected to keep waiting on one outstanding branch, got {other:?}"),
        }

        // The second branch completes the join.
        instance.resolve_correlation(&fork_position, Some(1), branch_outputs[1].clone());
        match instance.run().await {
            RunOutcome::Completed { output, .. } => {
                assert_eq!(
                    output,
                    json!([{"value": "L"}, {"value": "R"}])
                );
            }
            other => panic!("expected completion once both branches report, got {other:?}"),
        }
    }
}
