//! Consumer Loop (spec §4.5): one inbound `Message`, one workflow step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

use crate::interpreter;
use crate::interpreter::listen_task;
use crate::message::Message;
use crate::persistence::{
    DefinitionStore, JoinStore, ListenStore, OutboxKind, OutboxRow, OutboxStore, ParkedListen,
    StoreError,
};
use crate::position::Position;
use crate::worker::scheduler::{PublishError, Publisher};
use crate::workflow::task::Task;
use crate::workflow::{CompiledWorkflow, RunOutcome, WaitRequest, WorkflowError, WorkflowInstance};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed workflow definition for {name}@{version}: {source}")]
    InvalidDefinition {
        name: String,
        version: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// What one `handle_message` call produced, for logging and tests. The
/// broker delivery itself is always acknowledged once this returns `Ok`.
#[derive(Debug, Default)]
pub struct ConsumerOutcome {
    /// Encoded messages handed to the publisher (fan-out branches, a
    /// sub-workflow start, a completion routed back to a waiting parent).
    pub published: Vec<String>,
    /// The outbox row written for a `Wait`/`Retry` suspension, if any.
    pub outbox_row_id: Option<String>,
}

/// Drives the consume-one-message-run-one-step loop. Generic over the
/// store and publisher implementations so tests can run entirely
/// in-memory.
pub struct Consumer<D: DefinitionStore, O: OutboxStore, J: JoinStore, L: ListenStore, P: Publisher> {
    definitions: Arc<D>,
    outbox: Arc<O>,
    joins: Arc<J>,
    listens: Arc<L>,
    publisher: Arc<P>,
    cache: RwLock<HashMap<(String, String), Arc<CompiledWorkflow>>>,
    outbox_max_attempts: u32,
}

impl<D: DefinitionStore, O: OutboxStore, J: JoinStore, L: ListenStore, P: Publisher>
    Consumer<D, O, J, L, P>
{
    pub fn new(
        definitions: Arc<D>,
        outbox: Arc<O>,
        joins: Arc<J>,
        listens: Arc<L>,
        publisher: Arc<P>,
    ) -> Self {
        Self {
            definitions,
            outbox,
            joins,
            listens,
            publisher,
            cache: RwLock::new(HashMap::new()),
            outbox_max_attempts: 10,
        }
    }

    pub fn with_outbox_max_attempts(mut self, max_attempts: u32) -> Self {
        self.outbox_max_attempts = max_attempts;
        self
    }

    /// Definition Store lookup (spec §6.2), cached by `(name, version)`
    /// since compiled graphs are read-only and shared across instances.
    async fn compiled(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<CompiledWorkflow>, WorkflowError> {
        let key = (name.to_string(), version.to_string());
        if let Some(hit) = self.cache.read().await.get(&key) {
            return Ok(hit.clone());
        }

        let row = self
            .definitions
            .find_by_name_and_version(name, version)
            .await
            .map_err(|e| WorkflowError::configuration(e.to_string()))?
            .ok_or_else(|| {
                WorkflowError::configuration(format!("no definition for {name}@{version}"))
            })?;

        let root_task: Task = serde_yaml::from_str(&row.definition).map_err(|source| {
            WorkflowError::configuration(format!(
                "invalid definition for {name}@{version}: {source}"
            ))
        })?;
        let compiled = Arc::new(CompiledWorkflow::compile(root_task)?);

        self.cache.write().await.insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Process one inbound message end to end (spec §4.5).
    #[instrument(skip(self, raw))]
    pub async fn handle_message(&self, raw: &str) -> Result<ConsumerOutcome, ConsumerError> {
        let message = Message::decode(raw)?;
        let mut outcome = ConsumerOutcome::default();

        let compiled = match self.compiled(&message.n, &message.v).await {
            Ok(c) => c,
            Err(error) => {
                self.complete_correlation(&message, Err(error), &mut outcome)
                    .await?;
                return Ok(outcome);
            }
        };

        let mut instance = WorkflowInstance::from_message(&message, compiled);
        match instance.run().await {
            RunOutcome::Completed { output, emitted } => {
                self.publish_all(emitted, &mut outcome).await?;
                self.complete_correlation(&message, Ok(output), &mut outcome)
                    .await?;
            }
            RunOutcome::Faulted { error, emitted } => {
                self.publish_all(emitted, &mut outcome).await?;
                self.complete_correlation(&message, Err(error), &mut outcome)
                    .await?;
            }
            RunOutcome::Waiting { request, emitted } => {
                self.publish_all(emitted, &mut outcome).await?;
                self.handle_waiting(&instance, request, &mut outcome)
                    .await?;
            }
        }

        Ok(outcome)
    }

    async fn handle_waiting(
        &self,
        instance: &WorkflowInstance,
        request: WaitRequest,
        outcome: &mut ConsumerOutcome,
    ) -> Result<(), ConsumerError> {
        match request {
            WaitRequest::Delay { resume_at } => {
                self.enqueue_resume(OutboxKind::Wait, instance, resume_at, outcome)
                    .await
            }
            WaitRequest::Retry { resume_at } => {
                self.enqueue_resume(OutboxKind::Retry, instance, resume_at, outcome)
                    .await
            }
            WaitRequest::ExternalEvent => self.park_listen(instance).await,
            WaitRequest::Dispatch { messages } => {
                for target in messages {
                    if let Some((name, version, yaml)) = &target.definition {
                        self.definitions.put(name, version, yaml).await?;
                    }
                    let encoded = target.message.encode()?;
                    self.publisher
                        .publish(&encoded)
                        .await
                        .map_err(ConsumerError::Publish)?;
                    outcome.published.push(encoded);
                }
                Ok(())
            }
        }
    }

    /// Park a `Listen` suspension so a later external event has something
    /// to match against (spec §11, `ListenInstance`). A `Fork` node can
    /// also suspend on `ExternalEvent` while waiting out a partial fan-in —
    /// that case has nothing to park, since the fork's own branch messages
    /// are what will eventually resume it, not an external event.
    async fn park_listen(&self, instance: &WorkflowInstance) -> Result<(), ConsumerError> {
        let Some(node) = instance.compiled.get(&instance.current_position) else {
            return Ok(());
        };
        let Task::Listen(listen) = &node.task else {
            debug!(instance_id = %instance.instance_id, "suspended awaiting an outstanding fork branch");
            return Ok(());
        };

        let filter = serde_json::to_value(&listen.to.with)?;
        self.listens
            .park(ParkedListen {
                instance_id: instance.instance_id.clone(),
                position: instance.current_position.to_pointer(),
                envelope: instance.to_message(None).encode()?,
                filter,
            })
            .await?;
        Ok(())
    }

    /// Deliver an external event (spec §11, the `ListenInstance` resume
    /// path): resumes every parked `Listen` whose filter matches, in
    /// whatever order the store returns them.
    #[instrument(skip(self, event))]
    pub async fn handle_event(&self, event: Value) -> Result<ConsumerOutcome, ConsumerError> {
        let mut outcome = ConsumerOutcome::default();
        for parked in self.listens.matching(&event).await? {
            let parent_message = Message::decode(&parked.envelope)?;
            let parent_compiled = match self.compiled(&parent_message.n, &parent_message.v).await
            {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "listening workflow's definition vanished while delivering an event");
                    continue;
                }
            };
            let position = Position::from_pointer(&parked.position);
            // The store's own filter is a coarse pre-filter (JSONB
            // containment / a linear scan); the `Listen` task's own `to`
            // spec, read back off the compiled definition, is the
            // authoritative check.
            let authoritative = match parent_compiled.get(&position).map(|n| &n.task) {
                Some(Task::Listen(listen)) => listen_task::matches(&listen.to, &event),
                _ => false,
            };
            if !authoritative {
                continue;
            }

            let mut parent = WorkflowInstance::from_message(&parent_message, parent_compiled);
            parent.resolve_correlation(&position, None, event.clone());

            self.listens.remove(&parked.instance_id, &parked.position).await?;

            // `parent_message`'s own correlation (if the listening workflow
            // is itself a sub-workflow or fork branch) must survive into
            // whatever gets passed to `complete_correlation` below, the
            // same way `handle_message` reuses the originally-decoded
            // message rather than a freshly built one.
            let outbound = parent.to_message(parent_message.correlation.clone());
            match parent.run().await {
                RunOutcome::Completed { output, emitted } => {
                    self.publish_all(emitted, &mut outcome).await?;
                    self.complete_correlation(&outbound, Ok(output), &mut outcome)
                        .await?;
                }
                RunOutcome::Faulted { error, emitted } => {
                    self.publish_all(emitted, &mut outcome).await?;
                    self.complete_correlation(&outbound, Err(error), &mut outcome)
                        .await?;
                }
                RunOutcome::Waiting { request, emitted } => {
                    self.publish_all(emitted, &mut outcome).await?;
                    self.handle_waiting(&parent, request, &mut outcome).await?;
                }
            }
        }
        Ok(outcome)
    }

    /// Enqueue the suspended envelope as an outbox row, keyed by a
    /// deterministic id so redelivery of the triggering message never
    /// double-enqueues (spec §4.5 idempotency).
    async fn enqueue_resume(
        &self,
        kind: OutboxKind,
        instance: &WorkflowInstance,
        resume_at: DateTime<Utc>,
        outcome: &mut ConsumerOutcome,
    ) -> Result<(), ConsumerError> {
        let position = instance.current_position.to_pointer();
        let attempt = instance
            .states
            .get(&instance.current_position)
            .map(|s| s.attempt_count)
            .unwrap_or(0);
        let id = outbox_row_id(&instance.instance_id, &position, attempt);
        let message = instance.to_message(None).encode()?;

        self.outbox
            .enqueue(OutboxRow::new(
                id.clone(),
                kind,
                message,
                resume_at,
                self.outbox_max_attempts,
            ))
            .await?;

        outcome.outbox_row_id = Some(id);
        Ok(())
    }

    /// Route a terminal result back to a correlated parent, if this
    /// message started a sub-workflow, a fork branch, or an awaited event
    /// for one.
    async fn complete_correlation(
        &self,
        message: &Message,
        result: Result<Value, WorkflowError>,
        outcome: &mut ConsumerOutcome,
    ) -> Result<(), ConsumerError> {
        let Some(correlation) = &message.correlation else {
            return Ok(());
        };

        let parent_message = Message::decode(&correlation.parent_envelope)?;
        let parent_compiled = match self
            .compiled(&parent_message.n, &parent_message.v)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "parent definition vanished while completing correlation");
                return Ok(());
            }
        };
        let mut parent = WorkflowInstance::from_message(&parent_message, parent_compiled.clone());

        let value = match result {
            Ok(v) => v,
            Err(e) => serde_json::to_value(&e)?,
        };
        let parent_position = Position::from_pointer(&correlation.parent_position);

        match correlation.branch_index {
            // A plain sub-workflow or event completion: the decoded parent
            // envelope is the only state there is, no sibling to reconcile.
            None => parent.resolve_correlation(&parent_position, None, value),
            // A fork branch: every sibling's correlation carries the same
            // envelope snapshot taken at dispatch time, so this branch alone
            // can't tell which siblings have already reported. The join
            // store is the durable accumulator that can.
            Some(branch_index) => {
                // A `compete` fork is satisfied by its first branch; the
                // rest are left running with no cancellation signal. Their
                // completions, once that happens, are late losers — drop
                // them rather than re-completing the fork a second time
                // from the stale pre-dispatch snapshot.
                if self
                    .joins
                    .is_closed(&parent.instance_id, &correlation.parent_position)
                    .await?
                {
                    debug!(position = %correlation.parent_position, branch_index, "dropping late fork branch");
                    return Ok(());
                }

                let joined = self
                    .joins
                    .record_branch(
                        &parent.instance_id,
                        &correlation.parent_position,
                        branch_index,
                        value,
                    )
                    .await?;
                for (i, branch_value) in &joined {
                    parent.resolve_correlation(&parent_position, Some(*i), branch_value.clone());
                }

                if let Some(Task::Fork(fork)) = parent_compiled.get(&parent_position).map(|n| &n.task)
                {
                    let total = fork.fork.branches.len();
                    if interpreter::fork_task::is_satisfied(fork.fork.compete, joined.len(), total)
                    {
                        self.joins
                            .close(&parent.instance_id, &correlation.parent_position)
                            .await?;
                        self.joins
                            .clear(&parent.instance_id, &correlation.parent_position)
                            .await?;
                    }
                }
            }
        }

        let continuation = parent.to_message(None).encode()?;
        self.publisher
            .publish(&continuation)
            .await
            .map_err(ConsumerError::Publish)?;
        outcome.published.push(continuation);
        Ok(())
    }

    async fn publish_all(
        &self,
        emitted: Vec<Value>,
        outcome: &mut ConsumerOutcome,
    ) -> Result<(), ConsumerError> {
        for event in emitted {
            let encoded = serde_json::to_string(&event)?;
            self.publisher
                .publish(&encoded)
                .await
                .map_err(ConsumerError::Publish)?;
            outcome.published.push(encoded);
        }
        Ok(())
    }
}

fn outbox_row_id(instance_id: &str, position: &str, attempt: u32) -> String {
    format!("{instance_id}:{position}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        InMemoryDefinitionStore, InMemoryJoinStore, InMemoryListenStore, InMemoryOutboxStore,
    };
    use crate::workflow::task::{
        DoTask, ForkSpec, ForkTask, ListenMode, ListenTask, ListenToSpec, NamedTask,
        RunWorkflowTask, SetTask, TaskBase, Valuable, WaitTask,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct RecordingPublisher {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, message: &str) -> Result<(), PublishError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    type TestConsumer = Consumer<
        InMemoryDefinitionStore,
        InMemoryOutboxStore,
        InMemoryJoinStore,
        InMemoryListenStore,
        RecordingPublisher,
    >;

    async fn consumer_with_definition(
        name: &str,
        version: &str,
        yaml: &str,
    ) -> (TestConsumer, Arc<InMemoryOutboxStore>, Arc<RecordingPublisher>) {
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        definitions.put(name, version, yaml).await.unwrap();
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let joins = Arc::new(InMemoryJoinStore::new());
        let listens = Arc::new(InMemoryListenStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let consumer = Consumer::new(definitions, outbox.clone(), joins, listens, publisher.clone());
        (consumer, outbox, publisher)
    }

    fn start_message(name: &str, version: &str, input: Value) -> String {
        let mut states = HashMap::new();
        let mut root_state = crate::workflow::NodeState::new();
        root_state.raw_input = Some(input);
        states.insert(Position::root(), root_state);
        Message::from_states("inst-1", name, version, &states, &Position::root(), None)
            .encode()
            .unwrap()
    }

    fn definition_yaml(root: &Task) -> String {
        serde_yaml::to_string(root).unwrap()
    }

    fn set_literal(field: &str, value: &str) -> Task {
        let mut set = BTreeMap::new();
        set.insert(field.to_string(), Valuable::Literal(json!(value)));
        Task::Set(SetTask {
            base: TaskBase::default(),
            set,
            merge: false,
        })
    }

    #[tokio::test]
    async fn completed_step_produces_no_outbox_row() {
        let mut set = BTreeMap::new();
        set.insert("message".to_string(), Valuable::Literal(json!("hello")));
        let root = Task::Do(DoTask {
            base: TaskBase::default(),
            children: vec![NamedTask {
                name: "greet".to_string(),
                task: Task::Set(SetTask {
                    base: TaskBase::default(),
                    set,
                    merge: false,
                }),
            }],
        });
        let (consumer, outbox, _publisher) =
            consumer_with_definition("greet-wf", "1.0.0", &definition_yaml(&root)).await;
        let msg = start_message("greet-wf", "1.0.0", json!(null));

        let outcome = consumer.handle_message(&msg).await.unwrap();
        assert!(outcome.outbox_row_id.is_none());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn missing_definition_is_a_configuration_fault() {
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let joins = Arc::new(InMemoryJoinStore::new());
        let listens = Arc::new(InMemoryListenStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let consumer = Consumer::new(definitions, outbox, joins, listens, publisher);

        let msg = start_message("missing-wf", "1.0.0", json!(null));
        let outcome = consumer.handle_message(&msg).await.unwrap();
        // No correlation on the inbound message, so nothing is published;
        // the fault is simply not further routed.
        assert!(outcome.published.is_empty());
    }

    #[tokio::test]
    async fn waiting_on_a_delay_writes_exactly_one_outbox_row() {
        let root = Task::Do(DoTask {
            base: TaskBase::default(),
            children: vec![NamedTask {
                name: "pause".to_string(),
                task: Task::Wait(WaitTask {
                    base: TaskBase::default(),
                    wait: json!({"seconds": 30}),
                }),
            }],
        });
        let (consumer, outbox, _publisher) =
            consumer_with_definition("waits", "1.0.0", &definition_yaml(&root)).await;
        let msg = start_message("waits", "1.0.0", json!(null));

        let outcome = consumer.handle_message(&msg).await.unwrap();
        assert!(outcome.outbox_row_id.is_some());
        assert_eq!(outbox.len().await, 1);
    }

    #[tokio::test]
    async fn fork_branches_round_trip_through_the_consumer_without_redispatch() {
        let root = Task::Fork(ForkTask {
            base: TaskBase::default(),
            fork: ForkSpec {
                branches: vec![
                    NamedTask {
                        name: "left".to_string(),
                        task: set_literal("side", "L"),
                    },
                    NamedTask {
                        name: "right".to_string(),
                        task: set_literal("side", "R"),
                    },
                ],
                compete: false,
            },
        });
        let (consumer, outbox, publisher) =
            consumer_with_definition("forks", "1.0.0", &definition_yaml(&root)).await;
        let msg = start_message("forks", "1.0.0", json!(null));

        let dispatch = consumer.handle_message(&msg).await.unwrap();
        assert_eq!(dispatch.published.len(), 2);

        let branch0 = consumer.handle_message(&dispatch.published[0]).await.unwrap();
        assert_eq!(branch0.published.len(), 1);

        // Only one of two branches has reported back: the parent keeps
        // waiting and emits nothing, rather than re-dispatching every
        // branch a second time.
        let after_first = consumer
            .handle_message(&branch0.published[0])
            .await
            .unwrap();
        assert!(after_first.published.is_empty());
        assert!(after_first.outbox_row_id.is_none());

        let branch1 = consumer.handle_message(&dispatch.published[1]).await.unwrap();
        let after_second = consumer
            .handle_message(&branch1.published[0])
            .await
            .unwrap();
        assert!(after_second.published.is_empty());
        assert!(after_second.outbox_row_id.is_none());

        assert!(outbox.is_empty().await);
        // Two branch starts, two completions routed back — never a
        // re-dispatch of an already-completed branch.
        assert_eq!(publisher.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn run_workflow_round_trips_through_the_consumer() {
        let child_root = set_literal("computed", "42");
        let parent_root = Task::RunWorkflow(RunWorkflowTask {
            base: TaskBase::default(),
            name: "child-wf".to_string(),
            version: "1.0.0".to_string(),
            input: None,
        });

        let definitions = Arc::new(InMemoryDefinitionStore::new());
        definitions
            .put("parent-wf", "1.0.0", &definition_yaml(&parent_root))
            .await
            .unwrap();
        definitions
            .put("child-wf", "1.0.0", &definition_yaml(&child_root))
            .await
            .unwrap();
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let joins = Arc::new(InMemoryJoinStore::new());
        let listens = Arc::new(InMemoryListenStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let consumer = Consumer::new(definitions, outbox, joins, listens, publisher);

        let msg = start_message("parent-wf", "1.0.0", json!(null));
        let dispatch = consumer.handle_message(&msg).await.unwrap();
        assert_eq!(dispatch.published.len(), 1);

        let child_outcome = consumer.handle_message(&dispatch.published[0]).await.unwrap();
        assert_eq!(child_outcome.published.len(), 1);

        let resumed = consumer
            .handle_message(&child_outcome.published[0])
            .await
            .unwrap();
        assert!(resumed.published.is_empty());
        assert!(resumed.outbox_row_id.is_none());
    }

    #[tokio::test]
    async fn compete_fork_drops_late_losing_branches() {
        let root = Task::Fork(ForkTask {
            base: TaskBase::default(),
            fork: ForkSpec {
                branches: vec![
                    NamedTask {
                        name: "left".to_string(),
                        task: set_literal("side", "L"),
                    },
                    NamedTask {
                        name: "right".to_string(),
                        task: set_literal("side", "R"),
                    },
                ],
                compete: true,
            },
        });
        let (consumer, _outbox, publisher) =
            consumer_with_definition("race", "1.0.0", &definition_yaml(&root)).await;
        let msg = start_message("race", "1.0.0", json!(null));

        let dispatch = consumer.handle_message(&msg).await.unwrap();
        assert_eq!(dispatch.published.len(), 2);

        let branch0 = consumer.handle_message(&dispatch.published[0]).await.unwrap();
        let winner = consumer
            .handle_message(&branch0.published[0])
            .await
            .unwrap();
        // The first branch alone satisfies a `compete` fork: the parent
        // resumes (and, here, completes) right away.
        assert!(!winner.published.is_empty() || winner.outbox_row_id.is_some());

        let sent_before_loser = publisher.sent.lock().unwrap().len();

        // Running the losing branch to completion triggers its own
        // correlation callback, but the join is already closed: nothing
        // routes back to the parent a second time.
        let loser = consumer.handle_message(&dispatch.published[1]).await.unwrap();
        assert!(loser.published.is_empty());
        assert_eq!(publisher.sent.lock().unwrap().len(), sent_before_loser);
    }

    #[tokio::test]
    async fn listen_parks_until_a_matching_event_arrives() {
        let mut with = BTreeMap::new();
        with.insert("type".to_string(), json!("order.created"));
        let root = Task::Do(DoTask {
            base: TaskBase::default(),
            children: vec![
                NamedTask {
                    name: "wait-for-order".to_string(),
                    task: Task::Listen(ListenTask {
                        base: TaskBase::default(),
                        to: ListenToSpec {
                            mode: ListenMode::One,
                            with,
                        },
                    }),
                },
                NamedTask {
                    name: "mark-seen".to_string(),
                    task: set_literal("seen", "yes"),
                },
            ],
        });
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        definitions
            .put("order-watcher", "1.0.0", &definition_yaml(&root))
            .await
            .unwrap();
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let joins = Arc::new(InMemoryJoinStore::new());
        let listens = Arc::new(InMemoryListenStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let consumer = Consumer::new(definitions, outbox.clone(), joins, listens.clone(), publisher);

        let msg = start_message("order-watcher", "1.0.0", json!(null));
        let parked = consumer.handle_message(&msg).await.unwrap();
        assert!(parked.published.is_empty());
        assert!(parked.outbox_row_id.is_none());
        assert!(outbox.is_empty().await);
        assert_eq!(
            listens
                .matching(&json!({"type": "order.created"}))
                .await
                .unwrap()
                .len(),
            1
        );

        // A non-matching event doesn't wake the listener.
        consumer
            .handle_event(json!({"type": "order.cancelled"}))
            .await
            .unwrap();
        assert_eq!(
            listens
                .matching(&json!({"type": "order.created"}))
                .await
                .unwrap()
                .len(),
            1
        );

        consumer
            .handle_event(json!({"type": "order.created", "orderId": "o-1"}))
            .await
            .unwrap();

        // The matching event resumed and removed the park: it won't wake
        // the (now-gone) listener a second time.
        assert!(listens
            .matching(&json!({"type": "order.created"}))
            .await
            .unwrap()
            .is_empty());
    }
}
