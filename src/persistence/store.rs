//! Trait definitions for the two tables the core depends on (spec §6.5):
//! the workflow definition cache and the outbox.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("definition not found: {name}@{version}")]
    DefinitionNotFound { name: String, version: String },

    #[error("outbox row not found: {0}")]
    OutboxRowNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A compiled-from-source workflow definition, content-addressed by
/// `(name, version)` (spec §6.2, §6.5).
#[derive(Debug, Clone)]
pub struct DefinitionRow {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub definition: String,
}

/// Which outbox table a row lives in — kept as two physical tables (spec
/// §6.5) so a WAIT backlog never starves RETRY dispatch or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Wait,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

/// One scheduled redelivery (spec §6.4): a message to republish once
/// `delayed_until` passes.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    /// Deterministic id derived from `(workflowInstanceId, position,
    /// attemptCount)` so redelivery of the same broker message is a no-op
    /// (spec §4.5 idempotency).
    pub id: String,
    pub kind: OutboxKind,
    pub message: String,
    pub status: OutboxStatus,
    pub delayed_until: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxRow {
    pub fn new(
        id: impl Into<String>,
        kind: OutboxKind,
        message: impl Into<String>,
        delayed_until: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        OutboxRow {
            id: id.into(),
            kind,
            message: message.into(),
            status: OutboxStatus::Pending,
            delayed_until,
            attempt_count: 0,
            max_attempts,
            last_error: None,
        }
    }
}

/// `(name, version) -> definitionText` lookup (spec §6.2).
#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid, StoreError>;

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DefinitionRow>, StoreError>;
}

/// The outbox scheduler's persistence surface (spec §4.6).
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Insert a row, or no-op if `id` already exists (idempotent retry of
    /// the same step).
    async fn enqueue(&self, row: OutboxRow) -> Result<(), StoreError>;

    /// Claim up to `batch_size` PENDING, due, under-attempt-limit rows of
    /// `kind`, ordered by `delayed_until` ascending, using `FOR UPDATE SKIP
    /// LOCKED` semantics so concurrent schedulers get disjoint batches.
    async fn claim_due(
        &self,
        kind: OutboxKind,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>, StoreError>;

    async fn mark_sent(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_delayed_until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete SENT rows older than `retention` (the cleanup loop, spec
    /// §4.6), in batches of `batch_size`. Returns the number deleted.
    async fn delete_sent_before(
        &self,
        kind: OutboxKind,
        before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<u64, StoreError>;
}

/// Durable accumulator for a `Fork`'s fan-in (spec §4.3, "fan-in of Fork" as
/// a suspension point). Branch completions arrive as independent broker
/// messages, each correlated against the *same* snapshot of the parent
/// taken at dispatch time, so the envelope alone can't tell a branch
/// completion which siblings have already reported — this table is the
/// single source of truth for that.
#[async_trait]
pub trait JoinStore: Send + Sync + 'static {
    /// Record `value` for `branch_index` under `(instance_id, position)`,
    /// then return every branch recorded so far for that join, including
    /// this one.
    async fn record_branch(
        &self,
        instance_id: &str,
        position: &str,
        branch_index: usize,
        value: Value,
    ) -> Result<HashMap<usize, Value>, StoreError>;

    /// Drop all recorded branches for a join once it has resolved, so the
    /// table doesn't grow unbounded across a long-lived instance's forks.
    async fn clear(&self, instance_id: &str, position: &str) -> Result<(), StoreError>;

    /// Mark a join permanently resolved, independent of `clear`. A `compete`
    /// fork can be satisfied by its first branch while the rest are still
    /// in flight (spec Non-goals rule out a cancellation signal to abandon
    /// them); their later completions must be recognised as late losers
    /// rather than re-triggering the fork's completion a second time.
    async fn close(&self, instance_id: &str, position: &str) -> Result<(), StoreError>;

    /// Whether `close` has already been called for this join.
    async fn is_closed(&self, instance_id: &str, position: &str) -> Result<bool, StoreError>;
}

/// One workflow instance parked in `ListenInstance` (spec §4.3, "external
/// event" suspension), waiting for an inbound event matching `filter`.
#[derive(Debug, Clone)]
pub struct ParkedListen {
    pub instance_id: String,
    pub position: String,
    /// The parent's own encoded envelope at the moment it suspended, the
    /// same transport `Correlation::parent_envelope` uses elsewhere.
    pub envelope: String,
    /// The `Listen` task's `to.with` filter, as a JSON object, matched
    /// against each inbound event the same way `resolve_event` does.
    pub filter: Value,
}

/// Durable parking lot for `Listen` suspensions (spec §4.3, `ListenInstance`).
/// Unlike `Fork`/`RunWorkflow`, a `Listen` has no outbound message of its
/// own to correlate against — nothing else in the system knows it's
/// waiting unless this store records it, so a later external event has
/// something to match against.
#[async_trait]
pub trait ListenStore: Send + Sync + 'static {
    async fn park(&self, listen: ParkedListen) -> Result<(), StoreError>;

    /// Every currently-parked listen whose `filter` is satisfied by `event`
    /// (every declared filter key present and equal — spec §11).
    async fn matching(&self, event: &Value) -> Result<Vec<ParkedListen>, StoreError>;

    async fn remove(&self, instance_id: &str, position: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_row_starts_pending_with_zero_attempts() {
        let row = OutboxRow::new("id-1", OutboxKind::Wait, "{}", Utc::now(), 5);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempt_count, 0);
    }
}
