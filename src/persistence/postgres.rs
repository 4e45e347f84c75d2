//! PostgreSQL implementations of [`DefinitionStore`] and [`OutboxStore`].
//!
//! Outbox claiming uses `FOR UPDATE SKIP LOCKED` so concurrent scheduler
//! instances never block on, or double-claim, the same row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{
    DefinitionRow, DefinitionStore, JoinStore, ListenStore, OutboxKind, OutboxRow, OutboxStatus,
    OutboxStore, ParkedListen, StoreError,
};

fn kind_table(kind: OutboxKind) -> &'static str {
    match kind {
        OutboxKind::Wait => "outbox_wait",
        OutboxKind::Retry => "outbox_retry",
    }
}

/// PostgreSQL-backed [`DefinitionStore`].
#[derive(Clone)]
pub struct PostgresDefinitionStore {
    pool: PgPool,
}

impl PostgresDefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl DefinitionStore for PostgresDefinitionStore {
    #[instrument(skip(self, definition))]
    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO definitions (id, name, version, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, version) DO UPDATE SET definition = EXCLUDED.definition
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(version)
        .bind(definition)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to store definition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%name, %version, "stored definition");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DefinitionRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, version, definition
            FROM definitions
            WHERE name = $1 AND version = $2
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to look up definition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(|row| DefinitionRow {
            id: row.get("id"),
            name: row.get("name"),
            version: row.get("version"),
            definition: row.get("definition"),
        }))
    }
}

/// PostgreSQL-backed [`OutboxStore`], split across the `outbox_wait` and
/// `outbox_retry` tables (spec §6.5) so neither backlog blocks the other.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, row))]
    async fn enqueue(&self, row: OutboxRow) -> Result<(), StoreError> {
        let table = kind_table(row.kind);
        let query = format!(
            r#"
            INSERT INTO {table}
                (id, message, status, delayed_until, attempt_count, max_attempts, last_error)
            VALUES ($1, $2, 'pending', $3, 0, $4, NULL)
            ON CONFLICT (id) DO NOTHING
            "#
        );
        sqlx::query(&query)
            .bind(&row.id)
            .bind(&row.message)
            .bind(row.delayed_until)
            .bind(row.max_attempts as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to enqueue outbox row: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_due(
        &self,
        kind: OutboxKind,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let table = kind_table(kind);
        let query = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE status = 'pending'
                  AND delayed_until <= NOW()
                  AND attempt_count < max_attempts
                ORDER BY delayed_until
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} t
            SET attempt_count = attempt_count + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.message, t.status, t.delayed_until, t.attempt_count,
                      t.max_attempts, t.last_error
            "#
        );
        let rows = sqlx::query(&query)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to claim outbox rows: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(rows
            .into_iter()
            .map(|row| OutboxRow {
                id: row.get("id"),
                kind,
                message: row.get("message"),
                status: OutboxStatus::Pending,
                delayed_until: row.get("delayed_until"),
                attempt_count: row.get::<i32, _>("attempt_count") as u32,
                max_attempts: row.get::<i32, _>("max_attempts") as u32,
                last_error: row.get("last_error"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_sent(&self, id: &str) -> Result<(), StoreError> {
        for kind in [OutboxKind::Wait, OutboxKind::Retry] {
            let table = kind_table(kind);
            let query = format!("UPDATE {table} SET status = 'sent' WHERE id = $1");
            let result = sqlx::query(&query)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("failed to mark outbox row sent: {}", e);
                    StoreError::Database(e.to_string())
                })?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(StoreError::OutboxRowNotFound(id.to_string()))
    }

    #[instrument(skip(self, error))]
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_delayed_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for kind in [OutboxKind::Wait, OutboxKind::Retry] {
            let table = kind_table(kind);
            let query = format!(
                "UPDATE {table} SET last_error = $2, delayed_until = $3 WHERE id = $1"
            );
            let result = sqlx::query(&query)
                .bind(id)
                .bind(error)
                .bind(next_delayed_until)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    tracing::error!("failed to mark outbox row failed: {}", e);
                    StoreError::Database(e.to_string())
                })?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(StoreError::OutboxRowNotFound(id.to_string()))
    }

    #[instrument(skip(self))]
    async fn delete_sent_before(
        &self,
        kind: OutboxKind,
        before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<u64, StoreError> {
        let table = kind_table(kind);
        let query = format!(
            r#"
            DELETE FROM {table}
            WHERE id IN (
                SELECT id FROM {table}
                WHERE status = 'sent' AND delayed_until < $1
                LIMIT $2
            )
            "#
        );
        let result = sqlx::query(&query)
            .bind(before)
            .bind(batch_size as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to delete sent outbox rows: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(result.rows_affected())
    }
}

/// PostgreSQL-backed [`JoinStore`] for `Fork` fan-in, keyed by
/// `(instance_id, position, branch_index)`.
#[derive(Clone)]
pub struct PostgresJoinStore {
    pool: PgPool,
}

impl PostgresJoinStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl JoinStore for PostgresJoinStore {
    #[instrument(skip(self, value))]
    async fn record_branch(
        &self,
        instance_id: &str,
        position: &str,
        branch_index: usize,
        value: Value,
    ) -> Result<HashMap<usize, Value>, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fork_joins (instance_id, position, branch_index, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id, position, branch_index)
            DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(instance_id)
        .bind(position)
        .bind(branch_index as i32)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to record fork branch: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let rows = sqlx::query(
            r#"
            SELECT branch_index, value FROM fork_joins
            WHERE instance_id = $1 AND position = $2
            "#,
        )
        .bind(instance_id)
        .bind(position)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to load fork joins: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i32, _>("branch_index") as usize,
                    row.get::<Value, _>("value"),
                )
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn clear(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM fork_joins WHERE instance_id = $1 AND position = $2")
            .bind(instance_id)
            .bind(position)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to clear fork joins: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn close(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fork_joins_closed (instance_id, position)
            VALUES ($1, $2)
            ON CONFLICT (instance_id, position) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(position)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to close fork join: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn is_closed(&self, instance_id: &str, position: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM fork_joins_closed WHERE instance_id = $1 AND position = $2",
        )
        .bind(instance_id)
        .bind(position)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to check fork join closed state: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(row.is_some())
    }
}

/// PostgreSQL-backed [`ListenStore`] for `Listen` suspensions, keyed by
/// `(instance_id, position)`, matched via JSONB containment.
#[derive(Clone)]
pub struct PostgresListenStore {
    pool: PgPool,
}

impl PostgresListenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ListenStore for PostgresListenStore {
    #[instrument(skip(self, listen))]
    async fn park(&self, listen: ParkedListen) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listen_waits (instance_id, position, envelope, filter)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id, position)
            DO UPDATE SET envelope = EXCLUDED.envelope, filter = EXCLUDED.filter
            "#,
        )
        .bind(&listen.instance_id)
        .bind(&listen.position)
        .bind(&listen.envelope)
        .bind(&listen.filter)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to park listen: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn matching(&self, event: &Value) -> Result<Vec<ParkedListen>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, position, envelope, filter
            FROM listen_waits
            WHERE $1::jsonb @> filter
            "#,
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to match parked listens: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows
            .into_iter()
            .map(|row| ParkedListen {
                instance_id: row.get("instance_id"),
                position: row.get("position"),
                envelope: row.get("envelope"),
                filter: row.get::<Value, _>("filter"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn remove(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM listen_waits WHERE instance_id = $1 AND position = $2")
            .bind(instance_id)
            .bind(position)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to remove parked listen: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }
}
