//! In-memory implementations of [`DefinitionStore`] and [`OutboxStore`],
//! for tests and the single-process worker profile.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{
    DefinitionRow, DefinitionStore, JoinStore, ListenStore, OutboxKind, OutboxRow, OutboxStatus,
    OutboxStore, ParkedListen, StoreError,
};

/// In-memory [`DefinitionStore`]. Stores all data in memory; same semantics
/// as the Postgres implementation, without durability.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    rows: RwLock<HashMap<(String, String), DefinitionRow>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let mut rows = self.rows.write().await;
        rows.insert(
            (name.to_string(), version.to_string()),
            DefinitionRow {
                id,
                name: name.to_string(),
                version: version.to_string(),
                definition: definition.to_string(),
            },
        );
        Ok(id)
    }

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DefinitionRow>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(name.to_string(), version.to_string())).cloned())
    }
}

/// In-memory [`OutboxStore`], partitioned by [`OutboxKind`] the way the
/// Postgres implementation keeps two physical tables.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<HashMap<String, OutboxRow>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, row: OutboxRow) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.entry(row.id.clone()).or_insert(row);
        Ok(())
    }

    async fn claim_due(
        &self,
        kind: OutboxKind,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut due: Vec<_> = rows
            .values()
            .filter(|r| {
                r.kind == kind
                    && r.status == OutboxStatus::Pending
                    && r.delayed_until <= now
                    && r.attempt_count < r.max_attempts
            })
            .map(|r| r.id.clone())
            .collect();
        due.sort_by_key(|id| rows[id].delayed_until);
        due.truncate(batch_size);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let row = rows.get_mut(&id).expect("id came from this map");
            row.attempt_count += 1;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::OutboxRowNotFound(id.to_string()))?;
        row.status = OutboxStatus::Sent;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_delayed_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::OutboxRowNotFound(id.to_string()))?;
        row.last_error = Some(error.to_string());
        row.delayed_until = next_delayed_until;
        Ok(())
    }

    async fn delete_sent_before(
        &self,
        kind: OutboxKind,
        before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let to_delete: Vec<_> = rows
            .values()
            .filter(|r| r.kind == kind && r.status == OutboxStatus::Sent && r.delayed_until < before)
            .take(batch_size)
            .map(|r| r.id.clone())
            .collect();
        let count = to_delete.len() as u64;
        for id in to_delete {
            rows.remove(&id);
        }
        Ok(count)
    }
}

/// In-memory [`JoinStore`], keyed by `(instance_id, position)`.
#[derive(Default)]
pub struct InMemoryJoinStore {
    branches: RwLock<HashMap<(String, String), HashMap<usize, Value>>>,
    closed: RwLock<std::collections::HashSet<(String, String)>>,
}

impl InMemoryJoinStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JoinStore for InMemoryJoinStore {
    async fn record_branch(
        &self,
        instance_id: &str,
        position: &str,
        branch_index: usize,
        value: Value,
    ) -> Result<HashMap<usize, Value>, StoreError> {
        let mut branches = self.branches.write().await;
        let joined = branches
            .entry((instance_id.to_string(), position.to_string()))
            .or_default();
        joined.insert(branch_index, value);
        Ok(joined.clone())
    }

    async fn clear(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        self.branches
            .write()
            .await
            .remove(&(instance_id.to_string(), position.to_string()));
        Ok(())
    }

    async fn close(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        self.closed
            .write()
            .await
            .insert((instance_id.to_string(), position.to_string()));
        Ok(())
    }

    async fn is_closed(&self, instance_id: &str, position: &str) -> Result<bool, StoreError> {
        Ok(self
            .closed
            .read()
            .await
            .contains(&(instance_id.to_string(), position.to_string())))
    }
}

/// In-memory [`ListenStore`]. Filter matching is a linear scan, which is
/// fine at the scale a single in-process worker parks listens at.
#[derive(Default)]
pub struct InMemoryListenStore {
    parked: RwLock<HashMap<(String, String), ParkedListen>>,
}

impl InMemoryListenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn filter_matches(filter: &Value, event: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter
        .iter()
        .all(|(key, expected)| event.get(key).map(|actual| actual == expected).unwrap_or(false))
}

#[async_trait]
impl ListenStore for InMemoryListenStore {
    async fn park(&self, listen: ParkedListen) -> Result<(), StoreError> {
        self.parked
            .write()
            .await
            .insert((listen.instance_id.clone(), listen.position.clone()), listen);
        Ok(())
    }

    async fn matching(&self, event: &Value) -> Result<Vec<ParkedListen>, StoreError> {
        Ok(self
            .parked
            .read()
            .await
            .values()
            .filter(|p| filter_matches(&p.filter, event))
            .cloned()
            .collect())
    }

    async fn remove(&self, instance_id: &str, position: &str) -> Result<(), StoreError> {
        self.parked
            .write()
            .await
            .remove(&(instance_id.to_string(), position.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn definition_round_trips_by_name_and_version() {
        let store = InMemoryDefinitionStore::new();
        store.put("greet", "1.0.0", "do: []").await.unwrap();

        let found = store
            .find_by_name_and_version("greet", "1.0.0")
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().definition, "do: []");

        assert!(store
            .find_by_name_and_version("greet", "2.0.0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_due_respects_delay_and_attempt_limit() {
        let store = InMemoryOutboxStore::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        store
            .enqueue(OutboxRow::new("not-due", OutboxKind::Wait, "{}", future, 5))
            .await
            .unwrap();
        store
            .enqueue(OutboxRow::new(
                "due",
                OutboxKind::Wait,
                "{}",
                Utc::now(),
                5,
            ))
            .await
            .unwrap();

        let claimed = store.claim_due(OutboxKind::Wait, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "due");
        assert_eq!(claimed[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_not_reclaimed() {
        let store = InMemoryOutboxStore::new();
        let mut row = OutboxRow::new("maxed", OutboxKind::Retry, "{}", Utc::now(), 1);
        row.attempt_count = 1;
        store.enqueue(row).await.unwrap();

        let claimed = store.claim_due(OutboxKind::Retry, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn sent_rows_older_than_cutoff_are_deleted() {
        let store = InMemoryOutboxStore::new();
        store
            .enqueue(OutboxRow::new(
                "old",
                OutboxKind::Wait,
                "{}",
                Utc::now() - chrono::Duration::days(2),
                5,
            ))
            .await
            .unwrap();
        store.mark_sent("old").await.unwrap();

        let deleted = store
            .delete_sent_before(OutboxKind::Wait, Utc::now(), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn join_store_accumulates_branches_until_cleared() {
        let store = InMemoryJoinStore::new();
        let joined = store
            .record_branch("inst-1", "/fork", 0, serde_json::json!("a"))
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);

        let joined = store
            .record_branch("inst-1", "/fork", 1, serde_json::json!("b"))
            .await
            .unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[&0], serde_json::json!("a"));
        assert_eq!(joined[&1], serde_json::json!("b"));

        store.clear("inst-1", "/fork").await.unwrap();
        let joined = store
            .record_branch("inst-1", "/fork", 0, serde_json::json!("c"))
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);
    }

    #[tokio::test]
    async fn closing_a_join_is_independent_of_clearing_it() {
        let store = InMemoryJoinStore::new();
        assert!(!store.is_closed("inst-1", "/fork").await.unwrap());

        store
            .record_branch("inst-1", "/fork", 0, serde_json::json!("winner"))
            .await
            .unwrap();
        store.close("inst-1", "/fork").await.unwrap();
        store.clear("inst-1", "/fork").await.unwrap();

        assert!(store.is_closed("inst-1", "/fork").await.unwrap());
    }

    #[tokio::test]
    async fn listen_store_matches_only_listens_whose_filter_fits() {
        let store = InMemoryListenStore::new();
        store
            .park(ParkedListen {
                instance_id: "inst-1".to_string(),
                position: "/listen".to_string(),
                envelope: "{}".to_string(),
                filter: serde_json::json!({"type": "order.created"}),
            })
            .await
            .unwrap();
        store
            .park(ParkedListen {
                instance_id: "inst-2".to_string(),
                position: "/listen".to_string(),
                envelope: "{}".to_string(),
                filter: serde_json::json!({"type": "order.cancelled"}),
            })
            .await
            .unwrap();

        let matches = store
            .matching(&serde_json::json!({"type": "order.created", "id": 7}))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].instance_id, "inst-1");

        store.remove("inst-1", "/listen").await.unwrap();
        let matches = store
            .matching(&serde_json::json!({"type": "order.created"}))
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
