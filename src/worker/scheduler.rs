//! Outbox Scheduler: two independent, timer-driven loops per row kind
//! (WAIT and RETRY), each a process loop plus a cleanup loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, instrument, trace};

use crate::persistence::{OutboxKind, OutboxStore, StoreError};

/// Configuration for one outbox kind's process and cleanup loops (spec
/// §6.6 `wait.outbox.*` / `retry.outbox.*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// How often the process loop claims and publishes a batch.
    #[serde(with = "duration_secs")]
    pub every: Duration,

    /// Maximum rows claimed per process-loop tick.
    pub batch_size: usize,

    /// How often the cleanup loop deletes SENT rows.
    #[serde(with = "duration_secs")]
    pub cleanup_every: Duration,

    /// SENT rows older than this are eligible for deletion.
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Maximum rows deleted per cleanup-loop tick.
    pub cleanup_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(1),
            batch_size: 100,
            cleanup_every: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_batch_size: 1000,
        }
    }
}

/// Publishes a claimed outbox row's message to the broker. Implemented by
/// the messaging binding; kept abstract here so the scheduler has no
/// broker-specific dependency.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, message: &str) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Drives the process and cleanup loops for a single [`OutboxKind`].
pub struct OutboxScheduler<S: OutboxStore, P: Publisher> {
    store: Arc<S>,
    publisher: Arc<P>,
    kind: OutboxKind,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: OutboxStore, P: Publisher> OutboxScheduler<S, P> {
    pub fn new(
        store: Arc<S>,
        publisher: Arc<P>,
        kind: OutboxKind,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            publisher,
            kind,
            config,
            shutdown_rx,
        }
    }

    /// Run the process loop until shutdown is signalled.
    pub async fn run_process_loop(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!(kind = ?self.kind, "process loop shutting down");
                return;
            }
            if let Err(e) = self.process_once().await {
                error!(kind = ?self.kind, error = %e, "process tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.every) => {}
                _ = self.shutdown_rx.changed() => return,
            }
        }
    }

    /// Run the cleanup loop until shutdown is signalled.
    pub async fn run_cleanup_loop(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!(kind = ?self.kind, "cleanup loop shutting down");
                return;
            }
            if let Err(e) = self.cleanup_once().await {
                error!(kind = ?self.kind, error = %e, "cleanup tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_every) => {}
                _ = self.shutdown_rx.changed() => return,
            }
        }
    }

    /// One claim-publish-settle cycle (spec §4.6 process loop).
    #[instrument(skip(self))]
    pub async fn process_once(&self) -> Result<usize, StoreError> {
        let batch = self
            .store
            .claim_due(self.kind, self.config.batch_size)
            .await?;
        if batch.is_empty() {
            trace!(kind = ?self.kind, "no outbox rows due");
            return Ok(0);
        }

        let claimed = batch.len();
        for row in batch {
            match self.publisher.publish(&row.message).await {
                Ok(()) => {
                    self.store.mark_sent(&row.id).await?;
                }
                Err(e) => {
                    let retry = crate::reliability::RetryPolicy::default();
                    let delay = retry.delay_for_attempt(row.attempt_count);
                    let next = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    self.store.mark_failed(&row.id, &e.0, next).await?;
                }
            }
        }
        debug!(kind = ?self.kind, claimed, "processed outbox batch");
        Ok(claimed)
    }

    /// One cleanup cycle (spec §4.6 cleanup loop).
    #[instrument(skip(self))]
    pub async fn cleanup_once(&self) -> Result<u64, StoreError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::zero());
        let deleted = self
            .store
            .delete_sent_before(self.kind, cutoff, self.config.cleanup_batch_size)
            .await?;
        if deleted > 0 {
            debug!(kind = ?self.kind, deleted, "cleaned up sent outbox rows");
        }
        Ok(deleted)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
