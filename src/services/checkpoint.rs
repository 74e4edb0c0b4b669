//! Write-ahead checkpointing for synthesis durability.
//!
//! A checkpoint is written `pending` before the durable document write and
//! committed only after the store acknowledges it. Pending entries found at
//! startup are replayed so a crash between the two steps completes instead
//! of losing the synthesis.

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::CheckpointConfig;
use crate::domain::models::{Checkpoint, CheckpointState};
use crate::domain::ports::JobStore;

/// Outcome of one startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub skipped: usize,
}

/// Write-ahead checkpoint log over the job store's keyed records.
pub struct CheckpointService {
    store: Arc<dyn JobStore>,
    config: CheckpointConfig,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn JobStore>, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    /// Persist a pending checkpoint. The TTL covers the expected
    /// persistence window.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> CoreResult<()> {
        let key = Checkpoint::storage_key(checkpoint.task_id);
        let value = serde_json::to_value(checkpoint)?;
        self.store
            .put_record(&key, value, self.config.ttl_secs)
            .await
    }

    /// Transition a task's checkpoint to committed. Committed entries are
    /// kept only for the grace window, then expire.
    pub async fn commit_checkpoint(&self, task_id: Uuid) -> CoreResult<()> {
        let key = Checkpoint::storage_key(task_id);
        let value = self
            .store
            .get_record(&key)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("checkpoint for task {task_id}")))?;
        let mut checkpoint: Checkpoint = serde_json::from_value(value)?;
        checkpoint.state = CheckpointState::Committed;
        self.store
            .put_record(
                &key,
                serde_json::to_value(&checkpoint)?,
                self.config.commit_grace_secs,
            )
            .await
    }

    /// Checkpoint for one task, if present.
    pub async fn get_checkpoint(&self, task_id: Uuid) -> CoreResult<Option<Checkpoint>> {
        let key = Checkpoint::storage_key(task_id);
        match self.store.get_record(&key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All non-committed checkpoints.
    pub async fn list_pending_checkpoints(&self) -> CoreResult<Vec<Checkpoint>> {
        let records = self.store.scan_prefix("nexus:checkpoints:").await?;
        let mut pending = Vec::new();
        for (key, value) in records {
            match serde_json::from_value::<Checkpoint>(value) {
                Ok(checkpoint) if checkpoint.is_pending() => pending.push(checkpoint),
                Ok(_) => {}
                Err(err) => warn!(key, error = %err, "unreadable checkpoint skipped"),
            }
        }
        Ok(pending)
    }

    /// Replay durable persistence for every pending checkpoint. `replay`
    /// re-runs the document write idempotently; success commits, failure
    /// logs and skips so the next startup retries.
    pub async fn recover_pending_checkpoints<F, Fut>(&self, replay: F) -> RecoveryReport
    where
        F: Fn(Checkpoint) -> Fut,
        Fut: Future<Output = CoreResult<()>>,
    {
        let pending = match self.list_pending_checkpoints().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "checkpoint scan failed, skipping recovery");
                return RecoveryReport::default();
            }
        };

        let mut report = RecoveryReport::default();
        for checkpoint in pending {
            let task_id = checkpoint.task_id;
            match replay(checkpoint).await {
                Ok(()) => match self.commit_checkpoint(task_id).await {
                    Ok(()) => {
                        info!(task_id = %task_id, "checkpoint recovered and committed");
                        report.recovered += 1;
                    }
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "recovered but commit failed");
                        report.skipped += 1;
                    }
                },
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "checkpoint replay failed, skipping");
                    report.skipped += 1;
                }
            }
        }
        report
    }
}
