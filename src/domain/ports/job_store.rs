//! Job store port.
//!
//! A Redis-Streams-like durable FIFO with at-least-once delivery, plus a
//! small keyed record space used for checkpoints and plan objects. Keys
//! carry a 24 h TTL; the engine uses the `nexus:tasks:*` and
//! `nexus:checkpoints:*` prefixes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{CoreResult, TaskError};
use crate::domain::models::{JobRecord, JobState, TenantContext};

/// Options accepted at enqueue time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

/// Port interface for the durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append a job; returns its id.
    async fn enqueue(
        &self,
        job_type: &str,
        params: serde_json::Value,
        opts: EnqueueOptions,
        tenant: &TenantContext,
    ) -> CoreResult<Uuid>;

    /// Reserve the next deliverable job for a worker, if any.
    async fn reserve(&self, worker: &str) -> CoreResult<Option<JobRecord>>;

    /// Acknowledge successful processing.
    async fn ack(&self, job_id: Uuid, result: serde_json::Value) -> CoreResult<()>;

    /// Mark a delivery failed with the reason; the job may be redelivered.
    async fn fail(&self, job_id: Uuid, reason: &TaskError) -> CoreResult<()>;

    /// Update delivery progress.
    async fn progress(&self, job_id: Uuid, pct: u8) -> CoreResult<()>;

    /// Fetch a job's current state.
    async fn get(&self, job_id: Uuid) -> CoreResult<Option<JobRecord>>;

    /// Jobs currently in a given state.
    async fn list_by_state(&self, state: JobState) -> CoreResult<Vec<JobRecord>>;

    // Keyed record space (checkpoints, plan objects).

    /// Write a keyed record with a TTL in seconds.
    async fn put_record(&self, key: &str, value: serde_json::Value, ttl_secs: u64)
        -> CoreResult<()>;

    /// Read a keyed record.
    async fn get_record(&self, key: &str) -> CoreResult<Option<serde_json::Value>>;

    /// Delete a keyed record.
    async fn delete_record(&self, key: &str) -> CoreResult<()>;

    /// All live records under a key prefix.
    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, serde_json::Value)>>;
}
