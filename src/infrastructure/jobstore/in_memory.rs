//! In-memory job store.
//!
//! Reference implementation of the `JobStore` port with Redis-Streams-like
//! semantics: FIFO delivery within priority, at-least-once redelivery on
//! failure, and a keyed record space with TTLs. Used by the default wiring
//! and the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult, TaskError};
use crate::domain::models::{JobRecord, JobState, TenantContext};
use crate::domain::ports::{EnqueueOptions, JobStore};

/// Keys live this long, mirroring the backing store's 24 h TTL.
const KEY_TTL: Duration = Duration::hours(24);

struct RecordEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<Uuid, JobRecord>,
    /// Delivery order: enqueue order, drained by priority.
    queue: Vec<Uuid>,
    records: HashMap<String, RecordEntry>,
}

/// In-memory `JobStore`.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting for delivery.
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        params: serde_json::Value,
        opts: EnqueueOptions,
        tenant: &TenantContext,
    ) -> CoreResult<Uuid> {
        let mut job = JobRecord::new(job_type, params, tenant.clone());
        job.timeout_ms = opts.timeout_ms;
        job.priority = opts.priority;
        let id = job.id;

        let mut inner = self.inner.lock().await;
        inner.jobs.insert(id, job);
        inner.queue.push(id);
        Ok(id)
    }

    async fn reserve(&self, _worker: &str) -> CoreResult<Option<JobRecord>> {
        let mut inner = self.inner.lock().await;

        // Highest priority first; enqueue order within a priority.
        let mut next: Option<(usize, i32)> = None;
        for (pos, id) in inner.queue.iter().enumerate() {
            let priority = inner.jobs.get(id).map_or(0, |j| j.priority);
            let better = match next {
                Some((_, best)) => priority > best,
                None => true,
            };
            if better {
                next = Some((pos, priority));
            }
        }

        let Some((pos, _)) = next else {
            return Ok(None);
        };
        let id = inner.queue.remove(pos);
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn ack(&self, job_id: Uuid, result: serde_json::Value) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, reason: &TaskError) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        job.state = JobState::Failed;
        job.error = Some(reason.clone());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn progress(&self, job_id: Uuid, pct: u8) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        job.progress = pct.min(100);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> CoreResult<Option<JobRecord>> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_by_state(&self, state: JobState) -> CoreResult<Vec<JobRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect())
    }

    async fn put_record(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_secs: u64,
    ) -> CoreResult<()> {
        let ttl = Duration::seconds(i64::try_from(ttl_secs).unwrap_or(KEY_TTL.num_seconds()));
        self.inner.lock().await.records.insert(
            key.to_string(),
            RecordEntry {
                value,
                expires_at: Utc::now() + ttl.min(KEY_TTL),
            },
        );
        Ok(())
    }

    async fn get_record(&self, key: &str) -> CoreResult<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .map(|e| e.value.clone()))
    }

    async fn delete_record(&self, key: &str) -> CoreResult<()> {
        self.inner.lock().await.records.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, serde_json::Value)>> {
        let now = Utc::now();
        Ok(self
            .inner
            .lock()
            .await
            .records
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.expires_at > now)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }
}
