//! Job records for the durable FIFO intake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tenant::TenantContext;
use crate::domain::errors::TaskError;

/// State of a job in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One durable job. Delivery is at-least-once: the `id` doubles as the
/// idempotency key for processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Processor type, e.g. `orchestrate`, `vision_ocr`.
    pub job_type: String,
    pub params: serde_json::Value,
    pub tenant: TenantContext,
    pub state: JobState,
    pub progress: u8,
    pub priority: i32,
    pub timeout_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>, params: serde_json::Value, tenant: TenantContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            params,
            tenant,
            state: JobState::Queued,
            progress: 0,
            priority: 0,
            timeout_ms: None,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Storage key under the job prefix.
    pub fn storage_key(id: Uuid) -> String {
        format!("nexus:tasks:{id}")
    }
}

/// Status view returned by `get_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub status: JobState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(job: &JobRecord) -> Self {
        Self {
            status: job.state,
            progress: job.progress,
            result: job.result.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::tenant::TenantContext;

    #[test]
    fn test_job_key_prefix() {
        let id = Uuid::new_v4();
        assert!(JobRecord::storage_key(id).starts_with("nexus:tasks:"));
    }

    #[test]
    fn test_status_view() {
        let job = JobRecord::new("orchestrate", serde_json::json!({}), TenantContext::new("a", "b"));
        let view = JobStatusView::from(&job);
        assert_eq!(view.status, JobState::Queued);
        assert_eq!(view.progress, 0);
        assert!(view.result.is_none());
    }
}
