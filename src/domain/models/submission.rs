//! Submission boundary types.
//!
//! One canonical field per concept: `objective` (aliases `task`, `query`,
//! `prompt`) and `timeout_ms` (alias `time_limit`) are translated here, at
//! ingress, and nowhere else.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::task::{Complexity, TaskConstraints, TaskKind, TaskStatus};

/// Options accepted alongside a submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Task type from the registry; defaults to `analysis`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    /// Client-supplied task id for idempotent resubmission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// Hard abort deadline. Canonical name; `time_limit` is accepted.
    #[serde(default, alias = "time_limit", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether the caller wants streamed progress.
    #[serde(default)]
    pub stream: bool,
    /// Subscriber session to attach task-room events to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Conversation thread to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub constraints: TaskConstraints,
}

/// A task submission after ingress normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Canonical statement of what to do.
    #[serde(alias = "task", alias = "query", alias = "prompt")]
    pub objective: String,
    #[serde(default)]
    pub options: SubmitOptions,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskSubmission {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            options: SubmitOptions::default(),
            context: HashMap::new(),
        }
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }
}

/// Metadata attached to every submission response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitMetadata {
    /// True when the short-message bypass handled the submission.
    #[serde(default)]
    pub bypass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Response returned by `submit_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub thread_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<Uuid>,
    pub metadata: SubmitMetadata,
}
