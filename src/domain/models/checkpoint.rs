//! Write-ahead checkpoint model.
//!
//! A checkpoint is written before durable persistence of a synthesis result
//! and replayed at startup to complete persistence after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    /// Written, persistence not yet acknowledged.
    Pending,
    /// The document store acknowledged the artifact is durable.
    Committed,
}

/// Metadata carried on a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model that produced the synthesis.
    pub model_id: String,
    pub ts: DateTime<Utc>,
}

/// Write-ahead record for one task's synthesis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Uuid,
    pub checkpoint_id: Uuid,
    pub synthesis_result: serde_json::Value,
    pub agent_count: usize,
    pub consensus_strength: f64,
    pub metadata: CheckpointMetadata,
    pub state: CheckpointState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        task_id: Uuid,
        synthesis_result: serde_json::Value,
        agent_count: usize,
        consensus_strength: f64,
        model_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            checkpoint_id: Uuid::new_v4(),
            synthesis_result,
            agent_count,
            consensus_strength,
            metadata: CheckpointMetadata {
                model_id: model_id.into(),
                ts: now,
            },
            state: CheckpointState::Pending,
            created_at: now,
        }
    }

    /// Storage key for this task's checkpoint.
    pub fn storage_key(task_id: Uuid) -> String {
        format!("nexus:checkpoints:{task_id}")
    }

    pub fn is_pending(&self) -> bool {
        self.state == CheckpointState::Pending
    }
}
