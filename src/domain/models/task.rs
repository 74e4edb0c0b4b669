//! Task domain model.
//!
//! A task is one user objective driven through the orchestration lifecycle:
//! classification, planning, spawning, execution, consensus, persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::tenant::TenantContext;
use crate::domain::errors::TaskError;

/// Public status of a task. Exactly one terminal status is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted but not yet picked up.
    Pending,
    /// Being driven through the lifecycle.
    Running,
    /// Final artifact persisted.
    Completed,
    /// Failed; `error` is populated.
    Failed,
    /// Hard deadline elapsed.
    Timeout,
    /// Cancelled by operator or client.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are final; no further writes are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled, Self::Timeout, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Timeout, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// The class of work a task represents, from the submission type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analysis,
    Competition,
    Collaboration,
    Synthesis,
    Workflow,
    FileProcess,
    SecurityScan,
    CodeExecute,
}

impl Default for TaskKind {
    fn default() -> Self {
        Self::Analysis
    }
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Competition => "competition",
            Self::Collaboration => "collaboration",
            Self::Synthesis => "synthesis",
            Self::Workflow => "workflow",
            Self::FileProcess => "file_process",
            Self::SecurityScan => "security_scan",
            Self::CodeExecute => "code_execute",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "analysis" | "analyze" => Some(Self::Analysis),
            "competition" | "compete" => Some(Self::Competition),
            "collaboration" | "collaborate" => Some(Self::Collaboration),
            "synthesis" | "synthesize" => Some(Self::Synthesis),
            "workflow" => Some(Self::Workflow),
            "file_process" => Some(Self::FileProcess),
            "security_scan" => Some(Self::SecurityScan),
            "code_execute" => Some(Self::CodeExecute),
            _ => None,
        }
    }
}

/// Complexity classification driving model choice, timeouts, and consensus
/// depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    Extreme,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Extreme => "extreme",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "medium" | "moderate" => Some(Self::Medium),
            "complex" => Some(Self::Complex),
            "extreme" => Some(Self::Extreme),
            _ => None,
        }
    }

    /// Default completion estimate when no history exists.
    pub fn default_estimate_ms(&self) -> u64 {
        match self {
            Self::Simple => 60_000,
            Self::Medium => 120_000,
            Self::Complex => 240_000,
            Self::Extreme => 600_000,
        }
    }
}

/// Internal lifecycle phase, reported as `task:progress` percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Received,
    Enqueued,
    Classified,
    Planned,
    Spawning,
    Executing,
    Synthesizing,
    Persisting,
    Completed,
}

impl TaskPhase {
    /// Progress percentage streamed when this phase is reached.
    pub fn progress_pct(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Enqueued => 2,
            Self::Classified => 5,
            Self::Planned => 15,
            Self::Spawning => 25,
            Self::Executing => 70,
            Self::Synthesizing => 80,
            Self::Persisting => 95,
            Self::Completed => 100,
        }
    }
}

/// Caller-supplied execution constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Upper bound on cohort size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,
    /// Capabilities every selected model must advertise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    /// Preferred providers, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_providers: Vec<String>,
    /// Models to avoid entirely.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoid_models: Vec<String>,
}

/// One user objective driven through the orchestration lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    /// Canonical statement of what to do. Aliases (`task`, `query`,
    /// `prompt`) are translated to this field at ingress.
    pub objective: String,
    /// Free-form submission context.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub constraints: TaskConstraints,
    pub complexity: Complexity,
    pub status: TaskStatus,
    /// Conversation thread this task continues or starts.
    pub thread_id: Uuid,
    /// Reference into the memory store's synthesized retrieval context.
    pub memory_context_ref: Option<String>,
    /// External entity-store id, when one was created.
    pub entity_id: Option<String>,
    pub tenant: TenantContext,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(objective: impl Into<String>, tenant: TenantContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: TaskKind::default(),
            objective: objective.into(),
            context: HashMap::new(),
            constraints: TaskConstraints::default(),
            complexity: Complexity::default(),
            status: TaskStatus::default(),
            thread_id: Uuid::new_v4(),
            memory_context_ref: None,
            entity_id: None,
            tenant,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        match new_status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.objective.trim().is_empty() {
            return Err("Task objective cannot be empty".to_string());
        }
        self.tenant.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "ops")
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("Summarize the incident report", tenant());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("t", tenant());
        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut task = Task::new("t", tenant());
        task.transition_to(TaskStatus::Cancelled).unwrap();
        assert!(task.transition_to(TaskStatus::Running).is_err());
        assert!(task.transition_to(TaskStatus::Completed).is_err());
        assert!(task.transition_to(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut task = Task::new("t", tenant());
        assert!(task.status.can_transition_to(TaskStatus::Cancelled));
        task.transition_to(TaskStatus::Cancelled).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_complexity_defaults() {
        assert_eq!(Complexity::Simple.default_estimate_ms(), 60_000);
        assert_eq!(Complexity::Medium.default_estimate_ms(), 120_000);
        assert_eq!(Complexity::Complex.default_estimate_ms(), 240_000);
        assert_eq!(Complexity::Extreme.default_estimate_ms(), 600_000);
    }

    #[test]
    fn test_phase_progress() {
        assert_eq!(TaskPhase::Classified.progress_pct(), 5);
        assert_eq!(TaskPhase::Planned.progress_pct(), 15);
        assert_eq!(TaskPhase::Spawning.progress_pct(), 25);
        assert_eq!(TaskPhase::Executing.progress_pct(), 70);
        assert_eq!(TaskPhase::Synthesizing.progress_pct(), 80);
        assert_eq!(TaskPhase::Completed.progress_pct(), 100);
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!(TaskKind::from_str("analyze"), Some(TaskKind::Analysis));
        assert_eq!(TaskKind::from_str("compete"), Some(TaskKind::Competition));
        assert_eq!(TaskKind::from_str("orchestrated"), None);
    }

    #[test]
    fn test_validation() {
        let task = Task::new("   ", tenant());
        assert!(task.validate().is_err());
        let task = Task::new("real objective", tenant());
        assert!(task.validate().is_ok());
    }
}
