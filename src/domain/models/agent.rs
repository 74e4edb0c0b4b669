//! Agent domain model.
//!
//! An agent is a single-model worker bound to a generated profile. It
//! produces exactly one output per task and is never reused after disposal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Complexity;

/// Role an agent plays in the cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Research,
    Coding,
    Review,
    Synthesis,
    Specialist,
}

impl Default for AgentRole {
    fn default() -> Self {
        Self::Specialist
    }
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Synthesis => "synthesis",
            Self::Specialist => "specialist",
        }
    }

    /// Coerce a free-form role string to the known set. Unknown roles
    /// default to `Specialist`.
    pub fn coerce(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "research" | "researcher" => Self::Research,
            "coding" | "coder" | "engineer" => Self::Coding,
            "review" | "reviewer" | "critic" => Self::Review,
            "synthesis" | "synthesizer" => Self::Synthesis,
            _ => Self::Specialist,
        }
    }
}

/// How deeply the agent should reason before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningDepth {
    Shallow,
    Medium,
    Deep,
    Extreme,
}

impl Default for ReasoningDepth {
    fn default() -> Self {
        Self::Medium
    }
}

impl ReasoningDepth {
    pub fn coerce(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shallow" => Self::Shallow,
            "deep" => Self::Deep,
            "extreme" => Self::Extreme,
            _ => Self::Medium,
        }
    }
}

/// Declarative description of a planned agent, generated per task and
/// immutable once a model is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub specialization: String,
    pub focus: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Relative weight in consensus scoring, clamped to [1, 10].
    pub priority: u8,
    pub reasoning_depth: ReasoningDepth,
    /// Assigned by the model selector; empty until assignment.
    #[serde(default)]
    pub model_id: String,
}

impl AgentProfile {
    pub fn new(role: AgentRole, specialization: impl Into<String>) -> Self {
        Self {
            role,
            specialization: specialization.into(),
            focus: String::new(),
            capabilities: Vec::new(),
            priority: 5,
            reasoning_depth: ReasoningDepth::default(),
            model_id: String::new(),
        }
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = focus.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Clamp out-of-range fields in place. Used after parsing profiles
    /// emitted by the meta-analyzer.
    pub fn normalize(&mut self) {
        self.priority = self.priority.clamp(1, 10);
        if self.specialization.trim().is_empty() {
            self.specialization = self.role.as_str().to_string();
        }
    }
}

/// Lifecycle state of a spawned agent. There is no path out of `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Disposed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        }
    }
}

/// Output of one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub agent_id: Uuid,
    pub model_id: String,
    pub role: AgentRole,
    pub output: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cohort execution strategy chosen by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationStrategy {
    SingleAgent,
    SequentialCollaboration,
    ParallelSynthesis,
    CompetitiveConsensus,
}

impl GenerationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleAgent => "single-agent",
            Self::SequentialCollaboration => "sequential-collaboration",
            Self::ParallelSynthesis => "parallel-synthesis",
            Self::CompetitiveConsensus => "competitive-consensus",
        }
    }

    /// Strategy selection rule: single for one agent, sequential for small
    /// cohorts, competitive for extreme complexity or large cohorts.
    pub fn select(agent_count: usize, complexity: Complexity) -> Self {
        if agent_count == 1 {
            Self::SingleAgent
        } else if complexity == Complexity::Extreme || agent_count >= 8 {
            Self::CompetitiveConsensus
        } else if agent_count <= 3 {
            Self::SequentialCollaboration
        } else {
            Self::ParallelSynthesis
        }
    }
}

/// Consensus layer count by cohort size and complexity.
pub fn recommended_consensus_layers(agent_count: usize, complexity: Complexity) -> u8 {
    if agent_count <= 1 {
        return 0;
    }
    match complexity {
        Complexity::Simple => 1,
        Complexity::Medium => 2,
        Complexity::Complex | Complexity::Extreme => 3,
    }
}

/// Output of the agent generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationPlan {
    pub profiles: Vec<AgentProfile>,
    pub strategy: GenerationStrategy,
    pub estimated_duration_ms: u64,
    pub recommended_consensus_layers: u8,
}

/// Snapshot of a live agent, as reported by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: Uuid,
    pub model_id: String,
    pub role: AgentRole,
    pub state: AgentState,
    pub task_id: Uuid,
    pub spawned_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}
