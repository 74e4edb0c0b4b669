//! Domain models.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod job;
pub mod retry;
pub mod stream;
pub mod submission;
pub mod task;
pub mod tenant;

pub use agent::{
    recommended_consensus_layers, AgentProfile, AgentRole, AgentSnapshot, AgentState,
    ExecutionResult, GenerationPlan, GenerationStrategy, ReasoningDepth,
};
pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointState};
pub use config::Config;
pub use consensus::{ConflictResolution, ConsensusResult, ScoringWeights};
pub use job::{JobRecord, JobState, JobStatusView};
pub use retry::{
    ErrorCategory, ErrorPattern, ErrorSeverity, RetryAttempt, RetryConfig, RetryContext,
    RetryStrategy,
};
pub use stream::{
    RoomKey, SessionInfo, StreamEvent, StreamFrame, StreamProgress, Subscription,
};
pub use submission::{SubmitMetadata, SubmitOptions, SubmitResponse, TaskSubmission};
pub use task::{Complexity, Task, TaskConstraints, TaskKind, TaskPhase, TaskStatus};
pub use tenant::TenantContext;
