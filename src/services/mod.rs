//! Services: the engine's component layer.

pub mod adaptive_timeout;
pub mod agent;
pub mod agent_generator;
pub mod agent_pool;
pub mod cancel;
pub mod checkpoint;
pub mod consensus;
pub mod job_manager;
pub mod model_selector;
pub mod resource_scope;
pub mod retry_analyzer;
pub mod retry_executor;
pub mod spawner;
pub mod stream_hub;
pub mod task_queue;

pub use adaptive_timeout::{AdaptiveTimeoutManager, ProgressSignal};
pub use agent::Agent;
pub use agent_generator::{AgentGenerator, GenerationRequest};
pub use agent_pool::{AgentPool, AgentPoolConfig, PoolMetrics};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointService, RecoveryReport};
pub use consensus::{ConsensusEngine, ConsensusInput};
pub use job_manager::{CreateTaskOptions, JobManager, ProcessorContext, ProcessorFn};
pub use model_selector::{ModelSelector, ModelSelectorConfig, SelectionCriteria};
pub use resource_scope::{
    dispose_all, CensusSnapshot, Disposable, DisposeOptions, ResourceCensus, ResourceScope,
};
pub use retry_analyzer::RetryAnalyzer;
pub use retry_executor::RetryExecutor;
pub use spawner::{ParallelSpawner, SpawnOutcome, SpawnStatus};
pub use stream_hub::{Delivery, FramePayload, HubMetrics, SessionHandle, StreamHub};
pub use task_queue::{QueueMetrics, TaskQueue};
