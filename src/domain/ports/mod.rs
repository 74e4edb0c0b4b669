//! Ports: trait interfaces to external collaborators.

pub mod analytics_store;
pub mod job_store;
pub mod memory_store;
pub mod model_gateway;

pub use analytics_store::{AnalyticsStore, PatternEffectiveness};
pub use job_store::{EnqueueOptions, JobStore};
pub use memory_store::{
    ContextSynthesis, MemoryKind, MemoryRecord, MemoryStore, RecallQuery, SynthesisOptions,
};
pub use model_gateway::{
    ChatMessage, ChatRole, ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse,
    ModelGateway, ModelInfo, ModelPricing,
};
