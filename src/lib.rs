//! Nexus - multi-agent LLM orchestration engine
//!
//! Given a user task, the engine designs a cohort of specialized agents
//! (each bound to a distinct foundation model), executes them concurrently
//! against an LLM gateway, fuses their outputs through layered consensus,
//! and persists the result behind a write-ahead checkpoint - streaming
//! progress to subscribers and recovering cleanly from crashes.

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the public surface for convenience.
pub use application::{Engine, EngineMetrics, Orchestrator, TaskStatusReport};
pub use domain::errors::{CoreError, CoreResult, TaskError};
pub use domain::models::{SubmitOptions, SubmitResponse, TaskSubmission, TenantContext};
