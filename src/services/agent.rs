//! Single-model agent execution.
//!
//! An agent owns one model binding and produces one output per task,
//! streaming chunks to its room as they arrive. Disposal clears the cached
//! task and shared-context references; a disposed agent is never reused.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentProfile, AgentRole, AgentSnapshot, AgentState, ExecutionResult, ReasoningDepth,
    StreamEvent, StreamProgress, TenantContext,
};
use crate::domain::ports::{ChatMessage, CompletionRequest, ModelGateway};
use crate::services::cancel::CancelToken;
use crate::services::resource_scope::{Disposable, DisposeOptions};
use crate::services::stream_hub::StreamHub;

/// Callback invoked per received chunk with (byte delta, chunk delta).
/// The adaptive timeout monitor is the usual sink.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A single-model worker bound to a generated profile.
pub struct Agent {
    id: Uuid,
    task_id: Uuid,
    profile: AgentProfile,
    gateway: Arc<dyn ModelGateway>,
    hub: Arc<StreamHub>,
    state: RwLock<AgentState>,
    /// Retrieval context shared across the cohort; cleared on dispose.
    shared_context: RwLock<Option<String>>,
    spawned_at: DateTime<Utc>,
    last_active: RwLock<DateTime<Utc>>,
}

impl Agent {
    pub fn new(
        task_id: Uuid,
        profile: AgentProfile,
        gateway: Arc<dyn ModelGateway>,
        hub: Arc<StreamHub>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            profile,
            gateway,
            hub,
            state: RwLock::new(AgentState::Idle),
            shared_context: RwLock::new(None),
            spawned_at: now,
            last_active: RwLock::new(now),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn model_id(&self) -> &str {
        &self.profile.model_id
    }

    pub fn role(&self) -> AgentRole {
        self.profile.role
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn state(&self) -> AgentState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: AgentState) {
        *self.state.write().expect("state lock poisoned") = state;
        *self.last_active.write().expect("state lock poisoned") = Utc::now();
    }

    pub fn set_shared_context(&self, context: Option<String>) {
        *self.shared_context.write().expect("state lock poisoned") = context;
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            model_id: self.profile.model_id.clone(),
            role: self.profile.role,
            state: self.state(),
            task_id: self.task_id,
            spawned_at: self.spawned_at,
            last_active_at: *self.last_active.read().expect("state lock poisoned"),
        }
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        *self.last_active.read().expect("state lock poisoned")
    }

    /// Execute the objective against this agent's model, streaming chunks
    /// as they arrive. Returns the collected result; cancellation aborts
    /// the in-flight request.
    pub async fn execute(
        &self,
        tenant: &TenantContext,
        objective: &str,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> CoreResult<ExecutionResult> {
        if self.state() == AgentState::Disposed {
            return Err(CoreError::Internal(format!(
                "agent {} used after dispose",
                self.id
            )));
        }
        self.set_state(AgentState::Running);
        let start = Instant::now();

        let result = self
            .execute_inner(objective, cancel, progress.as_ref(), start)
            .await;

        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok((output, tokens_used)) => {
                self.set_state(AgentState::Succeeded);
                debug!(
                    agent_id = %self.id,
                    tenant = %tenant,
                    model = %self.profile.model_id,
                    latency_ms,
                    "agent execution complete"
                );
                Ok(ExecutionResult {
                    agent_id: self.id,
                    model_id: self.profile.model_id.clone(),
                    role: self.profile.role,
                    output,
                    tokens_used,
                    latency_ms,
                    success: true,
                    error: None,
                })
            }
            Err(err) => {
                self.set_state(AgentState::Failed);
                Err(err)
            }
        }
    }

    async fn execute_inner(
        &self,
        objective: &str,
        cancel: &CancelToken,
        progress: Option<&ProgressFn>,
        start: Instant,
    ) -> CoreResult<(String, u64)> {
        let request = self.build_request(objective);
        let mut stream = self.gateway.complete_stream(request).await?;

        let mut output = String::new();
        let mut counters = StreamProgress::default();
        let mut tokens_used: Option<u64> = None;

        loop {
            if let Some(reason) = cancel.reason() {
                return Err(CoreError::Cancelled(reason));
            }
            let chunk = tokio::select! {
                biased;
                reason = cancel.cancelled() => {
                    return Err(CoreError::Cancelled(reason));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            counters.chunks_received += 1;
            counters.bytes_received += chunk.delta.len() as u64;
            output.push_str(&chunk.delta);
            if let Some(t) = chunk.tokens_used {
                tokens_used = Some(t);
            }
            if let Some(progress) = progress {
                progress(chunk.delta.len() as u64, 1);
            }
            *self.last_active.write().expect("state lock poisoned") = Utc::now();

            self.hub
                .stream_to_agent(
                    self.id,
                    StreamEvent::AgentStreaming {
                        agent_id: self.id,
                        model_id: self.profile.model_id.clone(),
                        role: self.profile.role.as_str().to_string(),
                        chunk: chunk.delta,
                        progress: counters,
                    },
                )
                .await;
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        self.hub
            .stream_to_agent(
                self.id,
                StreamEvent::AgentStreamingComplete {
                    agent_id: self.id,
                    total_chunks: counters.chunks_received,
                    total_bytes: counters.bytes_received,
                    duration_ms,
                },
            )
            .await;

        // Fall back to a length heuristic when the gateway omits usage.
        let tokens = tokens_used.unwrap_or_else(|| (output.len() as u64).div_ceil(4));
        Ok((output, tokens))
    }

    fn build_request(&self, objective: &str) -> CompletionRequest {
        let mut user_content = objective.to_string();
        if let Some(context) = self.shared_context.read().expect("state lock poisoned").as_ref() {
            user_content = format!("{user_content}\n\nRelevant context:\n{context}");
        }

        let messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(user_content),
        ];

        CompletionRequest::new(&self.profile.model_id, messages)
            .with_temperature(self.temperature())
            .with_max_tokens(self.max_tokens())
    }

    fn system_prompt(&self) -> String {
        let role_frame = match self.profile.role {
            AgentRole::Research => {
                "You are a research agent. Gather, verify, and organize the facts needed to address the objective."
            }
            AgentRole::Coding => {
                "You are a coding agent. Produce working, idiomatic code that addresses the objective."
            }
            AgentRole::Review => {
                "You are a review agent. Critically examine the objective and surface errors, risks, and omissions."
            }
            AgentRole::Synthesis => {
                "You are a synthesis agent. Combine the available material into one coherent, complete answer."
            }
            AgentRole::Specialist => {
                "You are a specialist agent. Apply deep domain expertise to the objective."
            }
        };

        let mut prompt = format!(
            "{role_frame}\nSpecialization: {}.",
            self.profile.specialization
        );
        if !self.profile.focus.is_empty() {
            prompt.push_str(&format!("\nFocus: {}.", self.profile.focus));
        }
        match self.profile.reasoning_depth {
            ReasoningDepth::Shallow => prompt.push_str("\nAnswer directly and concisely."),
            ReasoningDepth::Medium => {}
            ReasoningDepth::Deep => {
                prompt.push_str("\nReason step by step before giving the final answer.");
            }
            ReasoningDepth::Extreme => prompt.push_str(
                "\nReason exhaustively: enumerate alternatives, check each, then give the final answer.",
            ),
        }
        prompt
    }

    fn temperature(&self) -> f64 {
        match self.profile.role {
            AgentRole::Review | AgentRole::Synthesis => 0.2,
            AgentRole::Research | AgentRole::Specialist => 0.5,
            AgentRole::Coding => 0.3,
        }
    }

    fn max_tokens(&self) -> u32 {
        match self.profile.reasoning_depth {
            ReasoningDepth::Shallow => 1024,
            ReasoningDepth::Medium => 2048,
            ReasoningDepth::Deep => 4096,
            ReasoningDepth::Extreme => 8192,
        }
    }
}

#[async_trait::async_trait]
impl Disposable for Agent {
    /// Clear cached references and mark the agent disposed. Idempotent at
    /// the scope layer; the state write here is unconditional.
    async fn dispose(&self, _opts: &DisposeOptions) -> CoreResult<()> {
        self.set_shared_context(None);
        self.set_state(AgentState::Disposed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StreamConfig;
    use crate::domain::ports::model_gateway::{
        ChunkStream, CompletionChunk, CompletionResponse, ModelInfo,
    };
    use async_trait::async_trait;
    use futures::stream;

    struct ScriptedGateway {
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
            Ok(vec![])
        }

        async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
            Ok(CompletionResponse {
                model_id: request.model_id,
                content: self.chunks.concat(),
                tokens_used: 7,
            })
        }

        async fn complete_stream(&self, _request: CompletionRequest) -> CoreResult<ChunkStream> {
            let chunks: Vec<CoreResult<CompletionChunk>> = self
                .chunks
                .iter()
                .map(|c| {
                    Ok(CompletionChunk {
                        delta: (*c).to_string(),
                        tokens_used: None,
                    })
                })
                .collect();
            Ok(stream::iter(chunks).boxed())
        }

        async fn health_check(&self) -> CoreResult<bool> {
            Ok(true)
        }
    }

    fn agent_with(chunks: Vec<&'static str>) -> Agent {
        let profile = AgentProfile::new(AgentRole::Research, "testing")
            .with_model("anthropic/claude-sonnet-4.5");
        Agent::new(
            Uuid::new_v4(),
            profile,
            Arc::new(ScriptedGateway { chunks }),
            Arc::new(StreamHub::new(StreamConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_execute_collects_chunks() {
        let agent = agent_with(vec!["The answer ", "is 4."]);
        let tenant = TenantContext::new("acme", "ops");
        let result = agent
            .execute(&tenant, "What is 2+2?", &CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(result.output, "The answer is 4.");
        assert!(result.success);
        assert_eq!(result.role, AgentRole::Research);
        assert_eq!(agent.state(), AgentState::Succeeded);
    }

    #[tokio::test]
    async fn test_progress_callback_invoked() {
        let agent = agent_with(vec!["aaaa", "bb"]);
        let tenant = TenantContext::new("acme", "ops");
        let seen = Arc::new(std::sync::Mutex::new((0u64, 0u64)));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |bytes, chunks| {
            let mut s = sink.lock().unwrap();
            s.0 += bytes;
            s.1 += chunks;
        });
        agent
            .execute(&tenant, "objective", &CancelToken::new(), Some(progress))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), (6, 2));
    }

    #[tokio::test]
    async fn test_cancelled_before_stream_drains() {
        let agent = agent_with(vec!["never"]);
        let tenant = TenantContext::new("acme", "ops");
        let cancel = CancelToken::new();
        cancel.cancel("client request");
        let err = agent
            .execute(&tenant, "objective", &cancel, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "cancelled");
        assert_eq!(agent.state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_dispose_clears_state() {
        let agent = agent_with(vec![]);
        agent.set_shared_context(Some("ctx".to_string()));
        agent.dispose(&DisposeOptions::default()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);

        // No reuse after dispose.
        let tenant = TenantContext::new("acme", "ops");
        assert!(agent
            .execute(&tenant, "objective", &CancelToken::new(), None)
            .await
            .is_err());
    }
}
