//! Model gateway port.
//!
//! The gateway is a chat-completions HTTP service hosting many foundation
//! models from many providers. The core only depends on this interface.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreResult;

/// Per-token pricing as advertised by the gateway catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub prompt: f64,
    #[serde(default)]
    pub completion: f64,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Gateway id, `provider/model-name` with an optional `:free` suffix.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub context_length: u64,
    #[serde(default)]
    pub pricing: ModelPricing,
    /// Capability tags (e.g. `vision`, `tools`, `long_context`).
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub moderated: bool,
}

impl ModelInfo {
    /// Provider prefix of the model id.
    pub fn provider(&self) -> &str {
        self.id.split('/').next().unwrap_or(&self.id)
    }

    /// Free models are zero-priced or carry the `:free` suffix.
    pub fn is_free(&self) -> bool {
        self.id.ends_with(":free")
            || (self.pricing.prompt <= f64::EPSILON && self.pricing.completion <= f64::EPSILON)
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Per-request deadline; the client enforces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            temperature: None,
            max_tokens: None,
            timeout_ms: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A non-streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub model_id: String,
    pub content: String,
    pub tokens_used: u64,
}

/// One streamed delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: String,
    /// Set on the final chunk, carrying the total token usage when the
    /// gateway reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Streamed completion chunks.
pub type ChunkStream = BoxStream<'static, CoreResult<CompletionChunk>>;

/// Port interface for the LLM gateway.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Fetch the model catalog.
    async fn list_models(&self) -> CoreResult<Vec<ModelInfo>>;

    /// Run one completion to the end.
    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse>;

    /// Run one completion as a chunk stream.
    async fn complete_stream(&self, request: CompletionRequest) -> CoreResult<ChunkStream>;

    /// Whether the gateway is reachable with valid credentials.
    async fn health_check(&self) -> CoreResult<bool>;
}
