//! Core error taxonomy.
//!
//! Kinds, not transport types: every error leaving the engine maps to one of
//! these variants and carries a stable `error_code` that clients can match on.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-visible input problem. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 401/403-equivalent. Never retried.
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// 404-equivalent. Never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// 429-equivalent. Retried with backoff honoring `retry_after_ms`.
    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// 5xx/408/timeout-equivalent upstream failure. Retried per pattern.
    #[error("Transient upstream error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    TransientUpstream {
        message: String,
        status: Option<u16>,
    },

    /// Circuit-open on a model provider. The selector marks the model failed
    /// and the orchestrator substitutes another.
    #[error("Gateway unavailable for model {model_id}: {message}")]
    GatewayUnavailable { model_id: String, message: String },

    /// Memory or queue pressure; admission rejected.
    #[error("Resource exhausted ({resource}): {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Task waited in the queue past the staleness horizon.
    #[error("Queued task expired after {waited_ms}ms")]
    QueueExpired { waited_ms: u64 },

    /// Hard queue-level abort deadline elapsed.
    #[error("Hard timeout after {elapsed_ms}ms")]
    HardTimeout { elapsed_ms: u64 },

    /// Operator or client initiated cancellation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The adaptive progress monitor declared the execution hung.
    #[error("Execution hung: no progress for {stalled_for_ms}ms")]
    Hung { stalled_for_ms: u64 },

    /// Document-store write failure. The task fails loudly.
    #[error("Durability failure: {0}")]
    Durability(String),

    /// Bug or unexpected state, surfaced with the correlation id.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, part of the public error surface.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "auth_error",
            Self::NotFound(_) => "not_found",
            Self::RateLimit { .. } => "rate_limited",
            Self::TransientUpstream { .. } => "transient_upstream",
            Self::GatewayUnavailable { .. } => "gateway_unavailable",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::QueueExpired { .. } => "queue_expired",
            Self::HardTimeout { .. } => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Hung { .. } => "adaptive_hung",
            Self::Durability(_) => "durability_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the retry subsystem may attempt this error again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::TransientUpstream { .. }
                | Self::GatewayUnavailable { .. }
        )
    }

    /// Map an upstream HTTP status into the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::Validation(message),
            401 | 403 => Self::Auth(message),
            404 => Self::NotFound(message),
            429 => Self::RateLimit {
                message,
                retry_after_ms: None,
            },
            408 | 500 | 502 | 503 | 504 | 529 => Self::TransientUpstream {
                message,
                status: Some(status),
            },
            _ => Self::Internal(format!("unexpected status {status}: {message}")),
        }
    }

    /// Attach task-level context, producing the serializable error record
    /// exposed by status queries and streamed failure events.
    pub fn with_context(&self, ctx: ErrorContext) -> TaskError {
        TaskError {
            code: self.error_code().to_string(),
            message: self.to_string(),
            task_id: ctx.task_id,
            agent_id: ctx.agent_id,
            model_id: ctx.model_id,
            duration_ms: ctx.duration_ms,
            correlation_id: ctx.correlation_id,
        }
    }
}

/// Context carried on every error that leaves the core.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub task_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub model_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub correlation_id: Option<String>,
}

/// Serializable error record: `{errorCode, correlationId, taskId?, agentId?,
/// modelId?, durationMs}` plus the human-readable message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization error: {err}"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal(format!("analytics store error: {err}"))
    }
}
