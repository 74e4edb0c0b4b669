//! Streaming domain model: rooms, frames, sessions, subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::TaskError;

/// A stream fan-out key to which sessions subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RoomKey {
    Task(Uuid),
    Agent(Uuid),
    Competition(Uuid),
    Global,
}

impl RoomKey {
    /// Wire form, e.g. `task:<id>` or `agent:<id>`.
    pub fn as_wire(&self) -> String {
        match self {
            Self::Task(id) => format!("task:{id}"),
            Self::Agent(id) => format!("agent:{id}"),
            Self::Competition(id) => format!("competition:{id}"),
            Self::Global => "global".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s == "global" {
            return Some(Self::Global);
        }
        let (kind, id) = s.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match kind {
            "task" => Some(Self::Task(id)),
            "agent" => Some(Self::Agent(id)),
            "competition" => Some(Self::Competition(id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Progress counters attached to streaming chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    pub chunks_received: u64,
    pub bytes_received: u64,
}

/// Every event the hub can fan out, tagged by its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Welcome {
        session_id: Uuid,
        reconnect_token: Uuid,
        capabilities: Vec<String>,
    },
    Subscribed {
        room: String,
    },
    Unsubscribed {
        room: String,
    },
    Pong,
    #[serde(rename = "task:start")]
    TaskStart { task_id: Uuid },
    #[serde(rename = "task:progress")]
    TaskProgress {
        task_id: Uuid,
        progress: u8,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted {
        task_id: Uuid,
        result: serde_json::Value,
    },
    #[serde(rename = "task:failed")]
    TaskFailed { task_id: Uuid, error: TaskError },
    #[serde(rename = "task:cancelled")]
    TaskCancelled { task_id: Uuid, reason: String },
    #[serde(rename = "agent:spawned")]
    AgentSpawned {
        task_id: Uuid,
        agent_id: Uuid,
        model_id: String,
        role: String,
    },
    #[serde(rename = "agent:progress")]
    AgentProgress {
        agent_id: Uuid,
        progress: StreamProgress,
    },
    #[serde(rename = "agent:complete")]
    AgentComplete {
        agent_id: Uuid,
        success: bool,
        latency_ms: u64,
    },
    #[serde(rename = "agent:streaming")]
    AgentStreaming {
        agent_id: Uuid,
        model_id: String,
        role: String,
        chunk: String,
        progress: StreamProgress,
    },
    #[serde(rename = "agent:streaming_complete")]
    AgentStreamingComplete {
        agent_id: Uuid,
        total_chunks: u64,
        total_bytes: u64,
        duration_ms: u64,
    },
    CompetitionStarted {
        competition_id: Uuid,
        agent_count: usize,
    },
    CompetitionCompleted {
        competition_id: Uuid,
        winner_agent_id: Option<Uuid>,
    },
    #[serde(rename = "retry:attempt")]
    RetryAttempt {
        task_id: Uuid,
        operation: String,
        attempt: u32,
    },
    #[serde(rename = "retry:analysis")]
    RetryAnalysis {
        task_id: Uuid,
        operation: String,
        error_type: String,
        retryable: bool,
    },
    #[serde(rename = "retry:backoff")]
    RetryBackoff {
        task_id: Uuid,
        operation: String,
        delay_ms: u64,
    },
    #[serde(rename = "retry:success")]
    RetrySuccess {
        task_id: Uuid,
        operation: String,
        total_attempts: u32,
    },
    #[serde(rename = "retry:exhausted")]
    RetryExhausted {
        task_id: Uuid,
        operation: String,
        total_attempts: u32,
        last_error: String,
    },
    Backpressure {
        session_id: Uuid,
        dropped: u64,
    },
}

impl StreamEvent {
    /// Wire name of the event, used for filtering.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Pong => "pong",
            Self::TaskStart { .. } => "task:start",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::AgentSpawned { .. } => "agent:spawned",
            Self::AgentProgress { .. } => "agent:progress",
            Self::AgentComplete { .. } => "agent:complete",
            Self::AgentStreaming { .. } => "agent:streaming",
            Self::AgentStreamingComplete { .. } => "agent:streaming_complete",
            Self::CompetitionStarted { .. } => "competition_started",
            Self::CompetitionCompleted { .. } => "competition_completed",
            Self::RetryAttempt { .. } => "retry:attempt",
            Self::RetryAnalysis { .. } => "retry:analysis",
            Self::RetryBackoff { .. } => "retry:backoff",
            Self::RetrySuccess { .. } => "retry:success",
            Self::RetryExhausted { .. } => "retry:exhausted",
            Self::Backpressure { .. } => "backpressure",
        }
    }
}

/// A frame as delivered to a session: the room it was sent to, a
/// hub-assigned sequence number, and the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub room: RoomKey,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: StreamEvent,
}

/// Subscription held by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub room: RoomKey,
    /// Event wire names to pass; empty means all.
    #[serde(default)]
    pub filters: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Subscription {
    pub fn new(room: RoomKey) -> Self {
        let now = Utc::now();
        Self {
            room,
            filters: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f == event.wire_name())
    }
}

/// Subscriber session bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub reconnect_token: Uuid,
    pub subscriptions: Vec<Subscription>,
    pub last_ping: DateTime<Utc>,
    pub connected: bool,
    /// When the session disconnected; it is destroyed 5 minutes later
    /// unless the reconnect token is redeemed.
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}
