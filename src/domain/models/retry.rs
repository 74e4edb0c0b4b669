//! Retry intelligence model.
//!
//! Error patterns are learned across attempts and persisted in the
//! analytics store; each retry consults the matched pattern before choosing
//! a strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broad failure category, derived at classification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Upstream,
    Validation,
    Auth,
    Resource,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Upstream => "upstream",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }
}

/// Severity attached to a pattern for ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Strategy recommended by the pattern store for future attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Attempts beyond the first.
    pub max_retries: u32,
    /// Base delay for the exponential schedule.
    pub base_delay_ms: u64,
    /// Hard cap on any single delay.
    pub max_delay_ms: u64,
    /// Whether to double the delay per attempt.
    pub exponential: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential: true,
        }
    }
}

/// A learned failure pattern, persisted in `retry_intelligence.error_patterns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: Uuid,
    pub error_type: String,
    pub error_message: String,
    pub service_name: String,
    pub operation_name: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub retry_success_count: u64,
    pub retry_failure_count: u64,
    pub success_rate: f64,
    pub occurrence_count: u64,
    pub recommended_strategy: RetryStrategy,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ErrorPattern {
    pub fn new(
        error_type: impl Into<String>,
        service_name: impl Into<String>,
        operation_name: impl Into<String>,
        category: ErrorCategory,
        retryable: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            error_type: error_type.into(),
            error_message: String::new(),
            service_name: service_name.into(),
            operation_name: operation_name.into(),
            category,
            severity: ErrorSeverity::Medium,
            retryable,
            retry_success_count: 0,
            retry_failure_count: 0,
            success_rate: 0.0,
            occurrence_count: 1,
            recommended_strategy: RetryStrategy::default(),
            first_seen_at: now,
            last_seen_at: now,
            updated_at: now,
        }
    }

    /// Record one retry outcome and refresh the derived rate.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.retry_success_count += 1;
        } else {
            self.retry_failure_count += 1;
        }
        let total = self.retry_success_count + self.retry_failure_count;
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.success_rate = self.retry_success_count as f64 / total as f64;
            }
        }
        self.last_seen_at = Utc::now();
        self.updated_at = self.last_seen_at;
    }
}

/// Per-attempt-chain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Explicit per-attempt schedule; when shorter than the attempt index,
    /// the exponential formula takes over.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
    pub exponential_backoff: bool,
    /// Base for the exponential formula.
    pub base_delay_ms: u64,
    /// Cap on any computed delay.
    pub max_retry_delay_ms: u64,
    /// Per-attempt execution timeout.
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: Vec::new(),
            exponential_backoff: true,
            base_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            timeout_ms: 120_000,
        }
    }
}

/// Identity of one attempt chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    /// Operation name used for pattern lookup, e.g. `gateway.complete`.
    pub operation: String,
    /// Service name used for pattern lookup, e.g. `model_gateway`.
    pub service: String,
    pub config: RetryConfig,
}

impl RetryContext {
    pub fn new(task_id: Uuid, service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id: None,
            operation: operation.into(),
            service: service.into(),
            config: RetryConfig::default(),
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }
}

/// One recorded attempt, persisted in `retry_intelligence.retry_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub pattern_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub attempt_number: u32,
    pub success: bool,
    pub execution_time_ms: u64,
    pub error_if_failed: Option<String>,
    pub strategy_applied: RetryStrategy,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome_updates_rate() {
        let mut p = ErrorPattern::new("timeout", "gateway", "complete", ErrorCategory::Network, true);
        p.record_outcome(true);
        p.record_outcome(true);
        p.record_outcome(false);
        assert_eq!(p.retry_success_count, 2);
        assert_eq!(p.retry_failure_count, 1);
        assert!((p.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_config() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.exponential_backoff);
        assert!(cfg.backoff_ms.is_empty());
    }
}
