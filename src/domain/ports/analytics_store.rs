//! Analytics store port.
//!
//! Relational backing for the retry intelligence: learned error patterns
//! and per-attempt records, with ranking and cleanup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreResult;
use crate::domain::models::{ErrorPattern, RetryAttempt, RetryStrategy};

/// Aggregate effectiveness row, backing the effectiveness view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEffectiveness {
    pub error_type: String,
    pub service_name: String,
    pub operation_name: String,
    pub success_rate: f64,
    pub occurrence_count: u64,
}

/// Port interface for the retry analytics database.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Look up the pattern for (error type, service, operation).
    async fn find_pattern(
        &self,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> CoreResult<Option<ErrorPattern>>;

    /// Insert a pattern or bump its occurrence count.
    async fn upsert_pattern(&self, pattern: &ErrorPattern) -> CoreResult<()>;

    /// Record a retry outcome against a pattern, refreshing its counters.
    async fn record_outcome(&self, pattern_id: uuid::Uuid, success: bool) -> CoreResult<()>;

    /// Persist one attempt record.
    async fn record_attempt(&self, attempt: &RetryAttempt) -> CoreResult<()>;

    /// Recommended strategy for (error type, service, operation), if any.
    async fn get_recommendation(
        &self,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> CoreResult<Option<RetryStrategy>>;

    /// Patterns ranked by occurrence (the effectiveness view).
    async fn top_patterns(&self, limit: usize) -> CoreResult<Vec<PatternEffectiveness>>;

    /// Patterns ordered by most recent sighting (the recency view).
    async fn recent_patterns(&self, limit: usize) -> CoreResult<Vec<ErrorPattern>>;

    /// Delete attempts older than the retention window. Returns rows removed.
    async fn cleanup_old_attempts(&self, older_than_days: u32) -> CoreResult<u64>;
}
