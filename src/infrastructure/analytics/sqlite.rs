//! SQLite implementation of the retry analytics store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    ErrorCategory, ErrorPattern, ErrorSeverity, RetryAttempt, RetryStrategy,
};
use crate::domain::ports::analytics_store::{AnalyticsStore, PatternEffectiveness};

/// Embedded schema, applied on connect.
const MIGRATION: &str = r"
CREATE TABLE IF NOT EXISTS error_patterns (
    id TEXT PRIMARY KEY,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL DEFAULT '',
    service_name TEXT NOT NULL,
    operation_name TEXT NOT NULL,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    retryable INTEGER NOT NULL,
    retry_success_count INTEGER NOT NULL DEFAULT 0,
    retry_failure_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 0,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    recommended_strategy TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(error_type, service_name, operation_name)
);

CREATE TABLE IF NOT EXISTS retry_attempts (
    id TEXT PRIMARY KEY,
    pattern_id TEXT NOT NULL REFERENCES error_patterns(id),
    task_id TEXT NOT NULL,
    agent_id TEXT,
    attempt_number INTEGER NOT NULL,
    success INTEGER NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    error_if_failed TEXT,
    strategy_applied TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_pattern ON retry_attempts(pattern_id);
CREATE INDEX IF NOT EXISTS idx_attempts_created ON retry_attempts(created_at);
";

/// SQLite-backed `AnalyticsStore`.
#[derive(Clone)]
pub struct SqliteAnalyticsStore {
    pool: SqlitePool,
}

impl SqliteAnalyticsStore {
    /// Open (creating if needed) the database at `path` and apply the
    /// schema.
    pub async fn open(path: &str) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|err| CoreError::Internal(format!("bad analytics path: {err}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> CoreResult<()> {
        self.pool.execute(MIGRATION).await?;
        Ok(())
    }
}

fn category_from_str(s: &str) -> ErrorCategory {
    match s {
        "network" => ErrorCategory::Network,
        "rate_limit" => ErrorCategory::RateLimit,
        "upstream" => ErrorCategory::Upstream,
        "validation" => ErrorCategory::Validation,
        "auth" => ErrorCategory::Auth,
        "resource" => ErrorCategory::Resource,
        _ => ErrorCategory::Unknown,
    }
}

fn severity_from_str(s: &str) -> ErrorSeverity {
    match s {
        "low" => ErrorSeverity::Low,
        "high" => ErrorSeverity::High,
        "critical" => ErrorSeverity::Critical,
        _ => ErrorSeverity::Medium,
    }
}

fn pattern_from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<ErrorPattern> {
    let parse_ts = |col: &str| -> CoreResult<DateTime<Utc>> {
        let raw: String = row.get(col);
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| CoreError::Internal(format!("bad timestamp in {col}: {err}")))
    };

    let id: String = row.get("id");
    let strategy_json: String = row.get("recommended_strategy");
    let category: String = row.get("category");
    let severity: String = row.get("severity");

    Ok(ErrorPattern {
        id: Uuid::parse_str(&id)
            .map_err(|err| CoreError::Internal(format!("bad pattern id: {err}")))?,
        error_type: row.get("error_type"),
        error_message: row.get("error_message"),
        service_name: row.get("service_name"),
        operation_name: row.get("operation_name"),
        category: category_from_str(&category),
        severity: severity_from_str(&severity),
        retryable: row.get::<i64, _>("retryable") != 0,
        retry_success_count: row.get::<i64, _>("retry_success_count").unsigned_abs(),
        retry_failure_count: row.get::<i64, _>("retry_failure_count").unsigned_abs(),
        success_rate: row.get("success_rate"),
        occurrence_count: row.get::<i64, _>("occurrence_count").unsigned_abs(),
        recommended_strategy: serde_json::from_str(&strategy_json).unwrap_or_default(),
        first_seen_at: parse_ts("first_seen_at")?,
        last_seen_at: parse_ts("last_seen_at")?,
        updated_at: parse_ts("updated_at")?,
    })
}

#[async_trait]
impl AnalyticsStore for SqliteAnalyticsStore {
    async fn find_pattern(
        &self,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> CoreResult<Option<ErrorPattern>> {
        let row = sqlx::query(
            "SELECT * FROM error_patterns
             WHERE error_type = ? AND service_name = ? AND operation_name = ?",
        )
        .bind(error_type)
        .bind(service)
        .bind(operation)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(pattern_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_pattern(&self, pattern: &ErrorPattern) -> CoreResult<()> {
        let strategy_json = serde_json::to_string(&pattern.recommended_strategy)?;
        sqlx::query(
            "INSERT INTO error_patterns (
                id, error_type, error_message, service_name, operation_name,
                category, severity, retryable, retry_success_count,
                retry_failure_count, success_rate, occurrence_count,
                recommended_strategy, first_seen_at, last_seen_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(error_type, service_name, operation_name) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                error_message = excluded.error_message,
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at",
        )
        .bind(pattern.id.to_string())
        .bind(&pattern.error_type)
        .bind(&pattern.error_message)
        .bind(&pattern.service_name)
        .bind(&pattern.operation_name)
        .bind(pattern.category.as_str())
        .bind(pattern.severity.as_str())
        .bind(i64::from(pattern.retryable))
        .bind(i64::try_from(pattern.retry_success_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(pattern.retry_failure_count).unwrap_or(i64::MAX))
        .bind(pattern.success_rate)
        .bind(i64::try_from(pattern.occurrence_count).unwrap_or(i64::MAX))
        .bind(&strategy_json)
        .bind(pattern.first_seen_at.to_rfc3339())
        .bind(pattern.last_seen_at.to_rfc3339())
        .bind(pattern.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outcome(&self, pattern_id: Uuid, success: bool) -> CoreResult<()> {
        let (success_inc, failure_inc) = if success { (1, 0) } else { (0, 1) };
        sqlx::query(
            "UPDATE error_patterns SET
                retry_success_count = retry_success_count + ?,
                retry_failure_count = retry_failure_count + ?,
                success_rate = CAST(retry_success_count + ? AS REAL)
                    / (retry_success_count + retry_failure_count + 1),
                last_seen_at = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(success_inc)
        .bind(failure_inc)
        .bind(success_inc)
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(pattern_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_attempt(&self, attempt: &RetryAttempt) -> CoreResult<()> {
        let strategy_json = serde_json::to_string(&attempt.strategy_applied)?;
        sqlx::query(
            "INSERT INTO retry_attempts (
                id, pattern_id, task_id, agent_id, attempt_number, success,
                execution_time_ms, error_if_failed, strategy_applied, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id.to_string())
        .bind(attempt.pattern_id.to_string())
        .bind(attempt.task_id.to_string())
        .bind(attempt.agent_id.map(|id| id.to_string()))
        .bind(i64::from(attempt.attempt_number))
        .bind(i64::from(attempt.success))
        .bind(i64::try_from(attempt.execution_time_ms).unwrap_or(i64::MAX))
        .bind(&attempt.error_if_failed)
        .bind(&strategy_json)
        .bind(attempt.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recommendation(
        &self,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> CoreResult<Option<RetryStrategy>> {
        Ok(self
            .find_pattern(error_type, service, operation)
            .await?
            .filter(|p| p.retryable)
            .map(|p| p.recommended_strategy))
    }

    async fn top_patterns(&self, limit: usize) -> CoreResult<Vec<PatternEffectiveness>> {
        let rows = sqlx::query(
            "SELECT error_type, service_name, operation_name, success_rate, occurrence_count
             FROM error_patterns
             ORDER BY occurrence_count DESC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PatternEffectiveness {
                error_type: row.get("error_type"),
                service_name: row.get("service_name"),
                operation_name: row.get("operation_name"),
                success_rate: row.get("success_rate"),
                occurrence_count: row.get::<i64, _>("occurrence_count").unsigned_abs(),
            })
            .collect())
    }

    async fn recent_patterns(&self, limit: usize) -> CoreResult<Vec<ErrorPattern>> {
        let rows = sqlx::query(
            "SELECT * FROM error_patterns
             ORDER BY last_seen_at DESC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pattern_from_row).collect()
    }

    async fn cleanup_old_attempts(&self, older_than_days: u32) -> CoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let result = sqlx::query("DELETE FROM retry_attempts WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteAnalyticsStore {
        SqliteAnalyticsStore::open_in_memory().await.unwrap()
    }

    fn pattern() -> ErrorPattern {
        ErrorPattern::new(
            "transient_upstream",
            "model_gateway",
            "complete",
            ErrorCategory::Upstream,
            true,
        )
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let store = store().await;
        let p = pattern();
        store.upsert_pattern(&p).await.unwrap();

        let found = store
            .find_pattern("transient_upstream", "model_gateway", "complete")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, p.id);
        assert_eq!(found.category, ErrorCategory::Upstream);
        assert!(found.retryable);
    }

    #[tokio::test]
    async fn test_upsert_conflict_bumps_occurrence() {
        let store = store().await;
        store.upsert_pattern(&pattern()).await.unwrap();
        store.upsert_pattern(&pattern()).await.unwrap();

        let found = store
            .find_pattern("transient_upstream", "model_gateway", "complete")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_record_outcome_updates_counters() {
        let store = store().await;
        let p = pattern();
        store.upsert_pattern(&p).await.unwrap();
        store.record_outcome(p.id, true).await.unwrap();
        store.record_outcome(p.id, true).await.unwrap();
        store.record_outcome(p.id, false).await.unwrap();

        let found = store
            .find_pattern("transient_upstream", "model_gateway", "complete")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.retry_success_count, 2);
        assert_eq!(found.retry_failure_count, 1);
        assert!(found.success_rate > 0.6 && found.success_rate < 0.7);
    }

    #[tokio::test]
    async fn test_attempts_and_cleanup() {
        let store = store().await;
        let p = pattern();
        store.upsert_pattern(&p).await.unwrap();

        let mut attempt = RetryAttempt {
            id: Uuid::new_v4(),
            pattern_id: p.id,
            task_id: Uuid::new_v4(),
            agent_id: None,
            attempt_number: 1,
            success: false,
            execution_time_ms: 120,
            error_if_failed: Some("503".into()),
            strategy_applied: RetryStrategy::default(),
            created_at: Utc::now() - Duration::days(100),
        };
        store.record_attempt(&attempt).await.unwrap();
        attempt.id = Uuid::new_v4();
        attempt.created_at = Utc::now();
        store.record_attempt(&attempt).await.unwrap();

        let removed = store.cleanup_old_attempts(90).await.unwrap();
        assert_eq!(removed, 1, "only the 100-day-old attempt is removed");
    }

    #[tokio::test]
    async fn test_recommendation_only_for_retryable() {
        let store = store().await;
        let mut p = pattern();
        p.retryable = false;
        store.upsert_pattern(&p).await.unwrap();

        let rec = store
            .get_recommendation("transient_upstream", "model_gateway", "complete")
            .await
            .unwrap();
        assert!(rec.is_none());
    }

    #[tokio::test]
    async fn test_recent_patterns_ordered_by_last_seen() {
        let store = store().await;
        let mut older = pattern();
        older.last_seen_at = Utc::now() - Duration::hours(2);
        store.upsert_pattern(&older).await.unwrap();

        let newer = ErrorPattern::new(
            "rate_limited",
            "model_gateway",
            "complete",
            ErrorCategory::RateLimit,
            true,
        );
        store.upsert_pattern(&newer).await.unwrap();

        let recent = store.recent_patterns(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].error_type, "rate_limited");
        assert_eq!(recent[1].error_type, "transient_upstream");

        let limited = store.recent_patterns(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_top_patterns_ranked() {
        let store = store().await;
        store.upsert_pattern(&pattern()).await.unwrap();
        store.upsert_pattern(&pattern()).await.unwrap();
        let other = ErrorPattern::new("rate_limited", "model_gateway", "complete", ErrorCategory::RateLimit, true);
        store.upsert_pattern(&other).await.unwrap();

        let top = store.top_patterns(10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].error_type, "transient_upstream");
        assert_eq!(top[0].occurrence_count, 2);
    }
}
