//! Failure classification against the learned pattern store.
//!
//! Classification is message-shape and status aware; pattern lookups go
//! through a short-TTL in-process cache so the analytics database never
//! sits on the hot path, and learned outcomes are written back
//! asynchronously.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::CoreError;
use crate::domain::models::{
    ErrorCategory, ErrorPattern, ErrorSeverity, RetryConfig, RetryStrategy,
};
use crate::domain::ports::AnalyticsStore;

/// Message shapes that are never retried regardless of error kind.
const NON_RETRYABLE_SHAPES: &[&str] =
    &["invalid", "unauthorized", "forbidden", "not found", "bad request"];

/// Classification of one failure.
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub error_type: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
}

/// Decision produced for one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub classification: ErrorClassification,
    pub pattern: Option<ErrorPattern>,
    pub retryable: bool,
    pub strategy: RetryStrategy,
}

/// Classify an error by kind, status, and message shape.
pub fn classify(err: &CoreError) -> ErrorClassification {
    let message = err.to_string().to_lowercase();
    let shape_blocked = NON_RETRYABLE_SHAPES.iter().any(|s| message.contains(s));

    let (category, severity) = match err {
        CoreError::RateLimit { .. } => (ErrorCategory::RateLimit, ErrorSeverity::Low),
        CoreError::TransientUpstream { .. } | CoreError::GatewayUnavailable { .. } => {
            (ErrorCategory::Upstream, ErrorSeverity::Medium)
        }
        CoreError::Validation(_) => (ErrorCategory::Validation, ErrorSeverity::Low),
        CoreError::Auth(_) => (ErrorCategory::Auth, ErrorSeverity::High),
        CoreError::NotFound(_) => (ErrorCategory::Validation, ErrorSeverity::Low),
        CoreError::ResourceExhausted { .. } | CoreError::QueueExpired { .. } => {
            (ErrorCategory::Resource, ErrorSeverity::High)
        }
        CoreError::HardTimeout { .. } | CoreError::Hung { .. } => {
            (ErrorCategory::Network, ErrorSeverity::Medium)
        }
        CoreError::Cancelled(_) => (ErrorCategory::Unknown, ErrorSeverity::Low),
        CoreError::Durability(_) | CoreError::Internal(_) => {
            (ErrorCategory::Unknown, ErrorSeverity::Critical)
        }
    };

    ErrorClassification {
        error_type: err.error_code().to_string(),
        category,
        severity,
        retryable: err.is_retryable() && !shape_blocked,
    }
}

struct CacheEntry {
    pattern: Option<ErrorPattern>,
    fetched_at: Instant,
}

/// Pattern lookup, strategy proposal, and outcome recording.
pub struct RetryAnalyzer {
    store: Arc<dyn AnalyticsStore>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(String, String, String), CacheEntry>>,
}

impl RetryAnalyzer {
    pub fn new(store: Arc<dyn AnalyticsStore>, cache_ttl_ms: u64) -> Self {
        Self {
            store,
            cache_ttl: Duration::from_millis(cache_ttl_ms),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Analyze one failure: classify, consult the pattern store, and
    /// propose a strategy. Unknown failures register a new pattern
    /// asynchronously.
    pub async fn analyze(
        &self,
        err: &CoreError,
        service: &str,
        operation: &str,
    ) -> RetryDecision {
        let classification = classify(err);
        let pattern = self
            .lookup_pattern(&classification.error_type, service, operation)
            .await;

        let retryable = match &pattern {
            Some(p) => classification.retryable && p.retryable,
            None => classification.retryable,
        };
        let strategy = pattern
            .as_ref()
            .map(|p| p.recommended_strategy.clone())
            .unwrap_or_default();

        if pattern.is_none() {
            self.register_pattern(&classification, err, service, operation);
        }

        debug!(
            error_type = %classification.error_type,
            service,
            operation,
            retryable,
            "retry analysis"
        );
        RetryDecision {
            classification,
            pattern,
            retryable,
            strategy,
        }
    }

    /// Compute the delay before the next attempt: the explicit schedule
    /// when provided, otherwise exponential with jitter, capped.
    pub fn compute_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        let base = if let Some(explicit) = config.backoff_ms.get(attempt as usize) {
            *explicit
        } else if config.exponential_backoff {
            config
                .base_delay_ms
                .saturating_mul(2_u64.saturating_pow(attempt))
        } else {
            config.base_delay_ms
        };
        let jitter = rand::thread_rng().gen_range(0..200);
        Duration::from_millis(base.saturating_add(jitter).min(config.max_retry_delay_ms))
    }

    /// Record a retry outcome. The write-back is fire-and-forget so the
    /// attempt chain never blocks on the analytics database.
    pub fn record_outcome(&self, pattern_id: Uuid, success: bool) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.record_outcome(pattern_id, success).await {
                warn!(pattern_id = %pattern_id, error = %err, "retry outcome write-back failed");
            }
        });
    }

    async fn lookup_pattern(
        &self,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> Option<ErrorPattern> {
        let key = (
            error_type.to_string(),
            service.to_string(),
            operation.to_string(),
        );

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() <= self.cache_ttl {
                    return entry.pattern.clone();
                }
            }
        }

        let pattern = match self.store.find_pattern(error_type, service, operation).await {
            Ok(pattern) => pattern,
            Err(err) => {
                warn!(error = %err, "pattern lookup failed, using defaults");
                None
            }
        };

        self.cache.lock().await.insert(
            key,
            CacheEntry {
                pattern: pattern.clone(),
                fetched_at: Instant::now(),
            },
        );
        pattern
    }

    fn register_pattern(
        &self,
        classification: &ErrorClassification,
        err: &CoreError,
        service: &str,
        operation: &str,
    ) {
        let mut pattern = ErrorPattern::new(
            &classification.error_type,
            service,
            operation,
            classification.category,
            classification.retryable,
        );
        pattern.error_message = err.to_string();
        pattern.severity = classification.severity;

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.upsert_pattern(&pattern).await {
                warn!(error = %err, "pattern registration failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::CoreResult;
    use crate::domain::models::RetryAttempt;
    use crate::domain::ports::analytics_store::PatternEffectiveness;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct StubStore {
        pattern: Option<ErrorPattern>,
        lookups: AtomicU32,
    }

    #[async_trait]
    impl AnalyticsStore for StubStore {
        async fn find_pattern(
            &self,
            _error_type: &str,
            _service: &str,
            _operation: &str,
        ) -> CoreResult<Option<ErrorPattern>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.pattern.clone())
        }
        async fn upsert_pattern(&self, _pattern: &ErrorPattern) -> CoreResult<()> {
            Ok(())
        }
        async fn record_outcome(&self, _pattern_id: Uuid, _success: bool) -> CoreResult<()> {
            Ok(())
        }
        async fn record_attempt(&self, _attempt: &RetryAttempt) -> CoreResult<()> {
            Ok(())
        }
        async fn get_recommendation(
            &self,
            _error_type: &str,
            _service: &str,
            _operation: &str,
        ) -> CoreResult<Option<RetryStrategy>> {
            Ok(None)
        }
        async fn top_patterns(&self, _limit: usize) -> CoreResult<Vec<PatternEffectiveness>> {
            Ok(vec![])
        }
        async fn recent_patterns(&self, _limit: usize) -> CoreResult<Vec<ErrorPattern>> {
            Ok(vec![])
        }
        async fn cleanup_old_attempts(&self, _older_than_days: u32) -> CoreResult<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_classify_non_retryable_shapes() {
        // Transient kind but a blocked message shape.
        let err = CoreError::TransientUpstream {
            message: "upstream said: bad request".into(),
            status: Some(500),
        };
        assert!(!classify(&err).retryable);

        let err = CoreError::TransientUpstream {
            message: "connection reset".into(),
            status: Some(502),
        };
        assert!(classify(&err).retryable);
    }

    #[test]
    fn test_classify_categories() {
        let rate = CoreError::RateLimit {
            message: "slow down".into(),
            retry_after_ms: Some(500),
        };
        assert_eq!(classify(&rate).category, ErrorCategory::RateLimit);
        assert!(classify(&rate).retryable);

        let auth = CoreError::Auth("unauthorized key".into());
        assert_eq!(classify(&auth).category, ErrorCategory::Auth);
        assert!(!classify(&auth).retryable);
    }

    #[tokio::test]
    async fn test_pattern_retryable_false_wins() {
        let mut pattern =
            ErrorPattern::new("transient_upstream", "gw", "complete", ErrorCategory::Upstream, false);
        pattern.retryable = false;
        let store = Arc::new(StubStore {
            pattern: Some(pattern),
            ..Default::default()
        });
        let analyzer = RetryAnalyzer::new(store, 50);

        let err = CoreError::TransientUpstream {
            message: "flaky".into(),
            status: Some(503),
        };
        let decision = analyzer.analyze(&err, "gw", "complete").await;
        assert!(!decision.retryable, "stored pattern overrides classification");
    }

    #[tokio::test]
    async fn test_cache_bounds_lookups() {
        let store = Arc::new(StubStore::default());
        let analyzer = RetryAnalyzer::new(Arc::clone(&store) as Arc<dyn AnalyticsStore>, 10_000);
        let err = CoreError::TransientUpstream {
            message: "flaky".into(),
            status: Some(503),
        };
        for _ in 0..5 {
            analyzer.analyze(&err, "gw", "complete").await;
        }
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compute_delay_exponential_with_cap() {
        let store = Arc::new(StubStore::default());
        let analyzer = RetryAnalyzer::new(store, 50);
        let config = RetryConfig {
            base_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            ..Default::default()
        };

        let d0 = analyzer.compute_delay(0, &config).as_millis();
        assert!((1_000..1_200).contains(&d0), "base plus jitter: {d0}");
        let d2 = analyzer.compute_delay(2, &config).as_millis();
        assert!((4_000..4_200).contains(&d2), "doubled twice: {d2}");
        let d10 = analyzer.compute_delay(10, &config).as_millis();
        assert_eq!(d10, 5_000, "capped at max_retry_delay");
    }

    #[test]
    fn test_compute_delay_explicit_schedule() {
        let store = Arc::new(StubStore::default());
        let analyzer = RetryAnalyzer::new(store, 50);
        let config = RetryConfig {
            backoff_ms: vec![100, 700],
            max_retry_delay_ms: 10_000,
            ..Default::default()
        };
        let d0 = analyzer.compute_delay(0, &config).as_millis();
        assert!((100..300).contains(&d0));
        let d1 = analyzer.compute_delay(1, &config).as_millis();
        assert!((700..900).contains(&d1));
    }
}
