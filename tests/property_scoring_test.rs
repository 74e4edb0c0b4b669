//! Property tests for scoring weights and backoff schedules.

use proptest::prelude::*;

use nexus::domain::models::{RetryConfig, ScoringWeights};
use nexus::domain::ports::AnalyticsStore;
use nexus::services::RetryAnalyzer;
use std::sync::Arc;

fn analyzer() -> RetryAnalyzer {
    // The analyzer only touches the store on pattern lookups, which these
    // properties never trigger.
    struct NullStore;

    #[async_trait::async_trait]
    impl AnalyticsStore for NullStore {
        async fn find_pattern(
            &self,
            _e: &str,
            _s: &str,
            _o: &str,
        ) -> nexus::CoreResult<Option<nexus::domain::models::ErrorPattern>> {
            Ok(None)
        }
        async fn upsert_pattern(
            &self,
            _p: &nexus::domain::models::ErrorPattern,
        ) -> nexus::CoreResult<()> {
            Ok(())
        }
        async fn record_outcome(&self, _id: uuid::Uuid, _s: bool) -> nexus::CoreResult<()> {
            Ok(())
        }
        async fn record_attempt(
            &self,
            _a: &nexus::domain::models::RetryAttempt,
        ) -> nexus::CoreResult<()> {
            Ok(())
        }
        async fn get_recommendation(
            &self,
            _e: &str,
            _s: &str,
            _o: &str,
        ) -> nexus::CoreResult<Option<nexus::domain::models::RetryStrategy>> {
            Ok(None)
        }
        async fn top_patterns(
            &self,
            _limit: usize,
        ) -> nexus::CoreResult<Vec<nexus::domain::ports::PatternEffectiveness>> {
            Ok(vec![])
        }
        async fn recent_patterns(
            &self,
            _limit: usize,
        ) -> nexus::CoreResult<Vec<nexus::domain::models::ErrorPattern>> {
            Ok(vec![])
        }
        async fn cleanup_old_attempts(&self, _days: u32) -> nexus::CoreResult<u64> {
            Ok(0)
        }
    }

    RetryAnalyzer::new(Arc::new(NullStore), 50)
}

proptest! {
    /// After normalization the weights sum to 1 within the tolerance and
    /// every component lands in [0, 1].
    #[test]
    fn weights_normalize_to_unit_sum(
        semantic in 0.0f64..100.0,
        shared in 0.0f64..100.0,
        priority in 0.0f64..100.0,
    ) {
        let weights = ScoringWeights {
            semantic_overlap: semantic,
            shared_claims: shared,
            agent_priority: priority,
        }
        .normalized();

        prop_assert!((weights.sum() - 1.0).abs() <= 0.01);
        for component in [
            weights.semantic_overlap,
            weights.shared_claims,
            weights.agent_priority,
        ] {
            prop_assert!((0.0..=1.0).contains(&component));
        }
    }

    /// Computed delays never exceed the cap and never undershoot the
    /// scheduled base for the attempt.
    #[test]
    fn backoff_delays_bounded(
        base in 1u64..5_000,
        cap in 1u64..60_000,
        attempt in 0u32..12,
    ) {
        let analyzer = analyzer();
        let config = RetryConfig {
            base_delay_ms: base,
            max_retry_delay_ms: cap,
            exponential_backoff: true,
            ..Default::default()
        };

        let delay = analyzer.compute_delay(attempt, &config).as_millis() as u64;
        prop_assert!(delay <= cap);
        let scheduled = base.saturating_mul(2u64.saturating_pow(attempt));
        prop_assert!(delay >= scheduled.min(cap));
    }

    /// The explicit per-attempt schedule wins over the exponential
    /// formula whenever it covers the attempt index.
    #[test]
    fn explicit_schedule_honored(
        first in 1u64..1_000,
        second in 1u64..1_000,
        attempt in 0u32..2,
    ) {
        let analyzer = analyzer();
        let config = RetryConfig {
            backoff_ms: vec![first, second],
            max_retry_delay_ms: 10_000,
            ..Default::default()
        };

        let delay = analyzer.compute_delay(attempt, &config).as_millis() as u64;
        let scheduled = [first, second][attempt as usize];
        // Jitter adds at most 200ms on top of the scheduled delay.
        prop_assert!(delay >= scheduled && delay <= scheduled + 200);
    }
}
