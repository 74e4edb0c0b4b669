//! Intelligent retry execution.
//!
//! Runs an operation under a per-attempt timeout, classifies each failure
//! against the pattern store, backs off with jitter, and records outcomes.
//! For any attempt chain the emitted events match
//! `(retry:attempt retry:analysis retry:backoff)* (retry:success|retry:exhausted)`,
//! in order.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{RetryAttempt, RetryContext, StreamEvent};
use crate::domain::ports::AnalyticsStore;
use crate::services::cancel::CancelToken;
use crate::services::retry_analyzer::RetryAnalyzer;
use crate::services::stream_hub::StreamHub;

/// Executes operations with pattern-informed retries.
pub struct RetryExecutor {
    analyzer: Arc<RetryAnalyzer>,
    store: Arc<dyn AnalyticsStore>,
    hub: Arc<StreamHub>,
}

impl RetryExecutor {
    pub fn new(
        analyzer: Arc<RetryAnalyzer>,
        store: Arc<dyn AnalyticsStore>,
        hub: Arc<StreamHub>,
    ) -> Self {
        Self {
            analyzer,
            store,
            hub,
        }
    }

    /// Run `operation` with intelligent retry. `operation` is invoked once
    /// per attempt; each attempt runs under `ctx.config.timeout_ms`.
    /// Cancellation between attempts aborts the chain without a retry.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        cancel: &CancelToken,
        operation: F,
    ) -> CoreResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let timeout = Duration::from_millis(ctx.config.timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            if let Some(reason) = cancel.reason() {
                return Err(CoreError::Cancelled(reason));
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, operation(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::TransientUpstream {
                    message: format!("attempt timed out after {}ms", ctx.config.timeout_ms),
                    status: Some(408),
                }),
            };
            #[allow(clippy::cast_possible_truncation)]
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        self.on_late_success(ctx, attempt, elapsed_ms).await;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let decision = self
                        .analyzer
                        .analyze(&err, &ctx.service, &ctx.operation)
                        .await;

                    let exhausted = attempt >= ctx.config.max_retries;
                    if !decision.retryable || exhausted {
                        if let Some(pattern) = &decision.pattern {
                            self.analyzer.record_outcome(pattern.id, false);
                        }
                        self.record_attempt(ctx, &decision.pattern.as_ref().map(|p| p.id), attempt, false, elapsed_ms, Some(err.to_string()));
                        self.hub
                            .stream_to_task(
                                ctx.task_id,
                                StreamEvent::RetryExhausted {
                                    task_id: ctx.task_id,
                                    operation: ctx.operation.clone(),
                                    total_attempts: attempt + 1,
                                    last_error: err.to_string(),
                                },
                            )
                            .await;
                        warn!(
                            task_id = %ctx.task_id,
                            operation = %ctx.operation,
                            attempts = attempt + 1,
                            error = %err,
                            "retry chain exhausted"
                        );
                        return Err(err);
                    }

                    // Ordered: attempt -> analysis -> backoff.
                    self.hub
                        .stream_to_task(
                            ctx.task_id,
                            StreamEvent::RetryAttempt {
                                task_id: ctx.task_id,
                                operation: ctx.operation.clone(),
                                attempt: attempt + 1,
                            },
                        )
                        .await;
                    self.hub
                        .stream_to_task(
                            ctx.task_id,
                            StreamEvent::RetryAnalysis {
                                task_id: ctx.task_id,
                                operation: ctx.operation.clone(),
                                error_type: decision.classification.error_type.clone(),
                                retryable: true,
                            },
                        )
                        .await;

                    let delay = self.delay_for(&err, attempt, ctx);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    self.hub
                        .stream_to_task(
                            ctx.task_id,
                            StreamEvent::RetryBackoff {
                                task_id: ctx.task_id,
                                operation: ctx.operation.clone(),
                                delay_ms,
                            },
                        )
                        .await;

                    self.record_attempt(ctx, &decision.pattern.as_ref().map(|p| p.id), attempt, false, elapsed_ms, Some(err.to_string()));
                    debug!(
                        task_id = %ctx.task_id,
                        operation = %ctx.operation,
                        attempt = attempt + 1,
                        delay_ms,
                        "backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Rate-limit errors honor the server-provided delay; everything else
    /// follows the configured schedule.
    fn delay_for(&self, err: &CoreError, attempt: u32, ctx: &RetryContext) -> Duration {
        if let CoreError::RateLimit {
            retry_after_ms: Some(after),
            ..
        } = err
        {
            return Duration::from_millis((*after).min(ctx.config.max_retry_delay_ms));
        }
        self.analyzer.compute_delay(attempt, &ctx.config)
    }

    async fn on_late_success(&self, ctx: &RetryContext, attempt: u32, elapsed_ms: u64) {
        let decision_pattern = {
            // The chain succeeded after retries; credit the pattern that
            // drove them, when one exists.
            let lookup = self
                .store
                .find_pattern("transient_upstream", &ctx.service, &ctx.operation)
                .await;
            lookup.ok().flatten()
        };
        if let Some(pattern) = &decision_pattern {
            self.analyzer.record_outcome(pattern.id, true);
        }
        self.record_attempt(
            ctx,
            &decision_pattern.as_ref().map(|p| p.id),
            attempt,
            true,
            elapsed_ms,
            None,
        );
        self.hub
            .stream_to_task(
                ctx.task_id,
                StreamEvent::RetrySuccess {
                    task_id: ctx.task_id,
                    operation: ctx.operation.clone(),
                    total_attempts: attempt + 1,
                },
            )
            .await;
    }

    /// Fire-and-forget attempt record.
    fn record_attempt(
        &self,
        ctx: &RetryContext,
        pattern_id: &Option<Uuid>,
        attempt: u32,
        success: bool,
        execution_time_ms: u64,
        error: Option<String>,
    ) {
        let Some(pattern_id) = pattern_id else {
            return;
        };
        let record = RetryAttempt {
            id: Uuid::new_v4(),
            pattern_id: *pattern_id,
            task_id: ctx.task_id,
            agent_id: ctx.agent_id,
            attempt_number: attempt + 1,
            success,
            execution_time_ms,
            error_if_failed: error,
            strategy_applied: Default::default(),
            created_at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.record_attempt(&record).await {
                warn!(error = %err, "attempt record write-back failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StreamConfig;
    use crate::domain::models::{ErrorPattern, RetryConfig, RetryStrategy, RoomKey};
    use crate::domain::ports::analytics_store::PatternEffectiveness;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct StubStore;

    #[async_trait]
    impl AnalyticsStore for StubStore {
        async fn find_pattern(
            &self,
            _error_type: &str,
            _service: &str,
            _operation: &str,
        ) -> CoreResult<Option<ErrorPattern>> {
            Ok(None)
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

    fn executor() -> (RetryExecutor, Arc<StreamHub>) {
        let store: Arc<dyn AnalyticsStore> = Arc::new(StubStore);
        let hub = Arc::new(StreamHub::new(StreamConfig::default()));
        (
            RetryExecutor::new(
                Arc::new(RetryAnalyzer::new(Arc::clone(&store), 50)),
                store,
                Arc::clone(&hub),
            ),
            hub,
        )
    }

    fn fast_ctx(task_id: Uuid) -> RetryContext {
        RetryContext::new(task_id, "gateway", "complete").with_config(RetryConfig {
            max_retries: 2,
            base_delay_ms: 5,
            max_retry_delay_ms: 10,
            timeout_ms: 1_000,
            ..Default::default()
        })
    }

    async fn subscribe_task(hub: &Arc<StreamHub>, task_id: Uuid) -> crate::services::stream_hub::SessionHandle {
        let mut handle = hub.create_session().await;
        let _ = handle.rx.recv().await; // welcome
        hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
            .await
            .unwrap();
        let _ = handle.rx.recv().await; // subscribed
        handle
    }

    fn drain_event_names(handle: &mut crate::services::stream_hub::SessionHandle) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(delivery) = handle.rx.try_recv() {
            names.push(delivery.frame.event.wire_name().to_string());
        }
        names
    }

    #[tokio::test]
    async fn test_first_attempt_success_emits_nothing() {
        let (executor, hub) = executor();
        let task_id = Uuid::new_v4();
        let mut handle = subscribe_task(&hub, task_id).await;

        let result = executor
            .execute(&fast_ctx(task_id), &CancelToken::new(), |_| async {
                Ok::<_, CoreError>(1)
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert!(drain_event_names(&mut handle).is_empty());
    }

    #[tokio::test]
    async fn test_event_order_on_retried_success() {
        let (executor, hub) = executor();
        let task_id = Uuid::new_v4();
        let mut handle = subscribe_task(&hub, task_id).await;

        let calls = AtomicU32::new(0);
        let result = executor
            .execute(&fast_ctx(task_id), &CancelToken::new(), |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(CoreError::TransientUpstream {
                            message: "flaky".into(),
                            status: Some(503),
                        })
                    } else {
                        Ok(9)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 9);

        let names = drain_event_names(&mut handle);
        assert_eq!(
            names,
            vec!["retry:attempt", "retry:analysis", "retry:backoff", "retry:success"]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_rethrows_last_error() {
        let (executor, hub) = executor();
        let task_id = Uuid::new_v4();
        let mut handle = subscribe_task(&hub, task_id).await;

        let err = executor
            .execute(&fast_ctx(task_id), &CancelToken::new(), |attempt| async move {
                Err::<(), _>(CoreError::TransientUpstream {
                    message: format!("failure {attempt}"),
                    status: Some(503),
                })
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failure 2"), "last error rethrown");

        let names = drain_event_names(&mut handle);
        assert_eq!(
            names,
            vec![
                "retry:attempt",
                "retry:analysis",
                "retry:backoff",
                "retry:attempt",
                "retry:analysis",
                "retry:backoff",
                "retry:exhausted",
            ]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let (executor, hub) = executor();
        let task_id = Uuid::new_v4();
        let mut handle = subscribe_task(&hub, task_id).await;

        let calls = AtomicU32::new(0);
        let err = executor
            .execute(&fast_ctx(task_id), &CancelToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::Auth("unauthorized".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "auth_error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain_event_names(&mut handle), vec!["retry:exhausted"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_chain() {
        let (executor, _hub) = executor();
        let task_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        cancel.cancel("shutdown");

        let err = executor
            .execute(&fast_ctx(task_id), &cancel, |_| async {
                Ok::<_, CoreError>(1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_is_retryable() {
        let (executor, _hub) = executor();
        let task_id = Uuid::new_v4();
        let ctx = RetryContext::new(task_id, "gateway", "complete").with_config(RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_retry_delay_ms: 2,
            timeout_ms: 50,
            ..Default::default()
        });

        let calls = AtomicU32::new(0);
        let result = executor
            .execute(&ctx, &CancelToken::new(), |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, CoreError>(5)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
