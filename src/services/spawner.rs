//! Batched parallel instantiation.
//!
//! Requests are processed in batches; within a batch every spawn runs
//! concurrently, raced against a per-item timeout, with one optional retry
//! after a short pause. In-flight spawns share a cancel signal and can be
//! aborted en masse.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::SpawnerConfig;
use crate::services::cancel::CancelToken;

/// Outcome status for one spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStatus {
    Fulfilled,
    Rejected,
}

/// Per-request outcome.
#[derive(Debug)]
pub struct SpawnOutcome<T> {
    /// Index of the request in the submitted batch.
    pub id: usize,
    pub status: SpawnStatus,
    pub value: Option<T>,
    pub reason: Option<CoreError>,
    pub duration_ms: u64,
}

impl<T> SpawnOutcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        self.status == SpawnStatus::Fulfilled
    }
}

/// Batched parallel spawner.
pub struct ParallelSpawner {
    config: SpawnerConfig,
    cancel: CancelToken,
}

impl ParallelSpawner {
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Abort every in-flight spawn.
    pub fn cancel_all(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Spawn every request, preserving request order in the outcomes.
    ///
    /// `spawn_fn` is invoked once per attempt; a failed attempt is retried
    /// once after a 1 s pause when `retry_on_failure` is set.
    pub async fn spawn_parallel<T, F, Fut>(
        &self,
        requests: Vec<F>,
    ) -> Vec<SpawnOutcome<T>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = CoreResult<T>> + Send,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let batch_size = self.config.batch_size.max(1);
        let mut outcomes = Vec::with_capacity(requests.len());

        for (batch_index, batch) in requests.chunks(batch_size).enumerate() {
            debug!(batch = batch_index, size = batch.len(), "spawning batch");
            let futures: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(offset, spawn_fn)| {
                    let id = batch_index * batch_size + offset;
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit = semaphore.acquire().await;
                        self.spawn_one(id, spawn_fn).await
                    }
                })
                .collect();
            outcomes.extend(futures::future::join_all(futures).await);
        }
        outcomes
    }

    async fn spawn_one<T, F, Fut>(&self, id: usize, spawn_fn: &F) -> SpawnOutcome<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = CoreResult<T>> + Send,
    {
        let start = Instant::now();
        let mut attempt_result = self.attempt(spawn_fn).await;

        if attempt_result.is_err() && self.config.retry_on_failure && !self.cancel.is_cancelled() {
            warn!(request = id, "spawn failed, retrying once");
            tokio::time::sleep(Duration::from_secs(1)).await;
            attempt_result = self.attempt(spawn_fn).await;
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        match attempt_result {
            Ok(value) => SpawnOutcome {
                id,
                status: SpawnStatus::Fulfilled,
                value: Some(value),
                reason: None,
                duration_ms,
            },
            Err(err) => SpawnOutcome {
                id,
                status: SpawnStatus::Rejected,
                value: None,
                reason: Some(err),
                duration_ms,
            },
        }
    }

    async fn attempt<T, F, Fut>(&self, spawn_fn: &F) -> CoreResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = CoreResult<T>> + Send,
    {
        if let Some(reason) = self.cancel.reason() {
            return Err(CoreError::Cancelled(reason));
        }
        let deadline = Duration::from_millis(self.config.timeout_ms);
        tokio::select! {
            reason = self.cancel.cancelled() => Err(CoreError::Cancelled(reason)),
            result = tokio::time::timeout(deadline, spawn_fn()) => match result {
                Ok(result) => result,
                Err(_) => Err(CoreError::TransientUpstream {
                    message: format!("spawn timed out after {}ms", self.config.timeout_ms),
                    status: None,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(retry: bool) -> SpawnerConfig {
        SpawnerConfig {
            max_concurrency: 4,
            batch_size: 2,
            timeout_ms: 200,
            retry_on_failure: retry,
        }
    }

    #[tokio::test]
    async fn test_all_fulfilled_in_order() {
        let spawner = ParallelSpawner::new(config(false));
        let requests: Vec<_> = (0..5)
            .map(|i| move || async move { Ok::<_, CoreError>(i * 10) })
            .collect();
        let outcomes = spawner.spawn_parallel(requests).await;
        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.id, i);
            assert!(outcome.is_fulfilled());
            assert_eq!(outcome.value, Some(i * 10));
        }
    }

    #[tokio::test]
    async fn test_rejection_carries_reason_and_duration() {
        let spawner = ParallelSpawner::new(config(false));
        let requests = vec![|| async {
            Err::<u32, _>(CoreError::Validation("bad profile".into()))
        }];
        let outcomes = spawner.spawn_parallel(requests).await;
        assert_eq!(outcomes[0].status, SpawnStatus::Rejected);
        assert!(outcomes[0].reason.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects() {
        let spawner = ParallelSpawner::new(config(false));
        let requests = vec![|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<u32, CoreError>(1)
        }];
        let outcomes = spawner.spawn_parallel(requests).await;
        assert_eq!(outcomes[0].status, SpawnStatus::Rejected);
        assert_eq!(
            outcomes[0].reason.as_ref().map(CoreError::error_code),
            Some("transient_upstream")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_retry_on_failure() {
        let spawner = ParallelSpawner::new(config(true));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let requests = vec![move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CoreError::TransientUpstream {
                        message: "first attempt".into(),
                        status: Some(503),
                    })
                } else {
                    Ok(42u32)
                }
            }
        }];
        let outcomes = spawner.spawn_parallel(requests).await;
        assert!(outcomes[0].is_fulfilled());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_pending() {
        let spawner = ParallelSpawner::new(config(false));
        spawner.cancel_all("shutdown");
        let requests = vec![|| async { Ok::<u32, CoreError>(1) }];
        let outcomes = spawner.spawn_parallel(requests).await;
        assert_eq!(outcomes[0].status, SpawnStatus::Rejected);
        assert_eq!(
            outcomes[0].reason.as_ref().map(CoreError::error_code),
            Some("cancelled")
        );
    }
}
