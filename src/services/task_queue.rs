//! Bounded in-process task queue.
//!
//! Admission control for orchestrations: a concurrency cap (default 1),
//! a per-task hard timeout, a staleness horizon after which queued tasks
//! are evicted, and a memory watermark that rejects new admissions under
//! pressure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::QueueConfig;
use crate::services::cancel::CancelToken;

struct PendingEntry {
    enqueued_at: Instant,
    expire: CancelToken,
    payload_bytes: u64,
}

/// Queue occupancy metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueMetrics {
    pub waiting: usize,
    pub queued_bytes: u64,
    pub expired_total: u64,
    pub rejected_total: u64,
}

/// Bounded FIFO admission gate for orchestrations.
pub struct TaskQueue {
    config: QueueConfig,
    permits: Arc<Semaphore>,
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    queued_bytes: AtomicU64,
    expired_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            pending: Mutex::new(HashMap::new()),
            queued_bytes: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Admit a task and run it under the hard timeout once a slot frees.
    ///
    /// Admission fails with `ResourceExhausted` beyond the memory
    /// watermark; queued tasks evicted by the health loop fail with
    /// `QueueExpired`; the elapsed hard deadline fails with `HardTimeout`.
    pub async fn submit<T, F, Fut>(
        &self,
        task_id: Uuid,
        payload_bytes: u64,
        timeout: Duration,
        f: F,
    ) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        // Memory watermark admission check.
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued + payload_bytes > self.config.memory_watermark_bytes {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::ResourceExhausted {
                resource: "memory_pressure".to_string(),
                message: format!(
                    "queued payloads at {queued} bytes exceed watermark {}",
                    self.config.memory_watermark_bytes
                ),
            });
        }

        let expire = CancelToken::new();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                task_id,
                PendingEntry {
                    enqueued_at: Instant::now(),
                    expire: expire.clone(),
                    payload_bytes,
                },
            );
        }
        self.queued_bytes.fetch_add(payload_bytes, Ordering::AcqRel);

        let enqueued_at = Instant::now();
        let permit = tokio::select! {
            permit = self.permits.acquire() => permit,
            _reason = expire.cancelled() => {
                self.forget(task_id).await;
                #[allow(clippy::cast_possible_truncation)]
                return Err(CoreError::QueueExpired {
                    waited_ms: enqueued_at.elapsed().as_millis() as u64,
                });
            }
        };
        let _permit = permit.map_err(|_| CoreError::Internal("queue closed".into()))?;
        self.forget(task_id).await;

        debug!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "task dequeued");
        match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result,
            Err(_) => {
                #[allow(clippy::cast_possible_truncation)]
                let elapsed_ms = timeout.as_millis() as u64;
                Err(CoreError::HardTimeout { elapsed_ms })
            }
        }
    }

    /// Evict tasks that waited past the staleness horizon. Returns the
    /// number evicted. Called by the health loop and directly by tests.
    pub async fn evict_stale(&self) -> usize {
        let horizon = Duration::from_secs(self.config.stale_after_secs);
        let pending = self.pending.lock().await;
        let mut evicted = 0;
        for (task_id, entry) in pending.iter() {
            if entry.enqueued_at.elapsed() > horizon {
                warn!(task_id = %task_id, "evicting stale queued task");
                entry.expire.cancel("queue staleness horizon elapsed");
                evicted += 1;
            }
        }
        self.expired_total
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Spawn the periodic eviction health loop.
    pub fn start_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.health_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match queue.upgrade() {
                    Some(queue) => {
                        queue.evict_stale().await;
                    }
                    None => break,
                }
            }
        })
    }

    pub async fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            waiting: self.pending.lock().await.len(),
            queued_bytes: self.queued_bytes.load(Ordering::Acquire),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }

    async fn forget(&self, task_id: Uuid) {
        if let Some(entry) = self.pending.lock().await.remove(&task_id) {
            self.queued_bytes
                .fetch_sub(entry.payload_bytes, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            max_concurrent: 1,
            stale_after_secs: 300,
            memory_watermark_bytes: 1024,
            health_interval_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_submit_runs_task() {
        let queue = TaskQueue::new(config());
        let result = queue
            .submit(Uuid::new_v4(), 10, Duration::from_secs(5), || async {
                Ok::<_, CoreError>(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(queue.metrics().await.waiting, 0);
    }

    #[tokio::test]
    async fn test_memory_watermark_rejects() {
        let queue = TaskQueue::new(config());
        let err = queue
            .submit(Uuid::new_v4(), 2048, Duration::from_secs(5), || async {
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "resource_exhausted");
        assert_eq!(queue.metrics().await.rejected_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout() {
        let queue = TaskQueue::new(config());
        let err = queue
            .submit(Uuid::new_v4(), 10, Duration::from_millis(50), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "timeout");
    }

    #[tokio::test]
    async fn test_serialized_execution() {
        let queue = Arc::new(TaskQueue::new(config()));
        let running = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                queue
                    .submit(Uuid::new_v4(), 1, Duration::from_secs(5), || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CoreError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "max_concurrent=1 holds");
    }

    #[tokio::test]
    async fn test_stale_eviction_expires_waiting_task() {
        let queue = Arc::new(TaskQueue::new(QueueConfig {
            stale_after_secs: 0,
            ..config()
        }));

        // Occupy the single permit.
        let blocker = Arc::clone(&queue);
        let hold = tokio::spawn(async move {
            blocker
                .submit(Uuid::new_v4(), 1, Duration::from_secs(5), || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, CoreError>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second submission waits; evict it.
        let waiter = Arc::clone(&queue);
        let waiting = tokio::spawn(async move {
            waiter
                .submit(Uuid::new_v4(), 1, Duration::from_secs(5), || async {
                    Ok::<_, CoreError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.evict_stale().await;

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "queue_expired");
        hold.await.unwrap().unwrap();
        assert_eq!(queue.metrics().await.queued_bytes, 0);
    }
}
