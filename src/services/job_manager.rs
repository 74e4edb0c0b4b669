//! Durable FIFO job intake.
//!
//! Registers typed processors over the job store, relays progress and
//! terminal events to the stream hub, and answers status queries. Delivery
//! is at-least-once; the job id doubles as the processor's idempotency key.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult, ErrorContext};
use crate::domain::models::{JobRecord, JobStatusView, StreamEvent, TenantContext};
use crate::domain::ports::{EnqueueOptions, JobStore};
use crate::services::cancel::CancelToken;
use crate::services::stream_hub::StreamHub;

/// Context handed to a processor alongside its params.
#[derive(Clone)]
pub struct ProcessorContext {
    pub job_id: Uuid,
    pub tenant: TenantContext,
    store: Arc<dyn JobStore>,
    hub: Arc<StreamHub>,
}

impl ProcessorContext {
    /// Report delivery progress; relayed to the task room.
    pub async fn progress(&self, pct: u8, phase: &str) {
        if let Err(err) = self.store.progress(self.job_id, pct).await {
            warn!(job_id = %self.job_id, error = %err, "progress write failed");
        }
        self.hub
            .stream_to_task(
                self.job_id,
                StreamEvent::TaskProgress {
                    task_id: self.job_id,
                    progress: pct,
                    phase: phase.to_string(),
                    detail: None,
                },
            )
            .await;
    }
}

/// A registered processor: `(params, ctx) -> result`.
pub type ProcessorFn = Arc<
    dyn Fn(serde_json::Value, ProcessorContext) -> BoxFuture<'static, CoreResult<serde_json::Value>>
        + Send
        + Sync,
>;

/// Options for task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub timeout_ms: Option<u64>,
    pub priority: i32,
}

/// FIFO adapter between the durable store and the registered processors.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    hub: Arc<StreamHub>,
    processors: RwLock<HashMap<String, ProcessorFn>>,
    shutdown: CancelToken,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<StreamHub>) -> Self {
        Self {
            store,
            hub,
            processors: RwLock::new(HashMap::new()),
            shutdown: CancelToken::new(),
        }
    }

    /// Register a processor for a task type. Re-registration replaces the
    /// previous processor.
    pub async fn register_processor(&self, job_type: &str, processor: ProcessorFn) {
        info!(job_type, "processor registered");
        self.processors
            .write()
            .await
            .insert(job_type.to_string(), processor);
    }

    pub async fn registered_types(&self) -> Vec<String> {
        self.processors.read().await.keys().cloned().collect()
    }

    /// Enqueue a durable task; returns its id.
    pub async fn create_task(
        &self,
        job_type: &str,
        params: serde_json::Value,
        opts: CreateTaskOptions,
        tenant: &TenantContext,
    ) -> CoreResult<Uuid> {
        if !self.processors.read().await.contains_key(job_type) {
            return Err(CoreError::Validation(format!(
                "no processor registered for task type {job_type}"
            )));
        }
        self.store
            .enqueue(
                job_type,
                params,
                EnqueueOptions {
                    timeout_ms: opts.timeout_ms,
                    priority: opts.priority,
                },
                tenant,
            )
            .await
    }

    /// Status view for one task.
    pub async fn get_task_status(&self, task_id: Uuid) -> CoreResult<Option<JobStatusView>> {
        Ok(self
            .store
            .get(task_id)
            .await?
            .as_ref()
            .map(JobStatusView::from))
    }

    /// Stop the worker loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel("job manager shutdown");
    }

    /// Spawn `count` worker loops draining the store.
    pub fn start_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count.max(1))
            .map(|i| {
                let manager = Arc::clone(self);
                let worker = format!("worker-{i}");
                tokio::spawn(async move { manager.worker_loop(&worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: &str) {
        debug!(worker, "worker loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.store.reserve(worker).await {
                Ok(Some(job)) => self.dispatch(job).await,
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _reason = self.shutdown.cancelled() => break,
                    }
                }
                Err(err) => {
                    warn!(worker, error = %err, "reserve failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        debug!(worker, "worker loop stopped");
    }

    /// Run one delivery through its processor, then ack or fail.
    pub async fn dispatch(&self, job: JobRecord) {
        let processor = self.processors.read().await.get(&job.job_type).cloned();
        let Some(processor) = processor else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no processor for delivery");
            let err = CoreError::Validation(format!("no processor for {}", job.job_type));
            let record = err.with_context(ErrorContext {
                task_id: Some(job.id),
                correlation_id: Some(job.tenant.correlation_id.clone()),
                ..Default::default()
            });
            let _ = self.store.fail(job.id, &record).await;
            return;
        };

        let ctx = ProcessorContext {
            job_id: job.id,
            tenant: job.tenant.clone(),
            store: Arc::clone(&self.store),
            hub: Arc::clone(&self.hub),
        };

        let started = std::time::Instant::now();
        let outcome = match job.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    processor(job.params.clone(), ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::HardTimeout {
                        elapsed_ms: timeout_ms,
                    }),
                }
            }
            None => processor(job.params.clone(), ctx).await,
        };

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                if let Err(err) = self.store.ack(job.id, result.clone()).await {
                    warn!(job_id = %job.id, error = %err, "ack failed");
                }
                self.hub
                    .stream_to_task(
                        job.id,
                        StreamEvent::TaskCompleted {
                            task_id: job.id,
                            result,
                        },
                    )
                    .await;
            }
            Err(err) => {
                let record = err.with_context(ErrorContext {
                    task_id: Some(job.id),
                    duration_ms: Some(duration_ms),
                    correlation_id: Some(job.tenant.correlation_id.clone()),
                    ..Default::default()
                });
                if let Err(store_err) = self.store.fail(job.id, &record).await {
                    warn!(job_id = %job.id, error = %store_err, "fail write failed");
                }
                self.hub
                    .stream_to_task(
                        job.id,
                        StreamEvent::TaskFailed {
                            task_id: job.id,
                            error: record,
                        },
                    )
                    .await;
            }
        }
    }
}
