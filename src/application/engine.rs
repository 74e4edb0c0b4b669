//! Engine assembly and public surface.
//!
//! Wires the component graph from configuration and the four external
//! collaborators, runs startup recovery, registers the `orchestrate`
//! processor, and owns the background loops until shutdown.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::config::Config;
use crate::domain::models::{SubmitResponse, TaskSubmission, TenantContext};
use crate::domain::ports::{AnalyticsStore, JobStore, MemoryStore, ModelGateway};
use crate::services::{
    AdaptiveTimeoutManager, AgentGenerator, AgentPool, AgentPoolConfig, CensusSnapshot,
    CheckpointService, ConsensusEngine, HubMetrics, JobManager, ModelSelector,
    ModelSelectorConfig, PoolMetrics, QueueMetrics, RecoveryReport, ResourceCensus, RetryAnalyzer,
    RetryExecutor, StreamHub, TaskQueue,
};

use super::orchestrator::{Orchestrator, TaskStatusReport};

/// One metrics snapshot across the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineMetrics {
    pub pool: PoolMetrics,
    pub queue: QueueMetrics,
    pub hub: HubMetrics,
    pub census: CensusSnapshot,
}

/// The assembled engine.
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    hub: Arc<StreamHub>,
    queue: Arc<TaskQueue>,
    pool: Arc<AgentPool>,
    adaptive: Arc<AdaptiveTimeoutManager>,
    selector: Arc<ModelSelector>,
    jobs: Arc<JobManager>,
    analytics: Arc<dyn AnalyticsStore>,
    gateway: Arc<dyn ModelGateway>,
    cleanup_days: u32,
    loops: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build the component graph. Nothing runs until `start`.
    pub fn new(
        config: Config,
        gateway: Arc<dyn ModelGateway>,
        memory: Arc<dyn MemoryStore>,
        job_store: Arc<dyn JobStore>,
        analytics: Arc<dyn AnalyticsStore>,
    ) -> Self {
        let hub = Arc::new(StreamHub::new(config.stream.clone()));
        let queue = Arc::new(TaskQueue::new(config.queue.clone()));
        let pool = Arc::new(AgentPool::new(AgentPoolConfig::default()));
        let adaptive = Arc::new(AdaptiveTimeoutManager::new(config.adaptive.clone()));
        let census = ResourceCensus::new();

        let selector = Arc::new(ModelSelector::new(
            Arc::clone(&gateway),
            ModelSelectorConfig {
                failed_model_avoid: ChronoDuration::seconds(
                    i64::try_from(config.selector.failed_model_avoid_secs).unwrap_or(300),
                ),
                catalog_ttl: ChronoDuration::seconds(
                    i64::try_from(config.gateway.catalog_ttl_secs).unwrap_or(3600),
                ),
                allow_free_models: config.gateway.allow_free_models,
            },
        ));
        let generator = Arc::new(AgentGenerator::new(
            Arc::clone(&gateway),
            Arc::clone(&memory),
            Arc::clone(&selector),
            config.orchestrator.analyzer_model.clone(),
        ));
        let consensus = Arc::new(ConsensusEngine::new(
            Arc::clone(&gateway),
            config.consensus.clone(),
        ));
        let checkpoints = Arc::new(CheckpointService::new(
            Arc::clone(&job_store),
            config.checkpoint.clone(),
        ));
        let analyzer = Arc::new(RetryAnalyzer::new(
            Arc::clone(&analytics),
            config.retry.pattern_cache_ttl_ms,
        ));
        let retry = Arc::new(RetryExecutor::new(
            analyzer,
            Arc::clone(&analytics),
            Arc::clone(&hub),
        ));
        let jobs = Arc::new(JobManager::new(Arc::clone(&job_store), Arc::clone(&hub)));

        let cleanup_days = config.analytics.cleanup_days;
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Arc::clone(&gateway),
            memory,
            job_store,
            Arc::clone(&hub),
            Arc::clone(&queue),
            Arc::clone(&pool),
            Arc::clone(&selector),
            generator,
            consensus,
            checkpoints,
            Arc::clone(&adaptive),
            retry,
            census,
        ));

        Self {
            orchestrator,
            hub,
            queue,
            pool,
            adaptive,
            selector,
            jobs,
            analytics,
            gateway,
            cleanup_days,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Run startup recovery, register processors, and start the
    /// background loops.
    pub async fn start(self: &Arc<Self>) -> RecoveryReport {
        // Replay any checkpoints a previous process left pending.
        let report = self.orchestrator.recover_pending_checkpoints().await;
        if report.recovered > 0 || report.skipped > 0 {
            info!(
                recovered = report.recovered,
                skipped = report.skipped,
                "checkpoint recovery complete"
            );
        }

        // The engine itself is the `orchestrate` processor; single-purpose
        // task types register through `register_processor`.
        let orchestrator = Arc::clone(&self.orchestrator);
        self.jobs
            .register_processor(
                "orchestrate",
                Arc::new(move |params, ctx| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move {
                        let submission: TaskSubmission = serde_json::from_value(params)?;
                        let response = orchestrator
                            .submit_task(submission, ctx.tenant.clone())
                            .await?;
                        Ok(serde_json::to_value(response)?)
                    })
                }),
            )
            .await;

        // Secondary memory projection: the durable artifact pointer is
        // acknowledged here; the projection itself belongs to the memory
        // system.
        self.jobs
            .register_processor(
                "memory_projection",
                Arc::new(|params, _ctx| {
                    Box::pin(async move {
                        tracing::debug!(?params, "memory projection acknowledged");
                        Ok(serde_json::json!({"projected": true}))
                    })
                }),
            )
            .await;

        // Analytics retention pass.
        if let Err(err) = self.analytics.cleanup_old_attempts(self.cleanup_days).await {
            tracing::warn!(error = %err, "analytics cleanup failed");
        }

        let mut loops = self.loops.lock().await;
        loops.push(self.hub.start_maintenance());
        loops.push(self.queue.start_health_loop());
        loops.push(self.adaptive.start_monitor_loop());
        loops.extend(self.jobs.start_workers(1));
        info!("engine started");
        report
    }

    /// Submit a task directly (the in-process fast path).
    pub async fn submit_task(
        &self,
        submission: TaskSubmission,
        tenant: TenantContext,
    ) -> CoreResult<SubmitResponse> {
        self.orchestrator.submit_task(submission, tenant).await
    }

    pub async fn get_task_status(&self, task_id: Uuid) -> CoreResult<TaskStatusReport> {
        self.orchestrator.get_task_status(task_id).await
    }

    pub async fn cancel(&self, task_id: Uuid) -> CoreResult<()> {
        self.orchestrator.cancel(task_id, "client request").await
    }

    /// Register a processor for a non-orchestrate task type.
    pub async fn register_processor(
        &self,
        job_type: &str,
        processor: crate::services::ProcessorFn,
    ) {
        self.jobs.register_processor(job_type, processor).await;
    }

    pub fn stream_hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn model_selector(&self) -> &Arc<ModelSelector> {
        &self.selector
    }

    pub fn gateway(&self) -> &Arc<dyn ModelGateway> {
        &self.gateway
    }

    pub async fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            pool: self.pool.get_metrics().await,
            queue: self.queue.metrics().await,
            hub: self.hub.metrics().await,
            census: self.orchestrator.census().snapshot().await,
        }
    }

    /// Graceful shutdown: stop intake, cancel live tasks, dispose agents,
    /// stop loops.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.jobs.shutdown();
        self.orchestrator.shutdown().await;
        for handle in self.loops.lock().await.drain(..) {
            handle.abort();
        }
    }
}
