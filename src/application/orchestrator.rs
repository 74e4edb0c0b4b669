//! Task orchestration state machine.
//!
//! Drives one task through classification, planning, spawning, execution,
//! consensus, and checkpointed persistence, streaming progress at every
//! transition. The tenant is captured in a local value at entry and
//! carried explicitly; a shared cancel token reaches every concurrent
//! branch.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult, ErrorContext, TaskError};
use crate::domain::models::config::Config;
use crate::domain::models::{
    AgentProfile, Checkpoint, Complexity, ConsensusResult, ExecutionResult, GenerationPlan,
    GenerationStrategy, RetryConfig, RetryContext, StreamEvent, SubmitMetadata, SubmitResponse,
    Task, TaskPhase, TaskStatus, TaskSubmission, TenantContext,
};
use crate::domain::ports::{
    ChatMessage, CompletionRequest, EnqueueOptions, JobStore, MemoryStore, ModelGateway,
    SynthesisOptions,
};
use crate::services::agent::{Agent, ProgressFn};
use crate::services::{
    AdaptiveTimeoutManager, AgentGenerator, AgentPool, CancelToken, CheckpointService,
    ConsensusEngine, ConsensusInput, GenerationRequest, ModelSelector, ParallelSpawner,
    ProgressSignal, ResourceCensus, ResourceScope, RetryExecutor, SelectionCriteria, StreamHub,
    TaskQueue,
};
use crate::services::resource_scope::DisposeOptions;
use crate::services::spawner::SpawnStatus;

/// Cancel reason prefix used when the adaptive monitor declares a hang.
const HUNG_MARKER: &str = "adaptive_hung";

/// Status view returned by `get_task_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatusReport {
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

struct TaskEntry {
    task: Task,
    cancel: CancelToken,
    progress: u8,
    /// Scopes of every agent spawned for the task; disposed on every exit
    /// path, including hard timeout.
    scopes: Vec<Arc<ResourceScope<Agent>>>,
}

struct PipelineOutcome {
    result: serde_json::Value,
    agents: Vec<Uuid>,
    strategy: GenerationStrategy,
    consensus: Option<ConsensusResult>,
}

/// The engine's task state machine.
pub struct Orchestrator {
    config: Config,
    gateway: Arc<dyn ModelGateway>,
    memory: Arc<dyn MemoryStore>,
    job_store: Arc<dyn JobStore>,
    hub: Arc<StreamHub>,
    queue: Arc<TaskQueue>,
    pool: Arc<AgentPool>,
    selector: Arc<ModelSelector>,
    generator: Arc<AgentGenerator>,
    consensus: Arc<ConsensusEngine>,
    checkpoints: Arc<CheckpointService>,
    adaptive: Arc<AdaptiveTimeoutManager>,
    retry: Arc<RetryExecutor>,
    census: ResourceCensus,
    tasks: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        config: Config,
        gateway: Arc<dyn ModelGateway>,
        memory: Arc<dyn MemoryStore>,
        job_store: Arc<dyn JobStore>,
        hub: Arc<StreamHub>,
        queue: Arc<TaskQueue>,
        pool: Arc<AgentPool>,
        selector: Arc<ModelSelector>,
        generator: Arc<AgentGenerator>,
        consensus: Arc<ConsensusEngine>,
        checkpoints: Arc<CheckpointService>,
        adaptive: Arc<AdaptiveTimeoutManager>,
        retry: Arc<RetryExecutor>,
        census: ResourceCensus,
    ) -> Self {
        Self {
            config,
            gateway,
            memory,
            job_store,
            hub,
            queue,
            pool,
            selector,
            generator,
            consensus,
            checkpoints,
            adaptive,
            retry,
            census,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn census(&self) -> &ResourceCensus {
        &self.census
    }

    /// Submit one task and drive it to a terminal state.
    #[instrument(skip(self, submission, tenant), fields(tenant = %tenant))]
    pub async fn submit_task(
        &self,
        submission: TaskSubmission,
        tenant: TenantContext,
    ) -> CoreResult<SubmitResponse> {
        // The tenant stays in this local binding for the whole run; it is
        // never read from shared state across awaits.
        tenant.validate().map_err(CoreError::Validation)?;

        let objective = submission.objective.trim().to_string();
        if objective.is_empty() {
            return Err(CoreError::Validation("objective cannot be empty".into()));
        }

        let options = submission.options;
        let task_id = options.task_id.unwrap_or_else(Uuid::new_v4);
        let thread_id = options.thread_id.unwrap_or_else(Uuid::new_v4);
        let complexity = options.complexity.unwrap_or_default();

        let mut task = Task::new(objective.clone(), tenant.clone())
            .with_complexity(complexity)
            .with_thread(thread_id);
        task.id = task_id;
        if let Some(kind) = options.kind {
            task.kind = kind;
        }
        task.constraints = options.constraints.clone();
        task.context = submission.context;

        let cancel = CancelToken::new();
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&task_id) {
                return Err(CoreError::Validation(format!(
                    "task {task_id} already submitted"
                )));
            }
            tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    cancel: cancel.clone(),
                    progress: 0,
                    scopes: Vec::new(),
                },
            );
        }
        info!(task_id = %task_id, complexity = complexity.as_str(), "task received");

        // Short-circuit trivial messages: one gateway call, no agents, no
        // memory path. The threshold is a tunable.
        if objective.chars().count() < self.config.orchestrator.bypass_max_chars {
            return self.bypass(task_id, thread_id, &objective, &tenant).await;
        }

        // Hard abort deadline: the largest of the client deadline, the
        // adaptive estimate, and the per-complexity default.
        let estimate = self
            .adaptive
            .estimated_completion_time(&self.config.orchestrator.analyzer_model, complexity)
            .await;
        let default = Duration::from_millis(complexity.default_estimate_ms());
        let client = options.timeout_ms.map(Duration::from_millis);
        let timeout = [Some(estimate), Some(default), client]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(default);

        self.mark_running(task_id).await;
        self.hub
            .stream_to_task(task_id, StreamEvent::TaskStart { task_id })
            .await;

        let payload_bytes = objective.len() as u64;
        let run = self
            .queue
            .submit(task_id, payload_bytes, timeout, || {
                self.run_pipeline(task_id, thread_id, &objective, complexity, &tenant, &cancel)
            })
            .await;

        // Guaranteed cleanup on every exit path, including the hard
        // timeout dropping the pipeline future mid-await.
        cancel.cancel("orchestration finished");
        self.dispose_task_agents(task_id).await;
        self.adaptive.forget(task_id).await;

        self.finalize(task_id, thread_id, &tenant, run).await
    }

    /// Status of a task. Terminal entries stay queryable for the
    /// retention window, then disappear.
    pub async fn get_task_status(&self, task_id: Uuid) -> CoreResult<TaskStatusReport> {
        let tasks = self.tasks.lock().await;
        let entry = tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        Ok(TaskStatusReport {
            status: entry.task.status,
            progress: entry.progress,
            result: entry.task.result.clone(),
            error: entry.task.error.clone(),
            created_at: entry.task.created_at,
            started_at: entry.task.started_at,
            completed_at: entry.task.completed_at,
        })
    }

    /// Cancel a task. Idempotent; a terminal state is immutable.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> CoreResult<()> {
        let tasks = self.tasks.lock().await;
        let entry = tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        if entry.task.is_terminal() {
            return Ok(());
        }
        entry.cancel.cancel(reason.to_string());
        Ok(())
    }

    /// Replay pending checkpoints from a previous process. For each one
    /// the document write is re-run idempotently, then committed.
    pub async fn recover_pending_checkpoints(&self) -> crate::services::RecoveryReport {
        let memory = Arc::clone(&self.memory);
        self.checkpoints
            .recover_pending_checkpoints(move |checkpoint| {
                let memory = Arc::clone(&memory);
                async move { replay_persistence(&memory, &checkpoint).await }
            })
            .await
    }

    /// Cancel every live task and dispose every live agent.
    pub async fn shutdown(&self) {
        let task_ids: Vec<Uuid> = self.tasks.lock().await.keys().copied().collect();
        for task_id in task_ids {
            let _ = self.cancel(task_id, "engine shutdown").await;
            self.dispose_task_agents(task_id).await;
        }
        self.pool.destroy().await;
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn run_pipeline(
        &self,
        task_id: Uuid,
        thread_id: Uuid,
        objective: &str,
        complexity: Complexity,
        tenant: &TenantContext,
        cancel: &CancelToken,
    ) -> CoreResult<PipelineOutcome> {
        self.check_cancel(cancel)?;

        // Thread continuation and message store are best-effort.
        if let Err(err) = self
            .memory
            .append_thread_message(tenant, thread_id, "user", objective)
            .await
        {
            warn!(task_id = %task_id, error = %err, "thread append failed");
        }

        // Retrieval context with caps: paged retrieval for extreme
        // complexity, size-limited otherwise.
        let budget = self.config.orchestrator.context_token_budget;
        let synthesis_opts = if complexity == Complexity::Extreme {
            SynthesisOptions {
                limit: 40,
                max_tokens: Some(budget),
                chunk_size: Some(2_000),
                ..Default::default()
            }
        } else {
            SynthesisOptions {
                limit: 20,
                max_tokens: Some(budget),
                ..Default::default()
            }
        };
        let shared_context = match self
            .memory
            .synthesize_context(tenant, objective, synthesis_opts)
            .await
        {
            Ok(synthesis) if !synthesis.summary.is_empty() => Some(synthesis.summary),
            Ok(_) => None,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "context synthesis failed");
                None
            }
        };

        // Task-level entity record, best-effort.
        let entity_metadata = HashMap::from([
            ("task_id".to_string(), serde_json::json!(task_id.to_string())),
            ("type".to_string(), serde_json::json!("task_entity")),
        ]);
        match self
            .memory
            .store_episode(tenant, format!("task started: {objective}"), entity_metadata)
            .await
        {
            Ok(entity_id) => self.set_entity(task_id, entity_id).await,
            Err(err) => warn!(task_id = %task_id, error = %err, "entity creation failed"),
        }
        self.emit_progress(task_id, TaskPhase::Classified, None).await;

        // Plan the cohort.
        self.check_cancel(cancel)?;
        let (max_agents, required_capabilities) = {
            let tasks = self.tasks.lock().await;
            let entry = tasks.get(&task_id);
            (
                entry
                    .and_then(|e| e.task.constraints.max_agents)
                    .unwrap_or(self.config.orchestrator.max_agents),
                entry
                    .map(|e| e.task.constraints.required_capabilities.clone())
                    .unwrap_or_default(),
            )
        };
        let plan = self
            .generator
            .generate(
                &GenerationRequest {
                    objective: objective.to_string(),
                    complexity,
                    domain: None,
                    max_agents,
                    required_capabilities,
                },
                tenant,
            )
            .await;
        self.emit_progress(
            task_id,
            TaskPhase::Planned,
            Some(format!(
                "{} agents, {}",
                plan.profiles.len(),
                plan.strategy.as_str()
            )),
        )
        .await;

        // Spawn the cohort.
        self.check_cancel(cancel)?;
        let agents = self.spawn_cohort(task_id, &plan, shared_context.as_deref()).await?;
        self.emit_progress(task_id, TaskPhase::Spawning, None).await;

        if plan.strategy == GenerationStrategy::CompetitiveConsensus {
            self.hub
                .stream_to_task(
                    task_id,
                    StreamEvent::CompetitionStarted {
                        competition_id: task_id,
                        agent_count: agents.len(),
                    },
                )
                .await;
        }

        // Execute under retry and the adaptive monitor.
        let results = self
            .execute_cohort(task_id, objective, complexity, &agents, tenant, cancel)
            .await?;
        let succeeded = results.iter().filter(|r| r.1.success).count();
        self.emit_progress(
            task_id,
            TaskPhase::Executing,
            Some(format!("{succeeded}/{} agents succeeded", agents.len())),
        )
        .await;

        // Consensus.
        self.check_cancel(cancel)?;
        self.emit_progress(task_id, TaskPhase::Synthesizing, None).await;
        let inputs: Vec<ConsensusInput> = results
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(profile, r)| ConsensusInput {
                agent_id: r.agent_id,
                model_id: r.model_id.clone(),
                role: r.role,
                output: r.output.clone(),
                priority: profile.priority,
            })
            .collect();
        let consensus = self
            .consensus
            .apply(
                objective,
                &inputs,
                plan.recommended_consensus_layers,
                tenant,
                cancel,
            )
            .await?;

        if plan.strategy == GenerationStrategy::CompetitiveConsensus {
            self.hub
                .stream_to_task(
                    task_id,
                    StreamEvent::CompetitionCompleted {
                        competition_id: task_id,
                        winner_agent_id: inputs.first().map(|i| i.agent_id),
                    },
                )
                .await;
        }

        // Durability: strictly sequential, never fan-out-join.
        self.emit_progress(task_id, TaskPhase::Persisting, None).await;
        let result_value = self
            .persist(task_id, objective, tenant, &consensus, inputs.len())
            .await?;

        Ok(PipelineOutcome {
            result: result_value,
            agents: agents.iter().map(|a| a.id()).collect(),
            strategy: plan.strategy,
            consensus: Some(consensus),
        })
    }

    /// Spawn agents for every profile through the parallel spawner; each
    /// live agent is pool-admitted, census-scoped, and announced.
    async fn spawn_cohort(
        &self,
        task_id: Uuid,
        plan: &GenerationPlan,
        shared_context: Option<&str>,
    ) -> CoreResult<Vec<Arc<Agent>>> {
        let spawner = ParallelSpawner::new(self.config.spawner.clone());
        let requests: Vec<_> = plan
            .profiles
            .iter()
            .cloned()
            .map(|profile| {
                let gateway = Arc::clone(&self.gateway);
                let hub = Arc::clone(&self.hub);
                let shared = shared_context.map(ToString::to_string);
                move || {
                    let gateway = Arc::clone(&gateway);
                    let hub = Arc::clone(&hub);
                    let profile = profile.clone();
                    let shared = shared.clone();
                    async move {
                        let agent = Arc::new(Agent::new(task_id, profile, gateway, hub));
                        agent.set_shared_context(shared);
                        Ok::<_, CoreError>(agent)
                    }
                }
            })
            .collect();

        let outcomes = spawner.spawn_parallel(requests).await;
        let mut agents = Vec::new();
        for outcome in outcomes {
            match (outcome.status, outcome.value) {
                (SpawnStatus::Fulfilled, Some(agent)) => {
                    self.pool.add(Arc::clone(&agent)).await?;
                    let scope = Arc::new(
                        ResourceScope::new(
                            Arc::clone(&agent),
                            format!("agent:{}", agent.id()),
                            self.census.clone(),
                        )
                        .await,
                    );
                    if let Some(entry) = self.tasks.lock().await.get_mut(&task_id) {
                        entry.scopes.push(scope);
                    }
                    self.hub
                        .stream_to_task(
                            task_id,
                            StreamEvent::AgentSpawned {
                                task_id,
                                agent_id: agent.id(),
                                model_id: agent.model_id().to_string(),
                                role: agent.role().as_str().to_string(),
                            },
                        )
                        .await;
                    agents.push(agent);
                }
                (_, _) => {
                    if let Some(reason) = outcome.reason {
                        warn!(task_id = %task_id, request = outcome.id, error = %reason, "spawn rejected");
                    }
                }
            }
        }

        if agents.is_empty() {
            return Err(CoreError::Internal("no agents could be spawned".into()));
        }
        Ok(agents)
    }

    /// Run every agent concurrently under the retry executor and the
    /// adaptive monitor; a hang cancels the whole task.
    async fn execute_cohort(
        &self,
        task_id: Uuid,
        objective: &str,
        complexity: Complexity,
        agents: &[Arc<Agent>],
        tenant: &TenantContext,
        cancel: &CancelToken,
    ) -> CoreResult<Vec<(AgentProfile, ExecutionResult)>> {
        let primary_model = agents
            .first()
            .map(|a| a.model_id().to_string())
            .unwrap_or_default();
        let mut signals = self
            .adaptive
            .start_monitoring(task_id, primary_model, complexity)
            .await;

        // Hung -> cancellation with a diagnostic marker the finalizer
        // translates into `adaptive_hung`.
        let hang_cancel = cancel.clone();
        let watcher = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    ProgressSignal::Hung { idle_ms, .. } => {
                        hang_cancel.cancel(format!("{HUNG_MARKER}:{idle_ms}"));
                        break;
                    }
                    ProgressSignal::Stall { task_id, idle_ms } => {
                        debug!(task_id = %task_id, idle_ms, "stall observed");
                    }
                }
            }
        });

        let adaptive = Arc::clone(&self.adaptive);
        let progress: ProgressFn = Arc::new(move |bytes, chunks| {
            let adaptive = Arc::clone(&adaptive);
            tokio::spawn(async move {
                adaptive.update_progress(task_id, bytes, chunks).await;
            });
        });

        let executions = agents.iter().map(|agent| {
            let agent = Arc::clone(agent);
            let progress = Arc::clone(&progress);
            let tenant = tenant.clone();
            async move {
                let started = Instant::now();
                let ctx = RetryContext::new(task_id, "model_gateway", "agent.execute")
                    .with_agent(agent.id())
                    .with_config(RetryConfig {
                        max_retries: self.config.retry.max_retries,
                        base_delay_ms: self.config.retry.base_delay_ms,
                        max_retry_delay_ms: self.config.retry.max_retry_delay_ms,
                        timeout_ms: complexity.default_estimate_ms(),
                        ..Default::default()
                    });

                let result = self
                    .retry
                    .execute(&ctx, cancel, |attempt| {
                        let agent = Arc::clone(&agent);
                        let progress = Arc::clone(&progress);
                        let tenant = tenant.clone();
                        async move {
                            let agent = if attempt == 0 {
                                agent
                            } else {
                                // A prior attempt failed on this model:
                                // mark it and substitute a different one.
                                self.substitute_agent(task_id, &agent).await?
                            };
                            agent
                                .execute(&tenant, objective, cancel, Some(progress))
                                .await
                        }
                    })
                    .await;

                #[allow(clippy::cast_possible_truncation)]
                let latency_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(_) => {
                        self.hub
                            .stream_to_task(
                                task_id,
                                StreamEvent::AgentComplete {
                                    agent_id: agent.id(),
                                    success: true,
                                    latency_ms,
                                },
                            )
                            .await;
                    }
                    Err(err) => {
                        self.hub
                            .stream_to_task(
                                task_id,
                                StreamEvent::AgentComplete {
                                    agent_id: agent.id(),
                                    success: false,
                                    latency_ms,
                                },
                            )
                            .await;
                        warn!(task_id = %task_id, agent_id = %agent.id(), error = %err, "agent failed");
                    }
                }
                (agent.profile().clone(), result)
            }
        });

        let outcomes = futures::future::join_all(executions).await;
        watcher.abort();
        self.adaptive.complete_task(task_id).await;

        // Cancellation (including hang) outranks partial results.
        if let Some(reason) = cancel.reason() {
            return Err(CoreError::Cancelled(reason));
        }

        let mut results = Vec::new();
        let mut last_error = None;
        for (profile, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push((profile, result)),
                Err(err) => last_error = Some(err),
            }
        }
        if results.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                CoreError::Internal("cohort produced no results".into())
            }));
        }
        Ok(results)
    }

    /// Mark an agent's model failed and spawn a replacement on a
    /// different model for the next attempt.
    async fn substitute_agent(&self, task_id: Uuid, failed: &Arc<Agent>) -> CoreResult<Arc<Agent>> {
        let failed_model = failed.model_id().to_string();
        self.selector
            .mark_model_failed(
                &failed_model,
                &CoreError::GatewayUnavailable {
                    model_id: failed_model.clone(),
                    message: "execution attempt failed".into(),
                },
            )
            .await;

        let substitute_model = self
            .selector
            .select_model(&SelectionCriteria {
                avoid_models: vec![failed_model.clone()],
                ..Default::default()
            })
            .await
            .unwrap_or(failed_model);

        let mut profile = failed.profile().clone();
        profile.model_id = substitute_model;
        let agent = Arc::new(Agent::new(
            task_id,
            profile,
            Arc::clone(&self.gateway),
            Arc::clone(&self.hub),
        ));
        self.pool.add(Arc::clone(&agent)).await?;
        let scope = Arc::new(
            ResourceScope::new(
                Arc::clone(&agent),
                format!("agent:{}", agent.id()),
                self.census.clone(),
            )
            .await,
        );
        if let Some(entry) = self.tasks.lock().await.get_mut(&task_id) {
            entry.scopes.push(scope);
        }
        self.hub
            .stream_to_task(
                task_id,
                StreamEvent::AgentSpawned {
                    task_id,
                    agent_id: agent.id(),
                    model_id: agent.model_id().to_string(),
                    role: agent.role().as_str().to_string(),
                },
            )
            .await;
        info!(task_id = %task_id, model = agent.model_id(), "substituted agent after model failure");
        Ok(agent)
    }

    /// Durability steps (a)-(e): checkpoint, fatal document write,
    /// best-effort projections, commit.
    async fn persist(
        &self,
        task_id: Uuid,
        objective: &str,
        tenant: &TenantContext,
        consensus: &ConsensusResult,
        agent_count: usize,
    ) -> CoreResult<serde_json::Value> {
        let synthesis = serde_json::json!({
            "tenant": tenant,
            "objective": objective,
            "final_output": consensus.final_output,
            "consensus_strength": consensus.consensus_strength,
            "confidence_score": consensus.confidence_score,
            "uncertainties": consensus.uncertainties,
        });

        // (a) Write-ahead checkpoint, pending.
        let checkpoint = Checkpoint::new(
            task_id,
            synthesis.clone(),
            agent_count,
            consensus.consensus_strength,
            &self.config.consensus.arbiter_model,
        );
        self.checkpoints.write_checkpoint(&checkpoint).await?;

        // (b) The one fatal write: the artifact document.
        let doc_metadata = HashMap::from([
            ("task_id".to_string(), serde_json::json!(task_id.to_string())),
            ("type".to_string(), serde_json::json!("final_artifact")),
        ]);
        let doc_id = self
            .memory
            .store_document(tenant, consensus.final_output.clone(), doc_metadata)
            .await
            .map_err(|err| CoreError::Durability(err.to_string()))?;

        // (c) Memory queue projection, best-effort.
        if let Err(err) = self
            .job_store
            .enqueue(
                "memory_projection",
                serde_json::json!({"task_id": task_id, "doc_id": doc_id}),
                EnqueueOptions::default(),
                tenant,
            )
            .await
        {
            warn!(task_id = %task_id, error = %err, "memory projection enqueue failed");
        }

        // (d) Episode pointer for timeline discovery, best-effort.
        let episode_metadata = HashMap::from([
            ("task_id".to_string(), serde_json::json!(task_id.to_string())),
            ("doc_id".to_string(), serde_json::json!(doc_id)),
        ]);
        if let Err(err) = self
            .memory
            .store_episode(
                tenant,
                format!("task completed: {objective}"),
                episode_metadata,
            )
            .await
        {
            warn!(task_id = %task_id, error = %err, "episode pointer failed");
        }

        // (e) Commit: the artifact is durable.
        self.checkpoints.commit_checkpoint(task_id).await?;

        Ok(serde_json::json!({
            "doc_id": doc_id,
            "final_output": consensus.final_output,
            "consensus_strength": consensus.consensus_strength,
            "confidence_score": consensus.confidence_score,
        }))
    }

    // ------------------------------------------------------------------
    // Terminal bookkeeping
    // ------------------------------------------------------------------

    async fn bypass(
        &self,
        task_id: Uuid,
        thread_id: Uuid,
        objective: &str,
        tenant: &TenantContext,
    ) -> CoreResult<SubmitResponse> {
        debug!(task_id = %task_id, "short-circuiting trivial message");
        self.mark_running(task_id).await;

        let started = Instant::now();
        let response = self
            .gateway
            .complete(
                CompletionRequest::new(
                    &self.config.orchestrator.analyzer_model,
                    vec![ChatMessage::user(objective)],
                )
                .with_max_tokens(512),
            )
            .await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        match response {
            Ok(completion) => {
                let result = serde_json::json!({"final_output": completion.content});
                self.write_terminal(task_id, TaskStatus::Completed, Some(result.clone()), None)
                    .await;
                self.hub
                    .stream_to_task(
                        task_id,
                        StreamEvent::TaskCompleted {
                            task_id,
                            result: result.clone(),
                        },
                    )
                    .await;
                self.schedule_cleanup(task_id, tenant.clone());
                Ok(SubmitResponse {
                    task_id,
                    thread_id,
                    status: TaskStatus::Completed,
                    result: Some(result),
                    agents: Vec::new(),
                    metadata: SubmitMetadata {
                        bypass: true,
                        reason: Some("message_too_short".to_string()),
                        duration_ms: Some(duration_ms),
                        ..Default::default()
                    },
                })
            }
            Err(err) => {
                let record = err.with_context(ErrorContext {
                    task_id: Some(task_id),
                    duration_ms: Some(duration_ms),
                    correlation_id: Some(tenant.correlation_id.clone()),
                    ..Default::default()
                });
                self.write_terminal(task_id, TaskStatus::Failed, None, Some(record))
                    .await;
                self.schedule_cleanup(task_id, tenant.clone());
                Err(err)
            }
        }
    }

    async fn finalize(
        &self,
        task_id: Uuid,
        thread_id: Uuid,
        tenant: &TenantContext,
        run: CoreResult<PipelineOutcome>,
    ) -> CoreResult<SubmitResponse> {
        match run {
            Ok(outcome) => {
                self.write_terminal(
                    task_id,
                    TaskStatus::Completed,
                    Some(outcome.result.clone()),
                    None,
                )
                .await;
                self.emit_progress(task_id, TaskPhase::Completed, None).await;
                self.hub
                    .stream_to_task(
                        task_id,
                        StreamEvent::TaskCompleted {
                            task_id,
                            result: outcome.result.clone(),
                        },
                    )
                    .await;
                if let Err(err) = self
                    .memory
                    .append_thread_message(
                        tenant,
                        thread_id,
                        "assistant",
                        outcome
                            .result
                            .get("final_output")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default(),
                    )
                    .await
                {
                    warn!(task_id = %task_id, error = %err, "assistant thread append failed");
                }
                self.schedule_cleanup(task_id, tenant.clone());

                let consensus = outcome.consensus.as_ref();
                Ok(SubmitResponse {
                    task_id,
                    thread_id,
                    status: TaskStatus::Completed,
                    result: Some(outcome.result),
                    agents: outcome.agents.clone(),
                    metadata: SubmitMetadata {
                        bypass: false,
                        reason: None,
                        strategy: Some(outcome.strategy.as_str().to_string()),
                        consensus_strength: consensus.map(|c| c.consensus_strength),
                        agent_count: Some(outcome.agents.len()),
                        duration_ms: None,
                    },
                })
            }
            Err(err) => {
                // Translate an adaptive-hang cancellation into its own
                // failure code before classifying the terminal state.
                let err = match err {
                    CoreError::Cancelled(reason) if reason.starts_with(HUNG_MARKER) => {
                        let stalled_for_ms = reason
                            .rsplit(':')
                            .next()
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        CoreError::Hung { stalled_for_ms }
                    }
                    other => other,
                };

                let status = match &err {
                    CoreError::Cancelled(_) => TaskStatus::Cancelled,
                    CoreError::HardTimeout { .. } => TaskStatus::Timeout,
                    _ => TaskStatus::Failed,
                };
                let record = err.with_context(ErrorContext {
                    task_id: Some(task_id),
                    correlation_id: Some(tenant.correlation_id.clone()),
                    ..Default::default()
                });
                self.write_terminal(task_id, status, None, Some(record.clone()))
                    .await;

                match status {
                    TaskStatus::Cancelled => {
                        self.hub
                            .stream_to_task(
                                task_id,
                                StreamEvent::TaskCancelled {
                                    task_id,
                                    reason: record.message.clone(),
                                },
                            )
                            .await;
                    }
                    _ => {
                        self.hub
                            .stream_to_task(
                                task_id,
                                StreamEvent::TaskFailed {
                                    task_id,
                                    error: record,
                                },
                            )
                            .await;
                    }
                }
                self.schedule_cleanup(task_id, tenant.clone());
                Err(err)
            }
        }
    }

    /// Exactly one terminal write per task; later writes are ignored.
    async fn write_terminal(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<TaskError>,
    ) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(&task_id) {
            if entry.task.is_terminal() {
                return;
            }
            if entry.task.transition_to(status).is_ok() {
                entry.task.result = result;
                entry.task.error = error;
                if status == TaskStatus::Completed {
                    entry.progress = 100;
                }
                info!(task_id = %task_id, status = status.as_str(), "task terminal");
            }
        }
    }

    async fn mark_running(&self, task_id: Uuid) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(&task_id) {
            let _ = entry.task.transition_to(TaskStatus::Running);
        }
    }

    async fn set_entity(&self, task_id: Uuid, entity_id: String) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(&task_id) {
            entry.task.entity_id = Some(entity_id);
        }
    }

    async fn emit_progress(&self, task_id: Uuid, phase: TaskPhase, detail: Option<String>) {
        let pct = phase.progress_pct();
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.progress = entry.progress.max(pct);
            }
        }
        self.hub
            .stream_to_task(
                task_id,
                StreamEvent::TaskProgress {
                    task_id,
                    progress: pct,
                    phase: format!("{phase:?}").to_lowercase(),
                    detail,
                },
            )
            .await;
    }

    fn check_cancel(&self, cancel: &CancelToken) -> CoreResult<()> {
        match cancel.reason() {
            Some(reason) => Err(CoreError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Dispose every scope the task accumulated, in parallel. Idempotent
    /// per scope.
    async fn dispose_task_agents(&self, task_id: Uuid) {
        let scopes: Vec<Arc<ResourceScope<Agent>>> = {
            let tasks = self.tasks.lock().await;
            tasks
                .get(&task_id)
                .map(|e| e.scopes.clone())
                .unwrap_or_default()
        };
        crate::services::dispose_all(&scopes, &DisposeOptions::default()).await;
        let agents = self.pool.agents_for_task(task_id).await;
        for agent in agents {
            self.pool.cleanup_agent(agent.id()).await;
        }
    }

    /// Intermediate memory cleanup after a short delay, then full entry
    /// removal at the retention horizon.
    fn schedule_cleanup(&self, task_id: Uuid, tenant: TenantContext) {
        let memory = Arc::clone(&self.memory);
        let tasks = Arc::clone(&self.tasks);
        let cleanup_delay = Duration::from_secs(self.config.orchestrator.memory_cleanup_delay_secs);
        let retention = Duration::from_secs(self.config.orchestrator.task_retention_secs);

        tokio::spawn(async move {
            tokio::time::sleep(cleanup_delay).await;
            if let Err(err) = memory.cleanup_task(&tenant, task_id).await {
                warn!(task_id = %task_id, error = %err, "task memory cleanup failed");
            }
            tokio::time::sleep(retention.saturating_sub(cleanup_delay)).await;
            tasks.lock().await.remove(&task_id);
            debug!(task_id = %task_id, "task entry removed after retention");
        });
    }
}

/// Re-run the durable document write for a recovered checkpoint. The
/// write is idempotent per task, so a crash after the original write does
/// not duplicate the artifact.
async fn replay_persistence(
    memory: &Arc<dyn MemoryStore>,
    checkpoint: &Checkpoint,
) -> CoreResult<()> {
    let tenant: TenantContext = serde_json::from_value(
        checkpoint
            .synthesis_result
            .get("tenant")
            .cloned()
            .ok_or_else(|| CoreError::Internal("checkpoint missing tenant".into()))?,
    )?;
    let final_output = checkpoint
        .synthesis_result
        .get("final_output")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let metadata = HashMap::from([
        (
            "task_id".to_string(),
            serde_json::json!(checkpoint.task_id.to_string()),
        ),
        ("type".to_string(), serde_json::json!("final_artifact")),
    ]);
    memory
        .store_document(&tenant, final_output, metadata)
        .await
        .map_err(|err| CoreError::Durability(err.to_string()))?;
    Ok(())
}
