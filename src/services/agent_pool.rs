//! Live agent registry.
//!
//! The pool owns agents by id; everything else holds `Uuid` handles and
//! looks agents up on demand. Admission beyond the concurrency cap evicts
//! the oldest idle agent; stale agents are evicted by age and idleness.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentSnapshot, AgentState};
use crate::services::agent::Agent;
use crate::services::resource_scope::{Disposable, DisposeOptions};

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Hard cap on live agents.
    pub max_concurrent: usize,
    /// Agents older than this are evicted regardless of state.
    pub max_age: Duration,
    /// Idle agents inactive longer than this are evicted.
    pub idle_timeout: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 32,
            max_age: Duration::hours(1),
            idle_timeout: Duration::minutes(10),
        }
    }
}

/// Pool occupancy metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

/// Tracks live agents and enforces occupancy policy.
pub struct AgentPool {
    config: AgentPoolConfig,
    agents: Mutex<HashMap<Uuid, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Admit an agent. When the pool is full, the oldest idle agent is
    /// evicted to make room; if none is idle, admission fails.
    pub async fn add(&self, agent: Arc<Agent>) -> CoreResult<Uuid> {
        let mut agents = self.agents.lock().await;
        if agents.len() >= self.config.max_concurrent {
            let oldest_idle = agents
                .values()
                .filter(|a| a.state() == AgentState::Idle)
                .min_by_key(|a| a.last_active_at())
                .map(|a| a.id());
            match oldest_idle {
                Some(evict_id) => {
                    if let Some(evicted) = agents.remove(&evict_id) {
                        warn!(agent_id = %evict_id, "pool full, evicting oldest idle agent");
                        Self::dispose_agent(&evicted).await;
                    }
                }
                None => {
                    return Err(CoreError::ResourceExhausted {
                        resource: "agent_pool".to_string(),
                        message: format!(
                            "pool at capacity ({}) with no idle agent to evict",
                            self.config.max_concurrent
                        ),
                    });
                }
            }
        }

        let id = agent.id();
        agents.insert(id, agent);
        debug!(agent_id = %id, total = agents.len(), "agent admitted to pool");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Agent>> {
        self.agents.lock().await.get(&id).cloned()
    }

    /// Remove an agent, disposing it first.
    pub async fn remove(&self, id: Uuid) -> CoreResult<()> {
        let agent = self.agents.lock().await.remove(&id);
        match agent {
            Some(agent) => {
                Self::dispose_agent(&agent).await;
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("agent {id}"))),
        }
    }

    /// Alias for `remove` used by per-task cleanup paths; missing agents
    /// are not an error there.
    pub async fn cleanup_agent(&self, id: Uuid) {
        if let Some(agent) = self.agents.lock().await.remove(&id) {
            Self::dispose_agent(&agent).await;
        }
    }

    /// Snapshots of agents currently running.
    pub async fn get_active(&self) -> Vec<AgentSnapshot> {
        self.agents
            .lock()
            .await
            .values()
            .filter(|a| a.state() == AgentState::Running)
            .map(|a| a.snapshot())
            .collect()
    }

    /// All agents owned by a task.
    pub async fn agents_for_task(&self, task_id: Uuid) -> Vec<Arc<Agent>> {
        self.agents
            .lock()
            .await
            .values()
            .filter(|a| a.task_id() == task_id)
            .cloned()
            .collect()
    }

    /// Evict agents past max age or idle past the idle window. Returns the
    /// number evicted.
    pub async fn evict_stale(&self) -> usize {
        let now = Utc::now();
        let mut agents = self.agents.lock().await;
        let stale: Vec<Uuid> = agents
            .values()
            .filter(|a| {
                let too_old = now - a.spawned_at() > self.config.max_age;
                let too_idle = a.state() != AgentState::Running
                    && now - a.last_active_at() > self.config.idle_timeout;
                too_old || too_idle
            })
            .map(|a| a.id())
            .collect();

        for id in &stale {
            if let Some(agent) = agents.remove(id) {
                debug!(agent_id = %id, "evicting stale agent");
                Self::dispose_agent(&agent).await;
            }
        }
        stale.len()
    }

    pub async fn get_metrics(&self) -> PoolMetrics {
        let agents = self.agents.lock().await;
        let active = agents
            .values()
            .filter(|a| a.state() == AgentState::Running)
            .count();
        PoolMetrics {
            total: agents.len(),
            active,
            idle: agents.len() - active,
        }
    }

    /// Dispose every agent and empty the pool.
    pub async fn destroy(&self) {
        let drained: Vec<Arc<Agent>> = self.agents.lock().await.drain().map(|(_, a)| a).collect();
        for agent in drained {
            Self::dispose_agent(&agent).await;
        }
    }

    async fn dispose_agent(agent: &Arc<Agent>) {
        if let Err(err) = agent.dispose(&DisposeOptions::default()).await {
            warn!(agent_id = %agent.id(), error = %err, "agent dispose failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StreamConfig;
    use crate::domain::models::{AgentProfile, AgentRole};
    use crate::domain::ports::model_gateway::{
        ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse, ModelGateway,
        ModelInfo,
    };
    use crate::services::stream_hub::StreamHub;
    use async_trait::async_trait;
    use futures::StreamExt;

    struct NoopGateway;

    #[async_trait]
    impl ModelGateway for NoopGateway {
        async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
            Ok(vec![])
        }
        async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
            Ok(CompletionResponse {
                model_id: request.model_id,
                content: String::new(),
                tokens_used: 0,
            })
        }
        async fn complete_stream(&self, _request: CompletionRequest) -> CoreResult<ChunkStream> {
            Ok(futures::stream::empty::<CoreResult<CompletionChunk>>().boxed())
        }
        async fn health_check(&self) -> CoreResult<bool> {
            Ok(true)
        }
    }

    fn make_agent(task_id: Uuid) -> Arc<Agent> {
        Arc::new(Agent::new(
            task_id,
            AgentProfile::new(AgentRole::Research, "test").with_model("a/b"),
            Arc::new(NoopGateway),
            Arc::new(StreamHub::new(StreamConfig::default())),
        ))
    }

    #[tokio::test]
    async fn test_add_and_metrics() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();
        let metrics = pool.get_metrics().await;
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.idle, 2);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_full_pool_evicts_oldest_idle() {
        let pool = AgentPool::new(AgentPoolConfig {
            max_concurrent: 2,
            ..Default::default()
        });
        let first = make_agent(Uuid::new_v4());
        let first_id = first.id();
        pool.add(first).await.unwrap();
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();

        let metrics = pool.get_metrics().await;
        assert_eq!(metrics.total, 2);
        assert!(pool.get(first_id).await.is_none(), "oldest idle evicted");
    }

    #[tokio::test]
    async fn test_remove_disposes() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let agent = make_agent(Uuid::new_v4());
        let id = pool.add(Arc::clone(&agent)).await.unwrap();
        pool.remove(id).await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);
        assert!(pool.remove(id).await.is_err());
    }

    #[tokio::test]
    async fn test_agents_for_task() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let task = Uuid::new_v4();
        pool.add(make_agent(task)).await.unwrap();
        pool.add(make_agent(task)).await.unwrap();
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();
        assert_eq!(pool.agents_for_task(task).await.len(), 2);
    }

    #[tokio::test]
    async fn test_evict_stale_by_idle() {
        let pool = AgentPool::new(AgentPoolConfig {
            idle_timeout: Duration::zero(),
            ..Default::default()
        });
        pool.add(make_agent(Uuid::new_v4())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(pool.evict_stale().await, 1);
        assert_eq!(pool.get_metrics().await.total, 0);
    }

    #[tokio::test]
    async fn test_destroy_disposes_all() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let a = make_agent(Uuid::new_v4());
        let b = make_agent(Uuid::new_v4());
        pool.add(Arc::clone(&a)).await.unwrap();
        pool.add(Arc::clone(&b)).await.unwrap();
        pool.destroy().await;
        assert_eq!(pool.get_metrics().await.total, 0);
        assert_eq!(a.state(), AgentState::Disposed);
        assert_eq!(b.state(), AgentState::Disposed);
    }
}
