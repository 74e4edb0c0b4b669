//! Model selection over the gateway catalog.
//!
//! Preference order: required-capability match, provider diversity, context
//! length, cost/quality heuristic, avoid-list. Failed models are avoided
//! for a sliding window; the catalog is cached and served stale when a
//! refresh fails.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentRole, Complexity};
use crate::domain::ports::{ModelGateway, ModelInfo};

/// Criteria for one selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub role: Option<AgentRole>,
    pub task_complexity: Option<Complexity>,
    pub required_capabilities: Vec<String>,
    pub min_context_length: u64,
    pub preferred_providers: Vec<String>,
    pub avoid_models: Vec<String>,
}

/// Selector tunables.
#[derive(Debug, Clone)]
pub struct ModelSelectorConfig {
    /// Sliding window during which a failed model is avoided.
    pub failed_model_avoid: Duration,
    /// Catalog cache lifetime.
    pub catalog_ttl: Duration,
    /// Whether zero-priced / `:free` models may be selected.
    pub allow_free_models: bool,
}

impl Default for ModelSelectorConfig {
    fn default() -> Self {
        Self {
            failed_model_avoid: Duration::minutes(5),
            catalog_ttl: Duration::hours(1),
            allow_free_models: false,
        }
    }
}

struct SelectorState {
    catalog: Vec<ModelInfo>,
    fetched_at: Option<DateTime<Utc>>,
    /// model id -> avoided-until. Refreshed on repeat failures (sliding).
    failed_until: HashMap<String, DateTime<Utc>>,
}

/// Selects concrete models by role, complexity, and context requirements.
pub struct ModelSelector {
    gateway: Arc<dyn ModelGateway>,
    config: ModelSelectorConfig,
    state: Mutex<SelectorState>,
}

impl ModelSelector {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: ModelSelectorConfig) -> Self {
        Self {
            gateway,
            config,
            state: Mutex::new(SelectorState {
                catalog: Vec::new(),
                fetched_at: None,
                failed_until: HashMap::new(),
            }),
        }
    }

    /// Select one model id satisfying the criteria.
    pub async fn select_model(&self, criteria: &SelectionCriteria) -> CoreResult<String> {
        let candidates = self.candidates(criteria).await?;
        candidates
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| CoreError::NotFound("no model satisfies the selection criteria".into()))
    }

    /// Select up to `n` models with maximum provider diversity. When fewer
    /// providers than `n` exist, selection falls back to round-robin within
    /// the best providers.
    pub async fn select_diverse_models(
        &self,
        n: usize,
        criteria: &SelectionCriteria,
    ) -> CoreResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let candidates = self.candidates(criteria).await?;
        if candidates.is_empty() {
            return Err(CoreError::NotFound(
                "no model satisfies the selection criteria".into(),
            ));
        }

        // Bucket by provider, keeping each bucket in score order.
        let mut providers: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<&ModelInfo>> = HashMap::new();
        for model in &candidates {
            let provider = model.provider().to_string();
            if !buckets.contains_key(&provider) {
                providers.push(provider.clone());
            }
            buckets.entry(provider).or_default().push(model);
        }

        // Round-robin across providers until n models are chosen.
        let mut selected = Vec::with_capacity(n);
        let mut depth = 0;
        while selected.len() < n {
            let mut advanced = false;
            for provider in &providers {
                if selected.len() >= n {
                    break;
                }
                if let Some(model) = buckets.get(provider).and_then(|b| b.get(depth)) {
                    selected.push(model.id.clone());
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
            depth += 1;
        }
        Ok(selected)
    }

    /// Mark a model failed; it is avoided for the sliding window.
    pub async fn mark_model_failed(&self, model_id: &str, err: &CoreError) {
        let until = Utc::now() + self.config.failed_model_avoid;
        warn!(model = model_id, error = %err, "marking model failed until {until}");
        self.state
            .lock()
            .await
            .failed_until
            .insert(model_id.to_string(), until);
    }

    /// Clear a model's failed state, restoring it to selection.
    pub async fn mark_model_working(&self, model_id: &str) {
        self.state.lock().await.failed_until.remove(model_id);
    }

    /// Whether the model exists in the gateway catalog.
    pub async fn validate_model(&self, model_id: &str) -> CoreResult<bool> {
        let catalog = self.catalog().await?;
        Ok(catalog.iter().any(|m| m.id == model_id))
    }

    /// Cached catalog, refreshed past its TTL. A stale cache is returned
    /// when the refresh fails.
    pub async fn catalog(&self) -> CoreResult<Vec<ModelInfo>> {
        let mut state = self.state.lock().await;
        let fresh = state
            .fetched_at
            .is_some_and(|at| Utc::now() - at < self.config.catalog_ttl);
        if fresh {
            return Ok(state.catalog.clone());
        }

        match self.gateway.list_models().await {
            Ok(models) => {
                state.catalog = models;
                state.fetched_at = Some(Utc::now());
                Ok(state.catalog.clone())
            }
            Err(err) if !state.catalog.is_empty() => {
                warn!(error = %err, "catalog refresh failed, serving stale cache");
                Ok(state.catalog.clone())
            }
            Err(err) => Err(err),
        }
    }

    /// Force a catalog refresh regardless of TTL.
    pub async fn refresh_catalog(&self) -> CoreResult<usize> {
        let models = self.gateway.list_models().await?;
        let mut state = self.state.lock().await;
        state.catalog = models;
        state.fetched_at = Some(Utc::now());
        Ok(state.catalog.len())
    }

    /// Age of the cached catalog, if fetched.
    pub async fn catalog_age(&self) -> Option<Duration> {
        self.state
            .lock()
            .await
            .fetched_at
            .map(|at| Utc::now() - at)
    }

    /// Eligible models in preference order.
    async fn candidates(&self, criteria: &SelectionCriteria) -> CoreResult<Vec<ModelInfo>> {
        let catalog = self.catalog().await?;
        let now = Utc::now();
        let failed: HashMap<String, DateTime<Utc>> =
            self.state.lock().await.failed_until.clone();

        let mut eligible: Vec<ModelInfo> = catalog
            .into_iter()
            .filter(|m| {
                if !m.has_capabilities(&criteria.required_capabilities) {
                    return false;
                }
                if m.context_length < criteria.min_context_length {
                    return false;
                }
                if criteria.avoid_models.iter().any(|a| a == &m.id) {
                    return false;
                }
                if m.is_free() && !self.config.allow_free_models {
                    return false;
                }
                if failed.get(&m.id).is_some_and(|until| *until > now) {
                    return false;
                }
                true
            })
            .collect();

        let complexity = criteria.task_complexity.unwrap_or_default();
        eligible.sort_by(|a, b| {
            Self::score(b, criteria, complexity)
                .partial_cmp(&Self::score(a, criteria, complexity))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(candidates = eligible.len(), "model candidates ranked");
        Ok(eligible)
    }

    /// Cost/quality heuristic: preferred providers rank first; pricing is a
    /// quality proxy for complex work and a cost penalty for simple work;
    /// larger context breaks ties.
    fn score(model: &ModelInfo, criteria: &SelectionCriteria, complexity: Complexity) -> f64 {
        let mut score = 0.0;

        if let Some(rank) = criteria
            .preferred_providers
            .iter()
            .position(|p| p == model.provider())
        {
            #[allow(clippy::cast_precision_loss)]
            {
                score += 100.0 - rank as f64;
            }
        }

        let price = model.pricing.prompt + model.pricing.completion;
        match complexity {
            Complexity::Simple => score -= price * 1_000.0,
            Complexity::Medium => {}
            Complexity::Complex => score += (price * 1_000.0).min(20.0),
            Complexity::Extreme => score += (price * 1_000.0).min(40.0),
        }

        #[allow(clippy::cast_precision_loss)]
        {
            score += (model.context_length as f64).log10();
        }
        score
    }
}
