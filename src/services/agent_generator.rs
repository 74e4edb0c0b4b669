//! Dynamic cohort design.
//!
//! A meta-analyzer model, primed with recalled patterns from the memory
//! store, emits a JSON array of agent profiles. Profiles are validated and
//! coerced, bound to diverse models, and the (request, plan) pair is
//! stored back as a pattern for future recalls. Any failure falls back to
//! a minimal research + synthesis cohort.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::CoreResult;
use crate::domain::models::{
    recommended_consensus_layers, AgentProfile, AgentRole, Complexity, GenerationPlan,
    GenerationStrategy, ReasoningDepth, TenantContext,
};
use crate::domain::ports::{
    ChatMessage, CompletionRequest, MemoryKind, MemoryStore, ModelGateway, RecallQuery,
};
use crate::services::model_selector::{ModelSelector, SelectionCriteria};

/// Request for one cohort design.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub objective: String,
    pub complexity: Complexity,
    pub domain: Option<String>,
    pub max_agents: usize,
    pub required_capabilities: Vec<String>,
}

/// Profile shape as emitted by the meta-analyzer; fields are coerced into
/// the domain model after parsing.
#[derive(Debug, Deserialize)]
struct RawProfile {
    role: String,
    #[serde(default)]
    specialization: String,
    #[serde(default)]
    focus: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default, alias = "reasoningDepth")]
    reasoning_depth: Option<String>,
}

/// Designs agent cohorts for tasks.
pub struct AgentGenerator {
    gateway: Arc<dyn ModelGateway>,
    memory: Arc<dyn MemoryStore>,
    selector: Arc<ModelSelector>,
    analyzer_model: String,
}

impl AgentGenerator {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        memory: Arc<dyn MemoryStore>,
        selector: Arc<ModelSelector>,
        analyzer_model: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            memory,
            selector,
            analyzer_model: analyzer_model.into(),
        }
    }

    /// Produce agent profiles and an execution strategy for a task.
    pub async fn generate(
        &self,
        req: &GenerationRequest,
        tenant: &TenantContext,
    ) -> GenerationPlan {
        match self.generate_inner(req, tenant).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "agent generation failed, using fallback cohort");
                self.fallback_plan(req).await
            }
        }
    }

    async fn generate_inner(
        &self,
        req: &GenerationRequest,
        tenant: &TenantContext,
    ) -> CoreResult<GenerationPlan> {
        // 1. Recall similar successful patterns under tenant scope.
        let recalled = self
            .memory
            .recall_memory(
                tenant,
                RecallQuery::new(&req.objective, 5).with_kind(MemoryKind::Pattern),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "pattern recall failed, continuing without");
                Vec::new()
            });

        // 2. Ask the meta-analyzer for profiles.
        let prompt = self.analyzer_prompt(req, &recalled);
        let response = self
            .gateway
            .complete(
                CompletionRequest::new(
                    &self.analyzer_model,
                    vec![
                        ChatMessage::system(
                            "You design cohorts of specialized AI agents. Respond with a JSON \
                             array of agent profiles and nothing else.",
                        ),
                        ChatMessage::user(prompt),
                    ],
                )
                .with_temperature(0.1)
                .with_max_tokens(2048),
            )
            .await?;

        // 3. Parse, coerce, truncate.
        let mut profiles = parse_profiles(&response.content)?;
        profiles.truncate(req.max_agents.max(1));
        if profiles.is_empty() {
            return Ok(self.fallback_plan(req).await);
        }

        // 4. Bind models, preferring maximum provider diversity.
        self.assign_models(&mut profiles, req).await;

        // 5. Strategy and consensus depth.
        let strategy = GenerationStrategy::select(profiles.len(), req.complexity);
        let layers = recommended_consensus_layers(profiles.len(), req.complexity);
        let estimated_duration_ms = req.complexity.default_estimate_ms();

        let plan = GenerationPlan {
            profiles,
            strategy,
            estimated_duration_ms,
            recommended_consensus_layers: layers,
        };

        // 6. Store the (request, plan) pattern for future recalls.
        self.store_pattern(req, &plan, tenant).await;

        debug!(
            agents = plan.profiles.len(),
            strategy = plan.strategy.as_str(),
            layers = plan.recommended_consensus_layers,
            "cohort designed"
        );
        Ok(plan)
    }

    fn analyzer_prompt(
        &self,
        req: &GenerationRequest,
        recalled: &[crate::domain::ports::MemoryRecord],
    ) -> String {
        let mut prompt = format!(
            "Design up to {} specialized agents for this task.\n\
             Task: {}\nComplexity: {}\n",
            req.max_agents,
            req.objective,
            req.complexity.as_str()
        );
        if let Some(domain) = &req.domain {
            prompt.push_str(&format!("Domain: {domain}\n"));
        }
        if !req.required_capabilities.is_empty() {
            prompt.push_str(&format!(
                "Required capabilities: {}\n",
                req.required_capabilities.join(", ")
            ));
        }
        if !recalled.is_empty() {
            prompt.push_str("\nCohorts that worked for similar tasks:\n");
            for record in recalled.iter().take(3) {
                prompt.push_str(&format!("- {}\n", record.content));
            }
        }
        prompt.push_str(
            "\nEach profile: {\"role\": research|coding|review|synthesis|specialist, \
             \"specialization\": string, \"focus\": string, \"capabilities\": [string], \
             \"priority\": 1-10, \"reasoning_depth\": shallow|medium|deep|extreme}",
        );
        prompt
    }

    async fn assign_models(&self, profiles: &mut [AgentProfile], req: &GenerationRequest) {
        let criteria = SelectionCriteria {
            task_complexity: Some(req.complexity),
            required_capabilities: req.required_capabilities.clone(),
            ..Default::default()
        };
        match self
            .selector
            .select_diverse_models(profiles.len(), &criteria)
            .await
        {
            Ok(models) => {
                for (profile, model) in profiles.iter_mut().zip(models) {
                    profile.model_id = model;
                }
                // Fewer models than profiles: reuse the defaults for the rest.
                for profile in profiles.iter_mut().filter(|p| p.model_id.is_empty()) {
                    profile.model_id = default_model_for(profile.role).to_string();
                }
            }
            Err(err) => {
                warn!(error = %err, "diverse selection failed, using role defaults");
                for profile in profiles.iter_mut() {
                    profile.model_id = default_model_for(profile.role).to_string();
                }
            }
        }
    }

    async fn store_pattern(
        &self,
        req: &GenerationRequest,
        plan: &GenerationPlan,
        tenant: &TenantContext,
    ) {
        let summary = format!(
            "{} -> {} agents ({}), layers {}",
            req.objective.chars().take(120).collect::<String>(),
            plan.profiles.len(),
            plan.strategy.as_str(),
            plan.recommended_consensus_layers
        );
        let mut metadata = HashMap::new();
        metadata.insert(
            "profiles".to_string(),
            serde_json::to_value(&plan.profiles).unwrap_or_default(),
        );
        if let Err(err) = self
            .memory
            .store_memory(tenant, MemoryKind::Pattern, summary, metadata)
            .await
        {
            warn!(error = %err, "pattern store-back failed");
        }
    }

    async fn fallback_plan(&self, req: &GenerationRequest) -> GenerationPlan {
        let mut profiles = vec![
            AgentProfile::new(AgentRole::Research, "general research")
                .with_focus("gather the facts the objective needs")
                .with_priority(6),
            AgentProfile::new(AgentRole::Synthesis, "answer synthesis")
                .with_focus("produce the final answer")
                .with_priority(7),
        ];
        profiles.truncate(req.max_agents.max(1));
        self.assign_models(&mut profiles, req).await;

        let strategy = GenerationStrategy::select(profiles.len(), req.complexity);
        let layers = recommended_consensus_layers(profiles.len(), req.complexity);
        GenerationPlan {
            profiles,
            strategy,
            estimated_duration_ms: req.complexity.default_estimate_ms(),
            recommended_consensus_layers: layers,
        }
    }
}

/// Default model binding per role, used when diverse selection fails.
fn default_model_for(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Research | AgentRole::Specialist => "anthropic/claude-sonnet-4.5",
        AgentRole::Coding => "anthropic/claude-opus-4.6",
        AgentRole::Review => "openai/gpt-5",
        AgentRole::Synthesis => "anthropic/claude-opus-4.6",
    }
}

/// Extract and coerce profiles from the analyzer's response. Tolerates
/// fenced code blocks and prose around the array.
fn parse_profiles(content: &str) -> CoreResult<Vec<AgentProfile>> {
    let json = extract_json_array(content).ok_or_else(|| {
        crate::domain::errors::CoreError::Internal("no JSON array in analyzer response".into())
    })?;
    let raw: Vec<RawProfile> = serde_json::from_str(json)?;

    Ok(raw
        .into_iter()
        .map(|r| {
            let mut profile = AgentProfile::new(AgentRole::coerce(&r.role), r.specialization);
            profile.focus = r.focus;
            profile.capabilities = r.capabilities;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                profile.priority = r.priority.unwrap_or(5).clamp(1, 10) as u8;
            }
            profile.reasoning_depth = r
                .reasoning_depth
                .as_deref()
                .map_or(ReasoningDepth::Medium, ReasoningDepth::coerce);
            profile.normalize();
            profile
        })
        .collect())
}

/// First balanced `[...]` span in the content.
fn extract_json_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_array() {
        let content = "Here is the cohort:\n```json\n[{\"role\": \"research\"}]\n```";
        assert_eq!(extract_json_array(content), Some("[{\"role\": \"research\"}]"));
        assert!(extract_json_array("no array here").is_none());
    }

    #[test]
    fn test_parse_profiles_coerces() {
        let content = r#"[
            {"role": "wizard", "specialization": "", "priority": 42},
            {"role": "research", "specialization": "web", "reasoningDepth": "deep"}
        ]"#;
        let profiles = parse_profiles(content).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].role, AgentRole::Specialist);
        assert_eq!(profiles[0].priority, 10);
        assert_eq!(profiles[0].specialization, "specialist");
        assert_eq!(profiles[1].reasoning_depth, ReasoningDepth::Deep);
    }

    #[test]
    fn test_parse_profiles_rejects_prose() {
        assert!(parse_profiles("I could not design agents for this").is_err());
    }

    #[test]
    fn test_default_models_cover_roles() {
        for role in [
            AgentRole::Research,
            AgentRole::Coding,
            AgentRole::Review,
            AgentRole::Synthesis,
            AgentRole::Specialist,
        ] {
            assert!(default_model_for(role).contains('/'));
        }
    }
}
