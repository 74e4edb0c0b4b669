//! Multi-layer consensus over heterogeneous agent outputs.
//!
//! Each layer is a reducer over the previous layer's outputs: cluster
//! positions, arbitrate conflicts, synthesize. The cancel token is checked
//! between layers; cancellation discards the partial synthesis.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::ConsensusConfig;
use crate::domain::models::{AgentRole, ConflictResolution, ConsensusResult, TenantContext};
use crate::domain::ports::{ChatMessage, CompletionRequest, ModelGateway};
use crate::services::cancel::CancelToken;

/// One agent's contribution to consensus.
#[derive(Debug, Clone)]
pub struct ConsensusInput {
    pub agent_id: Uuid,
    pub model_id: String,
    pub role: AgentRole,
    pub output: String,
    /// Profile priority, used as the agent's weight.
    pub priority: u8,
}

/// A cluster of agents holding the same principal position.
#[derive(Debug)]
struct Cluster {
    members: Vec<usize>,
    agreement: f64,
}

/// Reduces agent outputs through up to three layers into one synthesis.
pub struct ConsensusEngine {
    gateway: Arc<dyn ModelGateway>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: ConsensusConfig) -> Self {
        Self { gateway, config }
    }

    /// Apply up to `layer_count` reduction layers. With one input or zero
    /// layers the single output passes through untouched.
    pub async fn apply(
        &self,
        objective: &str,
        inputs: &[ConsensusInput],
        layer_count: u8,
        tenant: &TenantContext,
        cancel: &CancelToken,
    ) -> CoreResult<ConsensusResult> {
        if inputs.is_empty() {
            return Err(CoreError::Internal("consensus over zero outputs".into()));
        }
        if inputs.len() == 1 || layer_count == 0 {
            return Ok(ConsensusResult::pass_through(&inputs[0].output));
        }

        let mut uncertainties = Vec::new();
        let mut conflict_resolutions = Vec::new();

        // Layer 1: cluster positions by overlap, weighted by the
        // normalized scoring weights.
        self.check_cancel(cancel)?;
        let clusters = self.cluster(inputs);
        let principal = clusters
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.agreement
                    .partial_cmp(&b.agreement)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        debug!(
            clusters = clusters.len(),
            principal_size = clusters[principal].members.len(),
            "consensus layer 1 complete"
        );

        // Layer 2: arbitrate each dissenting cluster against the principal
        // position. Arbitration is best-effort; a failed consult becomes a
        // carried uncertainty rather than a failed task.
        if layer_count >= 2 && clusters.len() > 1 {
            self.check_cancel(cancel)?;
            let principal_rep = &inputs[clusters[principal].members[0]];
            for (i, cluster) in clusters.iter().enumerate() {
                if i == principal {
                    continue;
                }
                let dissenter = &inputs[cluster.members[0]];
                match self
                    .arbitrate(objective, principal_rep, dissenter, tenant)
                    .await
                {
                    Ok(resolution) => conflict_resolutions.push(ConflictResolution {
                        topic: summarize(&dissenter.output),
                        dissenting_agents: cluster
                            .members
                            .iter()
                            .map(|&m| inputs[m].agent_id)
                            .collect(),
                        resolution,
                        arbiter_model: self.config.arbiter_model.clone(),
                    }),
                    Err(err) => {
                        warn!(error = %err, "conflict arbitration failed");
                        uncertainties.push(format!(
                            "unresolved disagreement: {}",
                            summarize(&dissenter.output)
                        ));
                    }
                }
            }
        } else {
            for (i, cluster) in clusters.iter().enumerate() {
                if i != principal {
                    uncertainties.push(format!(
                        "dissenting position not arbitrated: {}",
                        summarize(&inputs[cluster.members[0]].output)
                    ));
                }
            }
        }

        // Layer 3: synthesize the final artifact. A failed synthesis falls
        // back to the principal representative, flagged as an uncertainty.
        self.check_cancel(cancel)?;
        let principal_members = &clusters[principal].members;
        let final_output = if layer_count >= 3 {
            match self
                .synthesize(objective, inputs, &conflict_resolutions)
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    warn!(error = %err, "synthesis layer failed, falling back to principal output");
                    uncertainties.push("synthesis layer failed; principal output used".to_string());
                    inputs[principal_members[0]].output.clone()
                }
            }
        } else {
            inputs[principal_members[0]].output.clone()
        };

        // Strength: fraction of agents whose principal claim matches the
        // final artifact. Confidence: priority-weighted belief adjusted by
        // strength.
        #[allow(clippy::cast_precision_loss)]
        let consensus_strength = principal_members.len() as f64 / inputs.len() as f64;
        #[allow(clippy::cast_precision_loss)]
        let mean_weight = inputs
            .iter()
            .map(|input| f64::from(input.priority) / 10.0)
            .sum::<f64>()
            / inputs.len() as f64;
        let confidence_score = mean_weight * (0.5 + 0.5 * consensus_strength);

        self.check_cancel(cancel)?;
        Ok(ConsensusResult {
            final_output,
            consensus_strength,
            confidence_score,
            conflict_resolutions,
            uncertainties,
        }
        .clamped())
    }

    fn check_cancel(&self, cancel: &CancelToken) -> CoreResult<()> {
        match cancel.reason() {
            Some(reason) => Err(CoreError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Greedy clustering by weighted agreement against each cluster's
    /// first member.
    fn cluster(&self, inputs: &[ConsensusInput]) -> Vec<Cluster> {
        let weights = self.config.weights.normalized();
        let token_sets: Vec<HashSet<String>> =
            inputs.iter().map(|i| tokenize(&i.output)).collect();

        let mut clusters: Vec<Cluster> = Vec::new();
        for (i, tokens) in token_sets.iter().enumerate() {
            let mut placed = false;
            for cluster in &mut clusters {
                let rep = cluster.members[0];
                let overlap = jaccard(tokens, &token_sets[rep]);
                let shared = containment(tokens, &token_sets[rep]);
                let score = weights.semantic_overlap * overlap + weights.shared_claims * shared;
                if score >= 0.25 {
                    cluster.members.push(i);
                    placed = true;
                    break;
                }
            }
            if !placed {
                clusters.push(Cluster {
                    members: vec![i],
                    agreement: 0.0,
                });
            }
        }

        // Score each cluster: internal overlap, plus the member weight mass.
        #[allow(clippy::cast_precision_loss)]
        for cluster in &mut clusters {
            let rep = cluster.members[0];
            let mean_overlap = if cluster.members.len() > 1 {
                cluster.members[1..]
                    .iter()
                    .map(|&m| jaccard(&token_sets[m], &token_sets[rep]))
                    .sum::<f64>()
                    / (cluster.members.len() - 1) as f64
            } else {
                1.0
            };
            let weight_mass = cluster
                .members
                .iter()
                .map(|&m| f64::from(inputs[m].priority) / 10.0)
                .sum::<f64>()
                / inputs.len() as f64;
            cluster.agreement = weights.semantic_overlap * mean_overlap
                + weights.shared_claims * (cluster.members.len() as f64 / inputs.len() as f64)
                + weights.agent_priority * weight_mass;
        }
        clusters
    }

    async fn arbitrate(
        &self,
        objective: &str,
        principal: &ConsensusInput,
        dissenter: &ConsensusInput,
        tenant: &TenantContext,
    ) -> CoreResult<String> {
        let prompt = format!(
            "Objective: {objective}\n\nPosition A:\n{}\n\nPosition B:\n{}\n\n\
             Which position better serves the objective? Answer with a short \
             ruling and the reasoning.",
            principal.output, dissenter.output
        );
        let request = CompletionRequest::new(
            &self.config.arbiter_model,
            vec![
                ChatMessage::system(
                    "You are an impartial arbiter resolving a disagreement between two analyses.",
                ),
                ChatMessage::user(prompt),
            ],
        )
        .with_temperature(0.1)
        .with_max_tokens(1024)
        .with_timeout_ms(self.config.layer_timeout_ms);

        debug!(tenant = %tenant, arbiter = %self.config.arbiter_model, "consulting arbiter");
        let response = tokio::time::timeout(
            Duration::from_millis(self.config.layer_timeout_ms),
            self.gateway.complete(request),
        )
        .await
        .map_err(|_| CoreError::TransientUpstream {
            message: "arbitration timed out".into(),
            status: Some(408),
        })??;
        Ok(response.content)
    }

    async fn synthesize(
        &self,
        objective: &str,
        inputs: &[ConsensusInput],
        resolutions: &[ConflictResolution],
    ) -> CoreResult<String> {
        let mut prompt = format!("Objective: {objective}\n\nAgent outputs:\n");
        for input in inputs {
            prompt.push_str(&format!(
                "--- {} ({}) ---\n{}\n",
                input.role.as_str(),
                input.model_id,
                input.output
            ));
        }
        if !resolutions.is_empty() {
            prompt.push_str("\nConflict rulings:\n");
            for resolution in resolutions {
                prompt.push_str(&format!("- {}\n", resolution.resolution));
            }
        }
        prompt.push_str("\nProduce the single best final answer to the objective.");

        let request = CompletionRequest::new(
            &self.config.arbiter_model,
            vec![
                ChatMessage::system(
                    "You are a synthesis agent. Merge the agent outputs into one final artifact.",
                ),
                ChatMessage::user(prompt),
            ],
        )
        .with_temperature(0.2)
        .with_timeout_ms(self.config.layer_timeout_ms);

        let response = tokio::time::timeout(
            Duration::from_millis(self.config.layer_timeout_ms),
            self.gateway.complete(request),
        )
        .await
        .map_err(|_| CoreError::TransientUpstream {
            message: "synthesis timed out".into(),
            status: Some(408),
        })??;
        Ok(response.content)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(ToString::to_string)
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union.max(1) as f64
}

/// Fraction of the smaller set contained in the larger.
#[allow(clippy::cast_precision_loss)]
fn containment(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / smaller as f64
}

fn summarize(text: &str) -> String {
    let line = text.lines().next().unwrap_or(text);
    line.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::model_gateway::{
        ChunkStream, CompletionResponse, ModelInfo,
    };
    use async_trait::async_trait;

    struct EchoGateway;

    #[async_trait]
    impl ModelGateway for EchoGateway {
        async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
            Ok(vec![])
        }
        async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
            let synthetic = if request.messages.iter().any(|m| m.content.contains("arbiter")) {
                "Position A stands.".to_string()
            } else {
                "Synthesized final answer.".to_string()
            };
            Ok(CompletionResponse {
                model_id: request.model_id,
                content: synthetic,
                tokens_used: 10,
            })
        }
        async fn complete_stream(&self, _request: CompletionRequest) -> CoreResult<ChunkStream> {
            Err(CoreError::Internal("not used".into()))
        }
        async fn health_check(&self) -> CoreResult<bool> {
            Ok(true)
        }
    }

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(Arc::new(EchoGateway), ConsensusConfig::default())
    }

    fn input(output: &str, priority: u8) -> ConsensusInput {
        ConsensusInput {
            agent_id: Uuid::new_v4(),
            model_id: "a/b".to_string(),
            role: AgentRole::Research,
            output: output.to_string(),
            priority,
        }
    }

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "ops")
    }

    #[tokio::test]
    async fn test_single_input_passes_through() {
        let engine = engine();
        let result = engine
            .apply(
                "objective",
                &[input("only answer", 5)],
                3,
                &tenant(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.final_output, "only answer");
        assert!((result.consensus_strength - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_zero_layers_pass_through() {
        let engine = engine();
        let result = engine
            .apply(
                "objective",
                &[input("a", 5), input("b", 5)],
                0,
                &tenant(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.final_output, "a");
    }

    #[tokio::test]
    async fn test_agreeing_cohort_high_strength() {
        let engine = engine();
        let inputs = vec![
            input("the capital of france is paris, a major european city", 6),
            input("paris is the capital of france, the major european city", 6),
            input("france has its capital at paris, major european city", 6),
        ];
        let result = engine
            .apply("capital of France?", &inputs, 3, &tenant(), &CancelToken::new())
            .await
            .unwrap();
        assert!((result.consensus_strength - 1.0).abs() < f64::EPSILON);
        assert!(result.confidence_score > 0.0 && result.confidence_score <= 1.0);
        assert_eq!(result.final_output, "Synthesized final answer.");
    }

    #[tokio::test]
    async fn test_dissent_recorded_and_strength_partial() {
        let engine = engine();
        let inputs = vec![
            input("the answer is definitely alpha because of reasons one two three", 6),
            input("the answer is definitely alpha because of reasons one two four", 6),
            input("zygomorphic petunias bloom nocturnally under crimson moonlight skies", 6),
        ];
        let result = engine
            .apply("what is it?", &inputs, 3, &tenant(), &CancelToken::new())
            .await
            .unwrap();
        assert!(result.consensus_strength < 1.0);
        assert!(result.consensus_strength >= 0.5);
        assert!(!result.conflict_resolutions.is_empty());
    }

    #[tokio::test]
    async fn test_two_layers_skip_synthesis() {
        let engine = engine();
        let inputs = vec![
            input("shared words here about the topic at hand today", 6),
            input("shared words here about the topic at hand tomorrow", 6),
        ];
        let result = engine
            .apply("objective", &inputs, 2, &tenant(), &CancelToken::new())
            .await
            .unwrap();
        // No layer 3: principal representative's text is the artifact.
        assert!(result.final_output.starts_with("shared words"));
    }

    #[tokio::test]
    async fn test_cancel_between_layers() {
        let engine = engine();
        let cancel = CancelToken::new();
        cancel.cancel("client");
        let err = engine
            .apply(
                "objective",
                &[input("a", 5), input("b", 5)],
                3,
                &tenant(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "cancelled");
    }

    #[test]
    fn test_jaccard_bounds() {
        let a = tokenize("alpha beta gamma");
        let b = tokenize("alpha beta delta");
        let sim = jaccard(&a, &b);
        assert!(sim > 0.0 && sim < 1.0);
        assert!((jaccard(&a, &a) - 1.0).abs() < f64::EPSILON);
    }
}
