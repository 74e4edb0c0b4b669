//! Consensus domain model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One arbitrated conflict, recorded in the resolution trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// What the agents disagreed about.
    pub topic: String,
    /// Agents on each side of the disagreement.
    pub dissenting_agents: Vec<Uuid>,
    /// The arbiter's ruling.
    pub resolution: String,
    /// Model consulted to arbitrate.
    pub arbiter_model: String,
}

/// Output of the consensus engine. Strength and confidence are in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub final_output: String,
    /// Fraction of agents whose principal claim matches the final artifact.
    pub consensus_strength: f64,
    /// Weighted belief in the final answer.
    pub confidence_score: f64,
    #[serde(default)]
    pub conflict_resolutions: Vec<ConflictResolution>,
    /// Uncertainties surfaced by any layer, carried forward.
    #[serde(default)]
    pub uncertainties: Vec<String>,
}

impl ConsensusResult {
    /// Pass-through result for a single-agent cohort or zero layers.
    pub fn pass_through(output: impl Into<String>) -> Self {
        Self {
            final_output: output.into(),
            consensus_strength: 1.0,
            confidence_score: 1.0,
            conflict_resolutions: Vec::new(),
            uncertainties: Vec::new(),
        }
    }

    /// Clamp strength and confidence into [0, 1].
    pub fn clamped(mut self) -> Self {
        self.consensus_strength = self.consensus_strength.clamp(0.0, 1.0);
        self.confidence_score = self.confidence_score.clamp(0.0, 1.0);
        self
    }
}

/// Scoring weights applied when clustering agent outputs. After
/// normalization the components sum to 1 within ±0.01.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight of semantic overlap between outputs.
    pub semantic_overlap: f64,
    /// Weight of explicit shared sub-claim agreement.
    pub shared_claims: f64,
    /// Weight of the agent's declared priority.
    pub agent_priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            semantic_overlap: 0.5,
            shared_claims: 0.3,
            agent_priority: 0.2,
        }
    }
}

impl ScoringWeights {
    /// Normalize so the components sum to 1. Degenerate all-zero weights
    /// fall back to the defaults.
    pub fn normalized(self) -> Self {
        let sum = self.semantic_overlap + self.shared_claims + self.agent_priority;
        if sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            semantic_overlap: self.semantic_overlap / sum,
            shared_claims: self.shared_claims / sum,
            agent_priority: self.agent_priority / sum,
        }
    }

    pub fn sum(&self) -> f64 {
        self.semantic_overlap + self.shared_claims + self.agent_priority
    }
}
