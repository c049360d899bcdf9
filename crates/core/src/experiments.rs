use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::conversation::ConversationId;

/// Prompt phrasing arm used during generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    #[default]
    Standard,
    CitationForward,
}

impl PromptStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::CitationForward => "citation_forward",
        }
    }
}

/// Generation parameters a variant pins for its conversations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_style: PromptStyle,
    #[serde(default)]
    pub alpha_override: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: u32,
    #[serde(default)]
    pub params: VariantParams,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub id: String,
    pub variants: Vec<Variant>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    pub experiment_id: String,
    pub variant_id: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExperimentError {
    #[error("experiment `{experiment_id}` defines no variants")]
    NoVariants { experiment_id: String },
    #[error("experiment `{experiment_id}` has zero total weight")]
    ZeroTotalWeight { experiment_id: String },
}

/// Deterministic weighted assignment. The same (conversation,
/// experiment) pair always lands in the same variant, so traffic
/// stays pinned without coordination.
#[derive(Clone, Debug)]
pub struct VariantSelector {
    definition: ExperimentDefinition,
}

impl VariantSelector {
    pub fn new(definition: ExperimentDefinition) -> Self {
        Self { definition }
    }

    pub fn experiment_id(&self) -> &str {
        &self.definition.id
    }

    pub fn assign(
        &self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<ExperimentAssignment, ExperimentError> {
        let variant = self.select(conversation_id)?;
        Ok(ExperimentAssignment {
            experiment_id: self.definition.id.clone(),
            variant_id: variant.id.clone(),
            assigned_at: now,
        })
    }

    pub fn select(&self, conversation_id: &ConversationId) -> Result<&Variant, ExperimentError> {
        if self.definition.variants.is_empty() {
            return Err(ExperimentError::NoVariants {
                experiment_id: self.definition.id.clone(),
            });
        }

        let total: u64 =
            self.definition.variants.iter().map(|variant| u64::from(variant.weight)).sum();
        if total == 0 {
            return Err(ExperimentError::ZeroTotalWeight {
                experiment_id: self.definition.id.clone(),
            });
        }

        let bucket = assignment_hash(conversation_id, &self.definition.id) % total;
        let mut cumulative = 0u64;
        for variant in &self.definition.variants {
            cumulative += u64::from(variant.weight);
            if bucket < cumulative {
                return Ok(variant);
            }
        }

        // Unreachable while total > 0; the last nonzero variant owns
        // the tail range.
        Err(ExperimentError::ZeroTotalWeight { experiment_id: self.definition.id.clone() })
    }

    /// Looks up the pinned parameters for a previously persisted
    /// assignment. `None` when the variant no longer exists in the
    /// definition; callers fall back to defaults while keeping the
    /// recorded variant id.
    pub fn params_for(&self, variant_id: &str) -> Option<&VariantParams> {
        self.definition
            .variants
            .iter()
            .find(|variant| variant.id == variant_id)
            .map(|variant| &variant.params)
    }
}

fn assignment_hash(conversation_id: &ConversationId, experiment_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.0.as_bytes());
    hasher.update(b":");
    hasher.update(experiment_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::conversation::ConversationId;

    use super::{
        ExperimentDefinition, ExperimentError, PromptStyle, Variant, VariantParams,
        VariantSelector,
    };

    fn two_arm_definition(control_weight: u32, treatment_weight: u32) -> ExperimentDefinition {
        ExperimentDefinition {
            id: "prompt-style-2026q3".to_string(),
            variants: vec![
                Variant {
                    id: "control".to_string(),
                    weight: control_weight,
                    params: VariantParams::default(),
                },
                Variant {
                    id: "treatment".to_string(),
                    weight: treatment_weight,
                    params: VariantParams {
                        model: Some("gpt-4o-mini".to_string()),
                        prompt_style: PromptStyle::CitationForward,
                        alpha_override: Some(0.7),
                    },
                },
            ],
        }
    }

    #[test]
    fn assignment_is_deterministic_for_the_same_conversation() {
        let selector = VariantSelector::new(two_arm_definition(1, 1));
        let id = ConversationId("conv-determinism".to_string());

        let first = selector.assign(&id, Utc::now()).expect("assign");
        let second = selector.assign(&id, Utc::now()).expect("assign");

        assert_eq!(first.variant_id, second.variant_id);
        assert_eq!(first.experiment_id, "prompt-style-2026q3");
    }

    #[test]
    fn assigned_variant_is_always_a_configured_one() {
        let selector = VariantSelector::new(two_arm_definition(3, 7));
        for n in 0..64 {
            let id = ConversationId(format!("conv-{n}"));
            let assignment = selector.assign(&id, Utc::now()).expect("assign");
            assert!(["control", "treatment"].contains(&assignment.variant_id.as_str()));
        }
    }

    #[test]
    fn zero_weight_variant_is_never_selected() {
        let selector = VariantSelector::new(two_arm_definition(0, 5));
        for n in 0..64 {
            let id = ConversationId(format!("conv-{n}"));
            let assignment = selector.assign(&id, Utc::now()).expect("assign");
            assert_eq!(assignment.variant_id, "treatment");
        }
    }

    #[test]
    fn even_weights_spread_across_both_arms() {
        let selector = VariantSelector::new(two_arm_definition(1, 1));
        let mut control = 0usize;
        let mut treatment = 0usize;

        for n in 0..256 {
            let id = ConversationId(format!("conv-{n}"));
            match selector.assign(&id, Utc::now()).expect("assign").variant_id.as_str() {
                "control" => control += 1,
                _ => treatment += 1,
            }
        }

        assert!(control > 0, "control arm should receive traffic");
        assert!(treatment > 0, "treatment arm should receive traffic");
    }

    #[test]
    fn zero_total_weight_is_rejected() {
        let selector = VariantSelector::new(two_arm_definition(0, 0));
        let error = selector
            .assign(&ConversationId("conv-1".to_string()), Utc::now())
            .expect_err("zero weight must fail");
        assert!(matches!(error, ExperimentError::ZeroTotalWeight { .. }));
    }

    #[test]
    fn params_lookup_handles_removed_variants() {
        let selector = VariantSelector::new(two_arm_definition(1, 1));
        assert!(selector.params_for("treatment").is_some());
        assert!(selector.params_for("retired-arm").is_none());
    }
}
