use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::conversation::{ConversationId, TurnId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered,
    AwaitingConfirmation,
    ActionExecuted,
    ActionCancelled,
    Degraded,
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::ActionExecuted => "action_executed",
            Self::ActionCancelled => "action_cancelled",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "answered" => Some(Self::Answered),
            "awaiting_confirmation" => Some(Self::AwaitingConfirmation),
            "action_executed" => Some(Self::ActionExecuted),
            "action_cancelled" => Some(Self::ActionCancelled),
            "degraded" => Some(Self::Degraded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per turn, successes and failures alike.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub turn_id: TurnId,
    pub conversation_id: ConversationId,
    pub variant_id: Option<String>,
    pub model: String,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    pub cost_usd: Decimal,
    pub outcome: TurnOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// USD per 1k tokens for one model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_1k: Decimal,
    pub completion_per_1k: Decimal,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self { prompt_per_1k: Decimal::ZERO, completion_per_1k: Decimal::ZERO }
    }
}

/// Composes the per-turn metrics row and prices token usage. Models
/// without an explicit price entry cost out at the default rate.
#[derive(Clone, Debug, Default)]
pub struct MetricsTracker {
    pricing: BTreeMap<String, ModelPricing>,
    default_pricing: ModelPricing,
}

impl MetricsTracker {
    pub fn new(pricing: BTreeMap<String, ModelPricing>, default_pricing: ModelPricing) -> Self {
        Self { pricing, default_pricing }
    }

    pub fn cost_usd(&self, model: &str, usage: &TokenUsage) -> Decimal {
        let pricing = self.pricing.get(model).unwrap_or(&self.default_pricing);
        let thousand = Decimal::from(1_000);
        Decimal::from(usage.prompt_tokens) * pricing.prompt_per_1k / thousand
            + Decimal::from(usage.completion_tokens) * pricing.completion_per_1k / thousand
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &self,
        turn_id: TurnId,
        conversation_id: ConversationId,
        variant_id: Option<String>,
        model: &str,
        latency_ms: u64,
        usage: TokenUsage,
        outcome: TurnOutcome,
        recorded_at: DateTime<Utc>,
    ) -> TurnMetrics {
        TurnMetrics {
            turn_id,
            conversation_id,
            variant_id,
            model: model.to_owned(),
            latency_ms,
            usage,
            cost_usd: self.cost_usd(model, &usage),
            outcome,
            recorded_at,
        }
    }
}
