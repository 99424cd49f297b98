//! Model pricing table and exact-token cost math.
//!
//! Pricing is a static table loaded at construction and never mutated at
//! runtime. The [`CostEstimator`] is the only place dollar amounts are
//! computed; every subsystem that reports savings goes through it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// LLM provider a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingProvider {
    OpenAi,
    Anthropic,
    Google,
    Other,
}

impl std::fmt::Display for PricingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Google => write!(f, "google"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Model tier for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Most capable, highest cost.
    Flagship = 0,
    /// Balanced capability and cost.
    Balanced = 1,
    /// Fast and cheap.
    Fast = 2,
}

/// Pricing and sizing for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier (e.g. "gpt-4o-mini").
    pub id: String,
    pub provider: PricingProvider,
    pub tier: ModelTier,
    /// Input cost per million tokens (USD).
    pub input_per_m: f64,
    /// Output cost per million tokens (USD).
    pub output_per_m: f64,
    /// Discounted rate for provider-cached input tokens, where offered.
    pub cached_input_per_m: Option<f64>,
    /// Maximum context window (tokens).
    pub context_window: u32,
}

impl ModelPricing {
    /// Dollar cost for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = (input_tokens as f64 / 1_000_000.0) * self.input_per_m;
        let output = (output_tokens as f64 / 1_000_000.0) * self.output_per_m;
        input + output
    }

    /// Dollars saved when `tokens` input tokens hit the provider's prefix
    /// cache instead of being billed at the full input rate.
    pub fn cached_input_saving(&self, tokens: u64) -> f64 {
        match self.cached_input_per_m {
            Some(cached) => {
                (tokens as f64 / 1_000_000.0) * (self.input_per_m - cached).max(0.0)
            }
            None => 0.0,
        }
    }
}

/// Well-known models.
impl ModelPricing {
    pub fn gpt_4o() -> Self {
        Self {
            id: "gpt-4o".to_string(),
            provider: PricingProvider::OpenAi,
            tier: ModelTier::Balanced,
            input_per_m: 2.5,
            output_per_m: 10.0,
            cached_input_per_m: Some(1.25),
            context_window: 128_000,
        }
    }

    pub fn gpt_4o_mini() -> Self {
        Self {
            id: "gpt-4o-mini".to_string(),
            provider: PricingProvider::OpenAi,
            tier: ModelTier::Fast,
            input_per_m: 0.15,
            output_per_m: 0.60,
            cached_input_per_m: Some(0.075),
            context_window: 128_000,
        }
    }

    pub fn claude_opus() -> Self {
        Self {
            id: "claude-3-opus-20240229".to_string(),
            provider: PricingProvider::Anthropic,
            tier: ModelTier::Flagship,
            input_per_m: 15.0,
            output_per_m: 75.0,
            cached_input_per_m: Some(1.5),
            context_window: 200_000,
        }
    }

    pub fn claude_sonnet() -> Self {
        Self {
            id: "claude-3-5-sonnet-20241022".to_string(),
            provider: PricingProvider::Anthropic,
            tier: ModelTier::Balanced,
            input_per_m: 3.0,
            output_per_m: 15.0,
            cached_input_per_m: Some(0.3),
            context_window: 200_000,
        }
    }

    pub fn claude_haiku() -> Self {
        Self {
            id: "claude-3-5-haiku-20241022".to_string(),
            provider: PricingProvider::Anthropic,
            tier: ModelTier::Fast,
            input_per_m: 0.8,
            output_per_m: 4.0,
            cached_input_per_m: Some(0.08),
            context_window: 200_000,
        }
    }

    pub fn gemini_flash() -> Self {
        Self {
            id: "gemini-2.0-flash".to_string(),
            provider: PricingProvider::Google,
            tier: ModelTier::Fast,
            input_per_m: 0.075,
            output_per_m: 0.30,
            cached_input_per_m: Some(0.01875),
            context_window: 1_000_000,
        }
    }

    pub fn gemini_pro() -> Self {
        Self {
            id: "gemini-1.5-pro".to_string(),
            provider: PricingProvider::Google,
            tier: ModelTier::Balanced,
            input_per_m: 1.25,
            output_per_m: 5.0,
            cached_input_per_m: Some(0.3125),
            context_window: 2_000_000,
        }
    }
}

/// Static lookup table of model pricing.
#[derive(Debug, Clone)]
pub struct PricingRegistry {
    models: HashMap<String, ModelPricing>,
}

impl PricingRegistry {
    /// Registry preloaded with the well-known models.
    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        for m in [
            ModelPricing::gpt_4o(),
            ModelPricing::gpt_4o_mini(),
            ModelPricing::claude_opus(),
            ModelPricing::claude_sonnet(),
            ModelPricing::claude_haiku(),
            ModelPricing::gemini_flash(),
            ModelPricing::gemini_pro(),
        ] {
            models.insert(m.id.clone(), m);
        }
        Self { models }
    }

    /// Empty registry for fully custom tables.
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Add or replace a model's pricing. Intended for init-time use only.
    pub fn with_model(mut self, pricing: ModelPricing) -> Self {
        self.models.insert(pricing.id.clone(), pricing);
        self
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelPricing> {
        self.models.get(model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelPricing> {
        self.models.values()
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Exact-token cost math over a [`PricingRegistry`].
#[derive(Debug, Clone)]
pub struct CostEstimator {
    registry: Arc<PricingRegistry>,
}

impl CostEstimator {
    pub fn new(registry: Arc<PricingRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PricingRegistry {
        &self.registry
    }

    /// Dollar cost for a completed call. Fails on unknown models.
    pub fn cost(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> Result<f64> {
        self.registry
            .get(model_id)
            .map(|p| p.cost(input_tokens, output_tokens))
            .ok_or_else(|| Error::UnknownModel(model_id.to_string()))
    }

    /// Like [`Self::cost`] but degrades to zero on unknown models, which
    /// keeps telemetry paths from rejecting user requests.
    pub fn safe_cost(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.cost(model_id, input_tokens, output_tokens) {
            Ok(cost) => cost,
            Err(_) => {
                tracing::warn!(model = model_id, "cost lookup miss, treating as $0");
                0.0
            }
        }
    }

    /// Pricing record for a model, if known.
    pub fn pricing(&self, model_id: &str) -> Option<&ModelPricing> {
        self.registry.get(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_calculation() {
        let sonnet = ModelPricing::claude_sonnet();
        // 1M input + 500k output: 1M * $3/M + 0.5M * $15/M = $10.5
        let cost = sonnet.cost(1_000_000, 500_000);
        assert!((cost - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_cached_input_saving() {
        let gpt = ModelPricing::gpt_4o();
        // 1M cached tokens save $2.5 - $1.25 = $1.25
        let saving = gpt.cached_input_saving(1_000_000);
        assert!((saving - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_cached_input_saving_without_discount() {
        let mut pricing = ModelPricing::gpt_4o();
        pricing.cached_input_per_m = None;
        assert_eq!(pricing.cached_input_saving(1_000_000), 0.0);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PricingRegistry::builtin();
        assert!(registry.contains("gpt-4o-mini"));
        assert!(!registry.contains("nonexistent-model"));
    }

    #[test]
    fn test_registry_custom_model() {
        let registry = PricingRegistry::empty().with_model(ModelPricing {
            id: "local-llama".to_string(),
            provider: PricingProvider::Other,
            tier: ModelTier::Fast,
            input_per_m: 0.0,
            output_per_m: 0.0,
            cached_input_per_m: None,
            context_window: 8192,
        });
        assert!(registry.contains("local-llama"));
    }

    #[test]
    fn test_estimator_unknown_model_errors() {
        let estimator = CostEstimator::new(Arc::new(PricingRegistry::builtin()));
        assert!(matches!(
            estimator.cost("made-up", 10, 10),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn test_safe_cost_falls_back_to_zero() {
        let estimator = CostEstimator::new(Arc::new(PricingRegistry::builtin()));
        assert_eq!(estimator.safe_cost("made-up", 10, 10), 0.0);
        assert!(estimator.safe_cost("gpt-4o", 1_000_000, 0) > 0.0);
    }

    #[test]
    fn test_zero_tokens_cost_zero() {
        let estimator = CostEstimator::new(Arc::new(PricingRegistry::builtin()));
        assert_eq!(estimator.safe_cost("gpt-4o", 0, 0), 0.0);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(ModelTier::Flagship < ModelTier::Balanced);
        assert!(ModelTier::Balanced < ModelTier::Fast);
    }
}
