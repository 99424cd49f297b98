//! Complexity-based model down-tiering.
//!
//! A complexity score in [0, 100] is computed from message length,
//! vocabulary diversity, and the presence of code or structured-data
//! markers. The router picks the cheapest configured tier able to handle
//! the score without ever selecting something pricier than the host asked
//! for; savings are the estimated-cost difference, clamped at zero.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::pricing::CostEstimator;
use crate::tokens::TokenCounter;
use crate::types::ChatMessage;

/// One routing tier: a model and the highest complexity it should serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterTier {
    pub model_id: String,
    pub max_complexity: u8,
}

impl RouterTier {
    pub fn new(model_id: impl Into<String>, max_complexity: u8) -> Self {
        Self {
            model_id: model_id.into(),
            max_complexity,
        }
    }
}

/// Router configuration: tiers ordered cheapest-first.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub tiers: Vec<RouterTier>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                RouterTier::new("gpt-4o-mini", 35),
                RouterTier::new("claude-3-5-haiku-20241022", 50),
                RouterTier::new("gpt-4o", 75),
                RouterTier::new("claude-3-5-sonnet-20241022", 100),
            ],
        }
    }
}

/// Outcome of a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    /// The model the request should go out on.
    pub model: String,
    pub original_model: String,
    /// Estimated dollars avoided by the switch, never negative.
    pub saved_dollars: f64,
    pub complexity: u8,
}

impl RouteDecision {
    pub fn downgraded(&self) -> bool {
        self.model != self.original_model
    }
}

struct ComplexityPatterns {
    code: Regex,
    structured: Regex,
}

impl ComplexityPatterns {
    fn get() -> &'static Self {
        static PATTERNS: OnceLock<ComplexityPatterns> = OnceLock::new();
        PATTERNS.get_or_init(|| Self {
            code: Regex::new(
                r#"(?xm)
                ```|\bfn\s|\bdef\s|\bclass\s|\bimpl\s|\breturn\b|
                \bimport\s|\#include|=>|::|;\s*$|\{\s*$|
                \bSELECT\b|\bINSERT\b|\bWHERE\b
                "#,
            )
            .unwrap(),
            structured: Regex::new(
                r#"(?xm)
                \{"|":\s|</?\w+>|---\n|^\s*-\s+\w+:|\|\s*\w+\s*\|
                "#,
            )
            .unwrap(),
        })
    }
}

/// Scores conversation complexity in [0, 100].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityScorer {
    counter: TokenCounter,
}

/// Weight caps per signal; they sum to 100.
const LENGTH_CAP: f64 = 30.0;
const DIVERSITY_CAP: f64 = 25.0;
const CODE_WEIGHT: f64 = 25.0;
const STRUCTURED_WEIGHT: f64 = 20.0;

/// Token count at which the length signal saturates.
const LENGTH_SATURATION_TOKENS: f64 = 3_000.0;

impl ComplexityScorer {
    pub fn new() -> Self {
        Self {
            counter: TokenCounter::new(),
        }
    }

    /// Score the whole conversation.
    pub fn score(&self, messages: &[ChatMessage]) -> u8 {
        let text: String = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.score_text(&text)
    }

    pub fn score_text(&self, text: &str) -> u8 {
        if text.trim().is_empty() {
            return 0;
        }

        let tokens = self.counter.count(text) as f64;
        let length = (tokens / LENGTH_SATURATION_TOKENS).min(1.0) * LENGTH_CAP;

        let words = self.counter.words(text);
        let diversity = if words.is_empty() {
            0.0
        } else {
            let unique: std::collections::HashSet<&String> = words.iter().collect();
            (unique.len() as f64 / words.len() as f64) * DIVERSITY_CAP
        };

        let patterns = ComplexityPatterns::get();
        let code = if patterns.code.is_match(text) {
            CODE_WEIGHT
        } else {
            0.0
        };
        let structured = if patterns.structured.is_match(text) {
            STRUCTURED_WEIGHT
        } else {
            0.0
        };

        (length + diversity + code + structured).round().min(100.0) as u8
    }
}

/// Picks the cheapest adequate tier for each request.
pub struct ModelRouter {
    config: RouterConfig,
    scorer: ComplexityScorer,
    counter: TokenCounter,
    estimator: CostEstimator,
}

/// Output estimate used when comparing tier prices.
const ROUTE_EXPECTED_OUTPUT_TOKENS: u64 = 256;

impl ModelRouter {
    pub fn new(config: RouterConfig, estimator: CostEstimator) -> Self {
        Self {
            config,
            scorer: ComplexityScorer::new(),
            counter: TokenCounter::new(),
            estimator,
        }
    }

    /// Route a conversation. Unknown requested models pass through
    /// untouched; the router never selects something more expensive than
    /// what was asked for.
    pub fn route(&self, messages: &[ChatMessage], requested_model: &str) -> RouteDecision {
        let complexity = self.scorer.score(messages);
        let pass_through = |complexity| RouteDecision {
            model: requested_model.to_string(),
            original_model: requested_model.to_string(),
            saved_dollars: 0.0,
            complexity,
        };

        let Some(requested_pricing) = self.estimator.pricing(requested_model) else {
            return pass_through(complexity);
        };

        let input_tokens = self.counter.count_messages(messages);
        let requested_cost =
            requested_pricing.cost(input_tokens, ROUTE_EXPECTED_OUTPUT_TOKENS);

        let best = self
            .config
            .tiers
            .iter()
            .filter(|tier| tier.max_complexity as u64 >= complexity as u64)
            .filter_map(|tier| {
                let pricing = self.estimator.pricing(&tier.model_id)?;
                let cost = pricing.cost(input_tokens, ROUTE_EXPECTED_OUTPUT_TOKENS);
                (cost <= requested_cost).then_some((tier, cost))
            })
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((tier, cost)) => RouteDecision {
                model: tier.model_id.clone(),
                original_model: requested_model.to_string(),
                saved_dollars: (requested_cost - cost).max(0.0),
                complexity,
            },
            None => pass_through(complexity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingRegistry;
    use std::sync::Arc;

    fn router() -> ModelRouter {
        ModelRouter::new(
            RouterConfig::default(),
            CostEstimator::new(Arc::new(PricingRegistry::builtin())),
        )
    }

    #[test]
    fn test_score_empty_is_zero() {
        let scorer = ComplexityScorer::new();
        assert_eq!(scorer.score_text(""), 0);
        assert_eq!(scorer.score_text("   "), 0);
    }

    #[test]
    fn test_score_detects_code() {
        let scorer = ComplexityScorer::new();
        let plain = scorer.score_text("tell me a short story about a dog");
        let code = scorer.score_text("fn main() { println!(\"hello\"); }");
        assert!(code > plain);
    }

    #[test]
    fn test_score_detects_structured_data() {
        let scorer = ComplexityScorer::new();
        let plain = scorer.score_text("hello there friend");
        let json = scorer.score_text("parse this {\"key\": \"value\", \"n\": 2}");
        assert!(json > plain);
    }

    #[test]
    fn test_score_grows_with_length() {
        let scorer = ComplexityScorer::new();
        let short = scorer.score_text("repeat repeat repeat");
        let long_text = "repeat ".repeat(3000);
        let long = scorer.score_text(&long_text);
        assert!(long > short);
    }

    #[test]
    fn test_score_bounded() {
        let scorer = ComplexityScorer::new();
        let dense = format!(
            "fn main() {{ {} }} {{\"k\": 1}}",
            "many different unique tokens follow alpha beta gamma delta ".repeat(500)
        );
        assert!(scorer.score_text(&dense) <= 100);
    }

    #[test]
    fn test_simple_prompt_downgrades() {
        let router = router();
        let messages = vec![ChatMessage::user("hi there")];
        let decision = router.route(&messages, "claude-3-5-sonnet-20241022");
        assert!(decision.downgraded());
        assert!(decision.saved_dollars > 0.0);
        assert_eq!(decision.original_model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn test_complex_prompt_keeps_capable_tier() {
        let router = router();
        // Long, vocabulary-dense code with structured data: every signal fires.
        let body: String = (0..600)
            .map(|i| format!("fn handler{i}(input{i}: u64) -> u64 {{ input{i}.wrapping_mul({i}); }}\n"))
            .collect();
        let code = format!("review this module:\n```rust\n{body}```\nconfig: {{\"retries\": 3}}");
        let messages = vec![ChatMessage::user(code)];
        let decision = router.route(&messages, "claude-3-5-sonnet-20241022");
        // High complexity: only the top tier qualifies.
        assert!(decision.complexity > 75, "complexity {}", decision.complexity);
        assert_eq!(decision.model, "claude-3-5-sonnet-20241022");
        assert_eq!(decision.saved_dollars, 0.0);
    }

    #[test]
    fn test_never_upgrades_price() {
        let router = router();
        let messages = vec![ChatMessage::user("hi there")];
        // Requested model is already the cheapest tier.
        let decision = router.route(&messages, "gpt-4o-mini");
        assert_eq!(decision.model, "gpt-4o-mini");
        assert_eq!(decision.saved_dollars, 0.0);
    }

    #[test]
    fn test_unknown_model_passes_through() {
        let router = router();
        let messages = vec![ChatMessage::user("hi there")];
        let decision = router.route(&messages, "in-house-model");
        assert_eq!(decision.model, "in-house-model");
        assert!(!decision.downgraded());
    }

    #[test]
    fn test_savings_never_negative() {
        let router = router();
        for prompt in ["hi", "explain lifetimes", "fn f() {}"] {
            let decision = router.route(&[ChatMessage::user(prompt)], "gpt-4o");
            assert!(decision.saved_dollars >= 0.0);
        }
    }
}
