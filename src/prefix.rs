//! Prefix normalization for provider-side prompt-cache affinity.
//!
//! Providers discount repeated prompt prefixes. The optimizer moves the
//! stable part of the conversation (system block, standing instructions)
//! ahead of the volatile user turn so consecutive requests share the
//! longest possible prefix. Token counts are unchanged; the reported
//! savings estimate applies the provider's documented cached-input
//! discount to the stable prefix, once the prefix is long enough for the
//! provider to cache at all.

use serde::{Deserialize, Serialize};

use crate::pricing::{CostEstimator, PricingProvider};
use crate::tokens::TokenCounter;
use crate::types::{ChatMessage, Role};

/// Which provider's prefix-cache contract to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixProvider {
    OpenAi,
    Anthropic,
    Google,
    /// Derive the contract from the model's pricing entry.
    Auto,
}

/// Prefix optimizer configuration.
#[derive(Debug, Clone)]
pub struct PrefixConfig {
    pub provider: PrefixProvider,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            provider: PrefixProvider::Auto,
        }
    }
}

/// Result of a prefix pass. Input messages are never mutated in place.
#[derive(Debug, Clone)]
pub struct PrefixOutcome {
    pub messages: Vec<ChatMessage>,
    /// Estimated dollars saved on the next repeat of this prefix.
    pub saved_dollars: f64,
    /// Whether message order actually changed.
    pub reordered: bool,
}

/// Reorders conversations for maximum provider-cache reuse.
pub struct PrefixOptimizer {
    config: PrefixConfig,
    counter: TokenCounter,
    estimator: CostEstimator,
}

impl PrefixOptimizer {
    pub fn new(config: PrefixConfig, estimator: CostEstimator) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
            estimator,
        }
    }

    /// Stabilize the prefix: system messages first in their original
    /// order, everything else after in its original order.
    pub fn optimize(&self, messages: &[ChatMessage], model_id: &str) -> PrefixOutcome {
        let mut system: Vec<ChatMessage> = Vec::new();
        let mut rest: Vec<ChatMessage> = Vec::new();
        for message in messages {
            if message.role == Role::System {
                system.push(message.clone());
            } else {
                rest.push(message.clone());
            }
        }

        let prefix_tokens: u64 = system.iter().map(|m| self.counter.count_message(m)).sum();

        let mut result = system;
        result.extend(rest);
        let reordered = result != messages;

        let saved_dollars = self.estimate_saving(model_id, prefix_tokens);

        PrefixOutcome {
            messages: result,
            saved_dollars,
            reordered,
        }
    }

    /// Cached-input discount on the stable prefix, zero when the prefix is
    /// below the provider's caching floor or the model has no discount.
    fn estimate_saving(&self, model_id: &str, prefix_tokens: u64) -> f64 {
        let Some(pricing) = self.estimator.pricing(model_id) else {
            return 0.0;
        };

        let provider = match self.config.provider {
            PrefixProvider::Auto => pricing.provider,
            PrefixProvider::OpenAi => PricingProvider::OpenAi,
            PrefixProvider::Anthropic => PricingProvider::Anthropic,
            PrefixProvider::Google => PricingProvider::Google,
        };

        if prefix_tokens < Self::min_cacheable_tokens(provider) {
            return 0.0;
        }
        pricing.cached_input_saving(prefix_tokens)
    }

    /// Documented minimum prefix sizes for server-side caching.
    fn min_cacheable_tokens(provider: PricingProvider) -> u64 {
        match provider {
            PricingProvider::OpenAi => 1024,
            PricingProvider::Anthropic => 1024,
            PricingProvider::Google => 4096,
            PricingProvider::Other => u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingRegistry;
    use std::sync::Arc;

    fn optimizer(provider: PrefixProvider) -> PrefixOptimizer {
        PrefixOptimizer::new(
            PrefixConfig { provider },
            CostEstimator::new(Arc::new(PricingRegistry::builtin())),
        )
    }

    fn long_system() -> ChatMessage {
        // ~1500 tokens: above the 1024 openai/anthropic floor, below 4096.
        ChatMessage::system(vec!["rule"; 1500].join(" "))
    }

    #[test]
    fn test_system_moves_to_front() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![
            ChatMessage::user("question"),
            ChatMessage::system("be terse"),
        ];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert!(outcome.reordered);
        assert_eq!(outcome.messages[0].role, Role::System);
        assert_eq!(outcome.messages[1].role, Role::User);
    }

    #[test]
    fn test_stable_order_preserved() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::user("q1"),
            ChatMessage::system("second"),
            ChatMessage::assistant("a1"),
        ];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert_eq!(outcome.messages[0].text, "first");
        assert_eq!(outcome.messages[1].text, "second");
        assert_eq!(outcome.messages[2].text, "q1");
        assert_eq!(outcome.messages[3].text, "a1");
    }

    #[test]
    fn test_already_ordered_not_flagged() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![
            ChatMessage::system("stable"),
            ChatMessage::user("volatile"),
        ];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert!(!outcome.reordered);
    }

    #[test]
    fn test_token_counts_unchanged() {
        let opt = optimizer(PrefixProvider::Auto);
        let counter = TokenCounter::new();
        let messages = vec![
            ChatMessage::user("question about things"),
            ChatMessage::system("be terse and helpful"),
        ];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert_eq!(
            counter.count_messages(&messages),
            counter.count_messages(&outcome.messages)
        );
    }

    #[test]
    fn test_long_prefix_earns_savings() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![long_system(), ChatMessage::user("q")];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert!(outcome.saved_dollars > 0.0);
    }

    #[test]
    fn test_short_prefix_earns_nothing() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![ChatMessage::system("terse"), ChatMessage::user("q")];
        let outcome = opt.optimize(&messages, "gpt-4o");
        assert_eq!(outcome.saved_dollars, 0.0);
    }

    #[test]
    fn test_unknown_model_earns_nothing() {
        let opt = optimizer(PrefixProvider::Auto);
        let messages = vec![long_system(), ChatMessage::user("q")];
        let outcome = opt.optimize(&messages, "own-model");
        assert_eq!(outcome.saved_dollars, 0.0);
    }

    #[test]
    fn test_google_floor_is_higher() {
        let messages = vec![long_system(), ChatMessage::user("q")];
        // ~1500 tokens clears the 1024 floor but not Google's 4096.
        let auto = optimizer(PrefixProvider::Auto).optimize(&messages, "gpt-4o");
        let google = optimizer(PrefixProvider::Google).optimize(&messages, "gpt-4o");
        assert!(auto.saved_dollars > 0.0);
        assert_eq!(google.saved_dollars, 0.0);
    }
}
