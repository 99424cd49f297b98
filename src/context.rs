//! Token-budget fitting for message lists.
//!
//! Evicts the oldest non-system messages until the conversation fits the
//! input budget, middle-truncating the message that straddles the boundary
//! instead of dropping it whole. System messages and the final user message
//! are never evicted; if the final user message alone exceeds the budget the
//! request proceeds fail-open and the overflow is reported.

use crate::tokens::TokenCounter;
use crate::types::{ChatMessage, Role};

/// Budget options for one fitting pass.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub max_input_tokens: u64,
    pub reserved_for_output: u64,
    pub preserve_system: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_input_tokens: 8_192,
            reserved_for_output: 1_024,
            preserve_system: true,
        }
    }
}

/// Result of a fitting pass. Input messages are never mutated in place.
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub messages: Vec<ChatMessage>,
    /// Tokens removed by eviction and truncation.
    pub evicted_tokens: u64,
    /// The protected tail alone exceeds the budget; the request proceeds
    /// anyway with the overflow reported here.
    pub overflow: bool,
}

impl TrimOutcome {
    pub fn trimmed(&self) -> bool {
        self.evicted_tokens > 0
    }
}

/// Truncated messages keep this fraction of their character budget as head
/// and again as tail, joined by an ellipsis marker.
const TRUNCATE_HEAD_FRACTION: f64 = 0.4;
const TRUNCATE_TAIL_FRACTION: f64 = 0.4;
const TRUNCATE_MARKER: &str = " … ";

/// A truncation target below this many tokens is not worth keeping.
const MIN_TRUNCATED_TOKENS: u64 = 16;

/// Fits message lists to an input token budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextManager {
    counter: TokenCounter,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            counter: TokenCounter::new(),
        }
    }

    /// Fit `messages` to the budget. Returns a new list plus the number of
    /// tokens removed.
    pub fn fit_to_budget(&self, messages: &[ChatMessage], options: &ContextOptions) -> TrimOutcome {
        let budget = options
            .max_input_tokens
            .saturating_sub(options.reserved_for_output);

        let counts: Vec<u64> = messages.iter().map(|m| self.counter.count_message(m)).collect();
        let original_total: u64 = counts.iter().sum();

        if original_total <= budget {
            return TrimOutcome {
                messages: messages.to_vec(),
                evicted_tokens: 0,
                overflow: false,
            };
        }

        let last_user_idx = messages
            .iter()
            .rposition(|m| m.role == Role::User);

        let protected = |idx: usize| -> bool {
            (options.preserve_system && messages[idx].role == Role::System)
                || Some(idx) == last_user_idx
        };

        let mut kept: Vec<Option<ChatMessage>> = messages.iter().cloned().map(Some).collect();
        let mut total = original_total;

        for idx in 0..messages.len() {
            if total <= budget {
                break;
            }
            if protected(idx) {
                continue;
            }

            let count = counts[idx];
            if total - count >= budget || count <= MIN_TRUNCATED_TOKENS {
                // Whole-message eviction still leaves us over budget (or
                // the remainder would be too small to matter): drop it.
                kept[idx] = None;
                total -= count;
            } else {
                // This message straddles the boundary: keep a head and a
                // tail and cut the middle.
                let target = count - (total - budget);
                if target < MIN_TRUNCATED_TOKENS {
                    kept[idx] = None;
                    total -= count;
                } else {
                    let truncated = self.truncate_middle(&messages[idx], target);
                    let new_count = self.counter.count_message(&truncated);
                    total = total - count + new_count;
                    kept[idx] = Some(truncated);
                }
            }
        }

        let overflow = total > budget;
        let result: Vec<ChatMessage> = kept.into_iter().flatten().collect();

        TrimOutcome {
            messages: result,
            evicted_tokens: original_total.saturating_sub(total),
            overflow,
        }
    }

    /// Cut the middle out of a message so it lands near `target_tokens`.
    fn truncate_middle(&self, message: &ChatMessage, target_tokens: u64) -> ChatMessage {
        let chars: Vec<char> = message.text.chars().collect();
        let char_budget = (target_tokens as usize).saturating_mul(4);
        if chars.len() <= char_budget {
            return message.clone();
        }

        let head_len = (char_budget as f64 * TRUNCATE_HEAD_FRACTION) as usize;
        let tail_len = (char_budget as f64 * TRUNCATE_TAIL_FRACTION) as usize;

        let head: String = chars[..head_len.min(chars.len())].iter().collect();
        let tail: String = chars[chars.len().saturating_sub(tail_len)..].iter().collect();

        ChatMessage {
            role: message.role,
            text: format!("{}{}{}", head.trim_end(), TRUNCATE_MARKER, tail.trim_start()),
        }
    }
}
