//! Request, response, and message types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            text: text.into(),
        }
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Abort,
    Error,
}

/// Token usage reported for a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// What the host's `do_generate` callable receives: the transformed request
/// with the engine's scratchpad stripped off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Result of a single-shot generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl GenerateResult {
    pub fn new(text: impl Into<String>, usage: Usage, finish_reason: FinishReason) -> Self {
        Self {
            text: text.into(),
            usage,
            finish_reason,
        }
    }
}

/// A chunk read from the provider's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Incremental text output.
    TextDelta { text_delta: String },
    /// Provider-authoritative usage, usually the final chunk.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Stream finished with the given reason.
    Finish { finish_reason: FinishReason },
}

/// Aggregate usage reported by the host's `on_usage` callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Dollars actually spent on this request.
    pub cost: f64,
    /// Dollars avoided by shield stages on this request.
    pub saved: f64,
}

/// Synthetic-response payload planted on the scratchpad by a cache hit.
#[derive(Debug, Clone)]
pub(crate) struct CacheHitPayload {
    pub text: String,
    pub match_type: crate::cache::MatchType,
    pub similarity: Option<f64>,
    pub saved_cost: f64,
    pub saved_input_tokens: u64,
    pub saved_output_tokens: u64,
}

/// Per-call scratchpad the pipeline uses to communicate between
/// `transform_params` and `wrap_generate` / `wrap_stream`. Hosts never
/// observe it: the field on [`ShieldParams`] is crate-private.
#[derive(Debug, Default)]
pub(crate) struct ShieldMeta {
    /// Set by the cache stage to short-circuit the model call.
    pub cache_hit: Option<CacheHitPayload>,
    /// Normalized fingerprint of the last user message, shared by stages.
    pub fingerprint: Option<String>,
    /// Last user message text, captured before any trimming.
    pub last_user_text: Option<String>,
    /// Input token count before any rewriting.
    pub original_input_tokens: Option<u64>,
    /// Model the host asked for, before routing.
    pub original_model: Option<String>,
    /// Dollar savings recorded by the router stage.
    pub router_saved: f64,
    /// Dollar savings recorded by the context stage.
    pub context_saved: f64,
    /// Dollar savings recorded by the prefix stage.
    pub prefix_saved: f64,
    /// User the request is billed to, if user budgets are enabled.
    pub user_id: Option<String>,
    /// Inflight reservation taken by the budget stage.
    pub user_budget_inflight: Option<uuid::Uuid>,
    /// When the pipeline first saw this request, for latency accounting.
    pub started_at: Option<Instant>,
    /// Guard admitted this request and expects a completion callback.
    pub guard_started: bool,
    /// A tripped breaker in throttle mode flagged this request for
    /// caller-side delay.
    pub throttled: bool,
    /// This request owns the cache build for its fingerprint.
    pub build_permit: Option<crate::cache::BuildPermit>,
}

/// Parameters flowing through the pipeline. Construct with
/// [`ShieldParams::new`]; the engine's scratchpad rides along privately.
#[derive(Debug)]
pub struct ShieldParams {
    model_id: String,
    messages: Vec<ChatMessage>,
    max_output_tokens: Option<u32>,
    user_id: Option<String>,
    pub(crate) meta: ShieldMeta,
}

impl ShieldParams {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            max_output_tokens: None,
            user_id: None,
            meta: ShieldMeta::default(),
        }
    }

    /// Single-prompt convenience constructor.
    pub fn from_prompt(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(model_id, vec![ChatMessage::user(prompt)])
    }

    /// Bill this request to a user budget.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Cap the expected output length, used for cost estimation and the
    /// context budget reservation.
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn max_output_tokens(&self) -> Option<u32> {
        self.max_output_tokens
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// True when a throttling breaker asked the caller to delay this
    /// request before sending it.
    pub fn throttled(&self) -> bool {
        self.meta.throttled
    }

    /// The request handed to the host's callable: everything but the meta.
    pub fn to_request(&self) -> GenerateRequest {
        GenerateRequest {
            model_id: self.model_id.clone(),
            messages: self.messages.clone(),
            max_output_tokens: self.max_output_tokens,
        }
    }

    pub(crate) fn set_model(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
    }

    pub(crate) fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Text of the most recent user message, if any.
    pub(crate) fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text, "Hello");
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_params_builder() {
        let params = ShieldParams::from_prompt("gpt-4o-mini", "What is 2+2?")
            .with_user("u1")
            .with_max_output_tokens(256);

        assert_eq!(params.model_id(), "gpt-4o-mini");
        assert_eq!(params.messages().len(), 1);
        assert_eq!(params.user_id(), Some("u1"));
        assert_eq!(params.max_output_tokens(), Some(256));
    }

    #[test]
    fn test_last_user_text_skips_assistant_tail() {
        let params = ShieldParams::new(
            "gpt-4o",
            vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
            ],
        );
        assert_eq!(params.last_user_text(), Some("first"));
    }

    #[test]
    fn test_request_strips_meta() {
        let params = ShieldParams::from_prompt("gpt-4o", "hi");
        let request = params.to_request();
        assert_eq!(request.model_id, "gpt-4o");
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_stream_chunk_serde_tags() {
        let chunk = StreamChunk::TextDelta {
            text_delta: "abc".to_string(),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"type\":\"text-delta\""));
    }
}
