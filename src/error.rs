//! Error types for tokenshield.

use thiserror::Error;

use crate::breaker::BreakerWindowKind;
use crate::budget::BudgetWindow;

/// Result type alias using tokenshield's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while shielding a request.
///
/// Config, guard-block, budget-block, breaker-trip, and provider errors are
/// user-facing and propagate to the host. Persistence and telemetry failures
/// are contained by their owning subsystem and surfaced as `storage:error`
/// events instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, raised at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected by the request guard.
    #[error("Request blocked by guard: {rule}")]
    GuardBlocked {
        /// The first failing rule, e.g. "debounce" or "rate_limit".
        rule: String,
        /// Human-readable detail for the host.
        detail: String,
    },

    /// Request rejected because a user budget window cannot cover it.
    #[error("Budget exceeded for user {user_id} ({window} window)")]
    BudgetBlocked {
        user_id: String,
        window: BudgetWindow,
    },

    /// Request rejected by a tripped circuit breaker window.
    #[error("Circuit breaker tripped ({window} window): ${spent:.4} of ${limit:.4}")]
    BreakerTripped {
        window: BreakerWindowKind,
        spent: f64,
        limit: f64,
    },

    /// Pricing lookup miss.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Rejection from the wrapped `do_generate` / `do_stream` callable.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Storage-layer failure. Never user-visible on the request path.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a guard-block error.
    pub fn guard_blocked(rule: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::GuardBlocked {
            rule: rule.into(),
            detail: detail.into(),
        }
    }

    /// Create a budget-block error.
    pub fn budget_blocked(user_id: impl Into<String>, window: BudgetWindow) -> Self {
        Self::BudgetBlocked {
            user_id: user_id.into(),
            window,
        }
    }

    /// Create a breaker-trip error.
    pub fn breaker_tripped(window: BreakerWindowKind, spent: f64, limit: f64) -> Self {
        Self::BreakerTripped {
            window,
            spent,
            limit,
        }
    }

    /// Create a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// True for errors the host is expected to handle (blocked requests).
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Self::GuardBlocked { .. } | Self::BudgetBlocked { .. } | Self::BreakerTripped { .. }
        )
    }
}
