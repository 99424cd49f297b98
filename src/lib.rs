//! # tokenshield
//!
//! Client-side middleware that cuts the dollar cost of LLM requests by
//! short-circuiting, rewriting, or down-tiering them before they reach the
//! provider.
//!
//! ## Core Components
//!
//! - **Pipeline**: `transform_params` / `wrap_generate` / `wrap_stream`
//!   around an opaque host callable
//! - **Cache**: fuzzy response cache with at-most-once build per fingerprint
//! - **Guard**: debounce, dedup, rate and cost gating
//! - **Router**: complexity-based model down-tiering
//! - **Ledger & Audit**: per-request cost accounting and a hash-chained,
//!   tamper-evident log
//! - **Breaker & Budgets**: layered spend limits and per-user
//!   reserve/commit/release accounting
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokenshield::{ShieldConfig, ShieldParams, TokenShield};
//!
//! let shield = TokenShield::new(ShieldConfig::default())?;
//! let params = shield
//!     .transform_params(ShieldParams::from_prompt("gpt-4o-mini", "What is 2+2?"))
//!     .await?;
//! let result = shield
//!     .wrap_generate(params, |request| my_provider.generate(request))
//!     .await?;
//! ```

pub mod anomaly;
pub mod audit;
pub mod breaker;
pub mod budget;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod guard;
pub mod health;
pub mod ledger;
pub mod persist;
pub mod pipeline;
pub mod prefix;
pub mod pricing;
pub mod router;
pub mod stream;
pub mod tokens;
pub mod types;

// Re-exports for convenience
pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyKind, AnomalyReport, AnomalySeverity};
pub use audit::{AuditConfig, AuditEntry, AuditLog, AuditSeverity, IntegrityReport};
pub use breaker::{
    BreakerAction, BreakerConfig, BreakerDecision, BreakerLimits, BreakerWindowKind,
    BreakerWindowSnapshot, CircuitBreaker, WindowState,
};
pub use budget::{
    BudgetWindow, UserBudgetConfig, UserBudgetManager, UserBudgetSnapshot, UserBudgetSpec,
};
pub use cache::{
    fingerprint, normalize, CacheConfig, CacheHit, CacheStats, MatchType, MinHashConfig,
    MinHashIndex, ResponseCache,
};
pub use config::{
    BreakerSection, ContextConfig, LedgerSection, ModuleToggles, ShieldCallbacks, ShieldConfig,
    UserBudgetSection,
};
pub use context::{ContextManager, ContextOptions, TrimOutcome};
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, ShieldEvent, SubscriptionId};
pub use guard::{GuardConfig, GuardDecision, GuardReason, GuardStats, RequestGuard};
pub use health::{HealthStatus, ProviderHealth, ProviderHealthTracker};
pub use ledger::{
    CostLedger, LedgerDraft, LedgerEntry, LedgerSummary, ModelSummary, SavingsBreakdown,
};
pub use persist::{DebouncedStore, KvStore, MemoryStore, SqliteStore, SCHEMA_VERSION};
pub use pipeline::TokenShield;
pub use prefix::{PrefixConfig, PrefixOptimizer, PrefixProvider};
pub use pricing::{CostEstimator, ModelPricing, ModelTier, PricingProvider, PricingRegistry};
pub use router::{ComplexityScorer, ModelRouter, RouteDecision, RouterConfig, RouterTier};
pub use stream::{ShieldStream, StreamCallbacks, StreamOutcome, StreamTracker};
pub use tokens::TokenCounter;
pub use types::{
    ChatMessage, FinishReason, GenerateRequest, GenerateResult, Role, ShieldParams, StreamChunk,
    Usage, UsageReport,
};
