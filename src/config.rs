//! Engine configuration, validated at construction.

use std::sync::Arc;

use crate::anomaly::{AnomalyConfig, AnomalyReport};
use crate::breaker::{BreakerAction, BreakerLimits};
use crate::budget::UserBudgetConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::guard::GuardConfig;
use crate::persist::KvStore;
use crate::prefix::PrefixConfig;
use crate::pricing::PricingRegistry;
use crate::router::RouterConfig;
use crate::stream::StreamCallbacks;
use crate::types::UsageReport;

/// Per-stage enable switches. A disabled stage passes requests through
/// untouched.
#[derive(Debug, Clone)]
pub struct ModuleToggles {
    pub guard: bool,
    pub cache: bool,
    pub context: bool,
    pub router: bool,
    pub prefix: bool,
    pub ledger: bool,
}

impl Default for ModuleToggles {
    fn default() -> Self {
        Self {
            guard: true,
            cache: true,
            context: true,
            router: true,
            prefix: true,
            ledger: true,
        }
    }
}

/// Context stage budget.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_input_tokens: u64,
    pub reserve_for_output: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 8_192,
            reserve_for_output: 1_024,
        }
    }
}

/// Ledger section.
#[derive(Debug, Clone, Default)]
pub struct LedgerSection {
    pub persist: bool,
    /// Feature tag stamped on every entry.
    pub feature: Option<String>,
}

/// Breaker section. Present means enabled.
#[derive(Debug, Clone)]
pub struct BreakerSection {
    pub limits: BreakerLimits,
    pub action: BreakerAction,
    pub persist: bool,
}

/// User budget section. Present means enabled.
#[derive(Debug, Clone, Default)]
pub struct UserBudgetSection {
    pub config: UserBudgetConfig,
    pub persist: bool,
}

/// Host callbacks. All optional; each mirrors a bus event.
#[derive(Clone, Default)]
pub struct ShieldCallbacks {
    /// Called once per completed request with the usage report.
    pub on_usage: Option<Arc<dyn Fn(&UsageReport) + Send + Sync>>,
    /// Called for every anomaly the detector flags.
    pub on_anomaly: Option<Arc<dyn Fn(&AnomalyReport) + Send + Sync>>,
    /// Stream-specific callbacks (abort, cost threshold).
    pub stream: StreamCallbacks,
}

/// Full engine configuration.
#[derive(Clone, Default)]
pub struct ShieldConfig {
    pub modules: ModuleToggles,
    pub guard: GuardConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub router: RouterConfig,
    pub prefix: PrefixConfig,
    pub ledger: LedgerSection,
    pub breaker: Option<BreakerSection>,
    pub user_budget: Option<UserBudgetSection>,
    pub anomaly: Option<AnomalyConfig>,
    pub pricing: PricingRegistry,
    /// Backing store for every `persist` flag. Required if any is set.
    pub storage: Option<Arc<dyn KvStore>>,
    pub callbacks: ShieldCallbacks,
}

impl ShieldConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_modules(mut self, modules: ModuleToggles) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_prefix(mut self, prefix: PrefixConfig) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerSection) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSection) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_user_budget(mut self, user_budget: UserBudgetSection) -> Self {
        self.user_budget = Some(user_budget);
        self
    }

    pub fn with_anomaly(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = Some(anomaly);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingRegistry) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn KvStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_on_usage(
        mut self,
        on_usage: impl Fn(&UsageReport) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_usage = Some(Arc::new(on_usage));
        self
    }

    pub fn with_on_anomaly(
        mut self,
        on_anomaly: impl Fn(&AnomalyReport) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_anomaly = Some(Arc::new(on_anomaly));
        self
    }

    pub fn with_stream_callbacks(mut self, stream: StreamCallbacks) -> Self {
        self.callbacks.stream = stream;
        self
    }

    /// Validate option values. Called by the engine constructor.
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(Error::Config(
                "cache.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.context.max_input_tokens <= self.context.reserve_for_output {
            return Err(Error::Config(
                "context.max_input_tokens must exceed reserve_for_output".into(),
            ));
        }
        if self.modules.router && self.router.tiers.is_empty() {
            return Err(Error::Config("router.tiers must not be empty".into()));
        }
        if let Some(breaker) = &self.breaker {
            for (name, limit) in [
                ("per_session", breaker.limits.per_session),
                ("per_hour", breaker.limits.per_hour),
                ("per_day", breaker.limits.per_day),
                ("per_month", breaker.limits.per_month),
            ] {
                if limit.is_some_and(|l| l < 0.0) {
                    return Err(Error::Config(format!(
                        "breaker.limits.{} must not be negative",
                        name
                    )));
                }
            }
        }
        if let Some(budget) = &self.user_budget {
            let specs = budget
                .config
                .users
                .values()
                .chain(std::iter::once(&budget.config.default_budget));
            for spec in specs {
                if spec.daily.is_some_and(|l| l < 0.0)
                    || spec.monthly.is_some_and(|l| l < 0.0)
                {
                    return Err(Error::Config(
                        "userBudget limits must not be negative".into(),
                    ));
                }
            }
        }

        let wants_persistence = self.ledger.persist
            || self.breaker.as_ref().is_some_and(|b| b.persist)
            || self.user_budget.as_ref().is_some_and(|u| u.persist);
        if wants_persistence && self.storage.is_none() {
            return Err(Error::Config(
                "a storage backend is required when any persist flag is set".into(),
            ));
        }
        Ok(())
    }
}
