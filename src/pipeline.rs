//! The request-interception pipeline.
//!
//! `transform_params` runs the stages in fixed order: guard, circuit
//! breaker, user-budget reserve, cache lookup, context trim, router,
//! prefix. A stage may short-circuit with a synthetic reply (cache hit,
//! planted on the scratchpad), reject the request with a typed error
//! (guard, breaker, budget), or rewrite messages and record a savings
//! delta. `wrap_generate` and `wrap_stream` consume the scratchpad, invoke
//! the host's callable, and run post-stage recording: ledger append,
//! reservation commit/release, breaker spend, provider health, anomaly
//! check. Telemetry failures are contained and never abort a request the
//! provider already accepted.

use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::anomaly::AnomalyDetector;
use crate::audit::{AuditConfig, AuditLog, AuditSeverity};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::budget::UserBudgetManager;
use crate::cache::{self, BuildState, BuildTicket, ResponseCache};
use crate::config::ShieldConfig;
use crate::context::{ContextManager, ContextOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, ShieldEvent};
use crate::guard::RequestGuard;
use crate::health::ProviderHealthTracker;
use crate::ledger::{CostLedger, LedgerDraft, SavingsBreakdown};
use crate::persist::DebouncedStore;
use crate::prefix::PrefixOptimizer;
use crate::pricing::{CostEstimator, PricingRegistry};
use crate::router::ModelRouter;
use crate::stream::{ShieldStream, StreamOutcome, StreamTracker};
use crate::tokens::TokenCounter;
use crate::types::{
    CacheHitPayload, FinishReason, GenerateRequest, GenerateResult, ShieldMeta, ShieldParams,
    StreamChunk, Usage, UsageReport,
};

/// Output estimate used for reservations when the host gives no cap.
const DEFAULT_EXPECTED_OUTPUT_TOKENS: u64 = 256;

/// Everything the post-stage needs, bundled so stream hooks can own a
/// clone and settle from `Drop`.
#[derive(Clone)]
struct PostStage {
    estimator: CostEstimator,
    bus: Arc<EventBus>,
    ledger: Option<Arc<CostLedger>>,
    guard: Option<Arc<RequestGuard>>,
    breaker: Option<Arc<CircuitBreaker>>,
    budget: Option<Arc<UserBudgetManager>>,
    anomaly: Arc<AnomalyDetector>,
    health: Arc<ProviderHealthTracker>,
    audit: Arc<AuditLog>,
    on_usage: Option<Arc<dyn Fn(&UsageReport) + Send + Sync>>,
}

impl PostStage {
    fn provider_label(&self, model: &str) -> String {
        self.estimator
            .pricing(model)
            .map(|p| p.provider.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn release_reservation(&self, meta: &ShieldMeta) {
        if let (Some(budget), Some(user), Some(token)) =
            (&self.budget, &meta.user_id, meta.user_budget_inflight)
        {
            budget.release_inflight(user, token);
        }
    }

    fn cancel_guard(&self, meta: &ShieldMeta) {
        if let (Some(guard), true, Some(prompt)) =
            (&self.guard, meta.guard_started, meta.last_user_text.as_deref())
        {
            guard.cancel_request(prompt);
        }
    }

    /// Cache-hit short circuit: release the reservation, record the
    /// savings-only ledger entry, and report zeroed usage.
    fn settle_cache_hit(&self, meta: &ShieldMeta, model: &str, hit: &CacheHitPayload) {
        self.release_reservation(meta);
        self.cancel_guard(meta);

        if let Some(ledger) = &self.ledger {
            ledger.record_cache_hit(model, hit.saved_input_tokens, hit.saved_output_tokens);
        }
        self.bus.emit(ShieldEvent::CacheHit {
            match_type: hit.match_type,
            similarity: hit.similarity,
            saved_cost: hit.saved_cost,
        });
        if let Some(on_usage) = &self.on_usage {
            on_usage(&UsageReport {
                input_tokens: 0,
                output_tokens: 0,
                cost: 0.0,
                saved: hit.saved_cost,
            });
        }
    }

    /// Provider rejection: release everything, record the failure, let the
    /// error travel to the host unchanged.
    fn settle_failure(&self, meta: &ShieldMeta, model: &str, error: &Error) {
        self.release_reservation(meta);
        self.cancel_guard(meta);
        self.health.record_failure(&self.provider_label(model));
        let _ = self.audit.record(
            "provider_error",
            AuditSeverity::Warning,
            "pipeline",
            error.to_string(),
            serde_json::json!({ "model": model }),
        );
    }

    /// Completed call (single-shot or terminal stream accounting).
    fn settle_completion(
        &self,
        meta: &ShieldMeta,
        model: &str,
        usage: Usage,
        latency_ms: u64,
        aborted: bool,
    ) {
        let cost = self
            .estimator
            .safe_cost(model, usage.input_tokens, usage.output_tokens);
        tracing::debug!(
            model,
            original_model = meta.original_model.as_deref().unwrap_or(model),
            fingerprint = meta.fingerprint.as_deref().unwrap_or(""),
            cost,
            aborted,
            "request settled"
        );
        let savings = SavingsBreakdown {
            cache: 0.0,
            context: meta.context_saved,
            router: meta.router_saved,
            prefix: meta.prefix_saved,
        };

        if let Some(ledger) = &self.ledger {
            ledger.record(LedgerDraft {
                model: model.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost,
                savings,
                latency_ms,
            });
        }
        if let Some(on_usage) = &self.on_usage {
            on_usage(&UsageReport {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost,
                saved: savings.total(),
            });
        }
        if let (Some(guard), true, Some(prompt)) =
            (&self.guard, meta.guard_started, meta.last_user_text.as_deref())
        {
            guard.complete_request(prompt, usage.input_tokens, usage.output_tokens, model);
        }
        if let Some(breaker) = &self.breaker {
            breaker.record_spend(cost, model);
        }
        if let (Some(budget), Some(user), Some(token)) =
            (&self.budget, &meta.user_id, meta.user_budget_inflight)
        {
            budget.record_spend(user, cost, model, token);
        }
        if !aborted {
            self.health
                .record_success(&self.provider_label(model), latency_ms);
        }
        self.anomaly.observe(cost, usage.total());
    }
}

/// The middleware engine. Owns every subsystem and the event bus.
pub struct TokenShield {
    config: ShieldConfig,
    bus: Arc<EventBus>,
    estimator: CostEstimator,
    counter: TokenCounter,
    guard: Option<Arc<RequestGuard>>,
    cache: Option<ResponseCache>,
    context: ContextManager,
    router: Option<ModelRouter>,
    prefix: Option<PrefixOptimizer>,
    ledger: Option<Arc<CostLedger>>,
    audit: Arc<AuditLog>,
    breaker: Option<Arc<CircuitBreaker>>,
    budget: Option<Arc<UserBudgetManager>>,
    anomaly: Arc<AnomalyDetector>,
    health: Arc<ProviderHealthTracker>,
    store: Option<Arc<DebouncedStore>>,
    post: PostStage,
}

impl TokenShield {
    /// Build an engine from validated configuration.
    pub fn new(config: ShieldConfig) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(config.pricing.clone());
        let estimator = CostEstimator::new(Arc::clone(&registry));
        let counter = TokenCounter::new();

        let store = config
            .storage
            .clone()
            .map(|backend| Arc::new(DebouncedStore::new(backend)));

        let guard = config.modules.guard.then(|| {
            Arc::new(RequestGuard::new(config.guard.clone(), estimator.clone()))
        });

        let cache = config.modules.cache.then(|| match &store {
            Some(store) => {
                ResponseCache::with_persistence(config.cache.clone(), Arc::clone(store))
            }
            None => ResponseCache::new(config.cache.clone()),
        });

        let router = config.modules.router.then(|| {
            ModelRouter::new(config.router.clone(), estimator.clone())
        });

        let prefix = config.modules.prefix.then(|| {
            PrefixOptimizer::new(config.prefix.clone(), estimator.clone())
        });

        let ledger = config.modules.ledger.then(|| {
            let mut ledger = CostLedger::new(estimator.clone(), Arc::clone(&bus));
            if let Some(feature) = &config.ledger.feature {
                ledger = ledger.with_feature(feature.clone());
            }
            if config.ledger.persist {
                if let Some(store) = &store {
                    ledger = ledger.with_persistence(Arc::clone(store));
                }
            }
            Arc::new(ledger)
        });

        let audit = {
            let mut audit = AuditLog::new(AuditConfig::default(), Arc::clone(&bus));
            if let Some(store) = &store {
                audit = audit.with_persistence(Arc::clone(store));
            }
            Arc::new(audit)
        };

        let breaker = config.breaker.as_ref().map(|section| {
            let mut breaker = CircuitBreaker::new(
                BreakerConfig {
                    limits: section.limits,
                    action: section.action,
                },
                Arc::clone(&bus),
            );
            if section.persist {
                if let Some(store) = &store {
                    breaker = breaker.with_persistence(Arc::clone(store));
                }
            }
            Arc::new(breaker)
        });

        let budget = config.user_budget.as_ref().map(|section| {
            let mut budget = UserBudgetManager::new(section.config.clone(), Arc::clone(&bus));
            if section.persist {
                if let Some(store) = &store {
                    budget = budget.with_persistence(Arc::clone(store));
                }
            }
            Arc::new(budget)
        });

        let anomaly = {
            let mut detector = AnomalyDetector::new(
                config.anomaly.clone().unwrap_or_default(),
                Arc::clone(&bus),
            );
            if let Some(cb) = &config.callbacks.on_anomaly {
                detector = detector.with_callback(Arc::clone(cb));
            }
            Arc::new(detector)
        };

        let health = Arc::new(ProviderHealthTracker::new());

        let post = PostStage {
            estimator: estimator.clone(),
            bus: Arc::clone(&bus),
            ledger: ledger.clone(),
            guard: guard.clone(),
            breaker: breaker.clone(),
            budget: budget.clone(),
            anomaly: Arc::clone(&anomaly),
            health: Arc::clone(&health),
            audit: Arc::clone(&audit),
            on_usage: config.callbacks.on_usage.clone(),
        };

        Ok(Self {
            config,
            bus,
            estimator,
            counter,
            guard,
            cache,
            context: ContextManager::new(),
            router,
            prefix,
            ledger,
            audit,
            breaker,
            budget,
            anomaly,
            health,
            store,
            post,
        })
    }

    /// Engine with default configuration and builtin pricing.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ShieldConfig::default().with_pricing(PricingRegistry::builtin()))
    }

    /// Run the pre-call stages. A blocked request returns the typed error;
    /// a cache hit returns params carrying the synthetic reply for
    /// `wrap_generate` / `wrap_stream` to consume.
    pub async fn transform_params(&self, mut params: ShieldParams) -> Result<ShieldParams> {
        if params.meta.started_at.is_some() {
            return Ok(params);
        }
        params.meta.started_at = Some(Instant::now());
        params.meta.original_model = Some(params.model_id().to_string());
        params.meta.original_input_tokens =
            Some(self.counter.count_messages(params.messages()));

        let prompt = params.last_user_text().map(str::to_string);
        params.meta.last_user_text = prompt.clone();
        let fingerprint = prompt
            .as_deref()
            .map(cache::fingerprint)
            .unwrap_or_default();
        params.meta.fingerprint = Some(fingerprint.clone());

        // 1. Guard.
        if let (Some(guard), Some(prompt)) = (&self.guard, prompt.as_deref()) {
            let decision = guard.check(
                prompt,
                params.model_id(),
                params.max_output_tokens().map(u64::from),
            );
            if !decision.allowed {
                let rule = decision
                    .reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "blocked".to_string());
                self.reject(&params, &fingerprint, "guard", &rule);
                return Err(Error::guard_blocked(
                    rule.clone(),
                    format!("request rejected by {} rule", rule),
                ));
            }
            guard.start_request(prompt);
            params.meta.guard_started = true;
        }
        self.bus.emit(ShieldEvent::RequestAllowed {
            fingerprint: fingerprint.clone(),
        });

        // 2. Circuit breaker.
        if let Some(breaker) = &self.breaker {
            let decision = breaker.check();
            if let Some(window) = decision.tripped_window {
                if !decision.allowed {
                    self.post.cancel_guard(&params.meta);
                    self.reject(&params, &fingerprint, "breaker", &window.to_string());
                    return Err(Error::breaker_tripped(
                        window,
                        decision.spent,
                        decision.limit,
                    ));
                }
                params.meta.throttled = decision.throttled;
            }
        }

        // 3. User budget reservation.
        if let (Some(budget), Some(user)) =
            (&self.budget, params.user_id().map(str::to_string))
        {
            let expected_output = params
                .max_output_tokens()
                .map(u64::from)
                .unwrap_or(DEFAULT_EXPECTED_OUTPUT_TOKENS);
            let estimated = self.estimator.safe_cost(
                params.model_id(),
                params.meta.original_input_tokens.unwrap_or(0),
                expected_output,
            );
            match budget.reserve(&user, estimated) {
                Ok(token) => {
                    params.meta.user_id = Some(user);
                    params.meta.user_budget_inflight = Some(token);
                }
                Err(e) => {
                    self.post.cancel_guard(&params.meta);
                    self.reject(&params, &fingerprint, "userBudget", &e.to_string());
                    return Err(e);
                }
            }
        }

        // 4. Cache lookup, with at-most-once build coordination.
        if let (Some(cache), Some(prompt)) = (&self.cache, prompt.as_deref()) {
            self.cache_stage(cache, prompt, &mut params).await;
        }
        if params.meta.cache_hit.is_some() {
            return Ok(params);
        }

        // 5. Context trim.
        if self.config.modules.context {
            let options = ContextOptions {
                max_input_tokens: self.config.context.max_input_tokens,
                reserved_for_output: self.config.context.reserve_for_output,
                preserve_system: true,
            };
            let outcome = self.context.fit_to_budget(params.messages(), &options);
            if outcome.trimmed() || outcome.overflow {
                let original = params.meta.original_input_tokens.unwrap_or(0);
                let saved_dollars = self
                    .estimator
                    .pricing(params.model_id())
                    .map(|p| p.cost(outcome.evicted_tokens, 0))
                    .unwrap_or(0.0);
                params.meta.context_saved += saved_dollars;
                self.bus.emit(ShieldEvent::ContextTrimmed {
                    original_tokens: original,
                    trimmed_tokens: original.saturating_sub(outcome.evicted_tokens),
                    saved_tokens: outcome.evicted_tokens,
                });
                params.set_messages(outcome.messages);
            }
        }

        // 6. Router.
        if let Some(router) = &self.router {
            let decision = router.route(params.messages(), params.model_id());
            if decision.downgraded() {
                self.bus.emit(ShieldEvent::RouterDowngraded {
                    original_model: decision.original_model.clone(),
                    selected_model: decision.model.clone(),
                    saved_cost: decision.saved_dollars,
                });
                params.meta.router_saved = decision.saved_dollars;
                params.set_model(decision.model);
            }
        }

        // 7. Prefix.
        if let Some(prefix) = &self.prefix {
            let outcome = prefix.optimize(params.messages(), params.model_id());
            if outcome.reordered || outcome.saved_dollars > 0.0 {
                params.meta.prefix_saved = outcome.saved_dollars;
                self.bus.emit(ShieldEvent::PrefixOptimized {
                    saved_dollars: outcome.saved_dollars,
                });
                params.set_messages(outcome.messages);
            }
        }

        Ok(params)
    }

    /// Wrap a single-shot call.
    pub async fn wrap_generate<F, Fut>(
        &self,
        params: ShieldParams,
        do_generate: F,
    ) -> Result<GenerateResult>
    where
        F: FnOnce(GenerateRequest) -> Fut,
        Fut: Future<Output = Result<GenerateResult>>,
    {
        let mut params = self.ensure_transformed(params).await?;

        if let Some(hit) = params.meta.cache_hit.take() {
            self.post
                .settle_cache_hit(&params.meta, params.model_id(), &hit);
            return Ok(GenerateResult::new(
                hit.text,
                Usage::default(),
                FinishReason::Stop,
            ));
        }

        let request = params.to_request();
        let result = do_generate(request).await;
        let latency_ms = params
            .meta
            .started_at
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);

        match result {
            Err(e) => {
                if let Some(permit) = params.meta.build_permit.take() {
                    permit.fail();
                }
                self.post.settle_failure(&params.meta, params.model_id(), &e);
                Err(e)
            }
            Ok(result) => {
                if let Some(permit) = params.meta.build_permit.take() {
                    permit.complete(
                        &result.text,
                        result.usage.input_tokens,
                        result.usage.output_tokens,
                    );
                    self.bus.emit(ShieldEvent::CacheStore {
                        model_id: params.model_id().to_string(),
                        tokens: result.usage.total(),
                    });
                }
                self.post.settle_completion(
                    &params.meta,
                    params.model_id(),
                    result.usage,
                    latency_ms,
                    false,
                );
                Ok(result)
            }
        }
    }

    /// Wrap a streaming call. The returned stream counts tokens as chunks
    /// pass through and settles accounting exactly once on completion,
    /// mid-stream error, or drop.
    pub async fn wrap_stream<F, Fut, S>(
        &self,
        params: ShieldParams,
        do_stream: F,
    ) -> Result<ShieldStream<S>>
    where
        F: FnOnce(GenerateRequest) -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<StreamChunk>> + Unpin,
    {
        let mut params = self.ensure_transformed(params).await?;

        if let Some(hit) = params.meta.cache_hit.take() {
            self.post
                .settle_cache_hit(&params.meta, params.model_id(), &hit);
            let latency_ms = params
                .meta
                .started_at
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let outcome = StreamOutcome {
                usage: Usage::default(),
                cost: 0.0,
                finish_reason: FinishReason::Stop,
                aborted: false,
                chunk_count: 1,
                latency_ms,
                text: hit.text.clone(),
            };
            return Ok(ShieldStream::synthetic(hit.text, outcome));
        }

        let request = params.to_request();
        match do_stream(request).await {
            Err(e) => {
                if let Some(permit) = params.meta.build_permit.take() {
                    permit.fail();
                }
                self.post.settle_failure(&params.meta, params.model_id(), &e);
                Err(e)
            }
            Ok(inner) => {
                let input_tokens = self.counter.count_messages(params.messages());
                let tracker = Arc::new(StreamTracker::new(
                    params.model_id(),
                    input_tokens,
                    self.estimator.clone(),
                    Arc::clone(&self.bus),
                    self.config.callbacks.stream.clone(),
                ));

                let post = self.post.clone();
                let model = params.model_id().to_string();
                let mut meta = std::mem::take(&mut params.meta);
                let permit = meta.build_permit.take();
                let bus = Arc::clone(&self.bus);

                let hook = Box::new(move |outcome: &StreamOutcome| {
                    if let Some(permit) = permit {
                        if outcome.aborted {
                            permit.fail();
                        } else {
                            permit.complete(
                                &outcome.text,
                                outcome.usage.input_tokens,
                                outcome.usage.output_tokens,
                            );
                            bus.emit(ShieldEvent::CacheStore {
                                model_id: model.clone(),
                                tokens: outcome.usage.total(),
                            });
                        }
                    }
                    post.settle_completion(
                        &meta,
                        &model,
                        outcome.usage,
                        outcome.latency_ms,
                        outcome.aborted,
                    );
                });

                Ok(ShieldStream::live(inner, tracker, hook))
            }
        }
    }

    /// Flush debounced persistence. Call before shutdown.
    pub fn dispose(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                self.bus.emit(ShieldEvent::StorageError {
                    module: "engine".to_string(),
                    operation: "flush".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn ledger(&self) -> Option<&CostLedger> {
        self.ledger.as_deref()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_deref()
    }

    pub fn user_budget(&self) -> Option<&UserBudgetManager> {
        self.budget.as_deref()
    }

    pub fn guard(&self) -> Option<&RequestGuard> {
        self.guard.as_deref()
    }

    pub fn health(&self) -> &ProviderHealthTracker {
        &self.health
    }

    pub fn anomaly(&self) -> &AnomalyDetector {
        &self.anomaly
    }

    async fn ensure_transformed(&self, params: ShieldParams) -> Result<ShieldParams> {
        if params.meta.started_at.is_none() {
            self.transform_params(params).await
        } else {
            Ok(params)
        }
    }

    /// Run the cache stage: exact/fuzzy hit, claim the build, or wait for
    /// the in-flight sibling build of the same fingerprint.
    async fn cache_stage(&self, cache: &ResponseCache, prompt: &str, params: &mut ShieldParams) {
        loop {
            match cache.lookup_or_build(prompt, params.model_id()) {
                BuildTicket::Hit(hit) => {
                    let saved_cost = self.estimator.safe_cost(
                        &hit.model_id,
                        hit.input_tokens,
                        hit.output_tokens,
                    );
                    params.meta.cache_hit = Some(CacheHitPayload {
                        text: hit.text,
                        match_type: hit.match_type,
                        similarity: hit.similarity,
                        saved_cost,
                        saved_input_tokens: hit.input_tokens,
                        saved_output_tokens: hit.output_tokens,
                    });
                    return;
                }
                BuildTicket::Leader(permit) => {
                    self.bus.emit(ShieldEvent::CacheMiss {
                        model_id: params.model_id().to_string(),
                    });
                    params.meta.build_permit = Some(permit);
                    return;
                }
                BuildTicket::Follower(mut rx) => {
                    let resolved = loop {
                        let state = rx.borrow().clone();
                        match state {
                            BuildState::Pending => {
                                if rx.changed().await.is_err() {
                                    break None;
                                }
                            }
                            BuildState::Done(done) => break done,
                        }
                    };
                    match resolved {
                        Some(hit) => {
                            let saved_cost = self.estimator.safe_cost(
                                &hit.model_id,
                                hit.input_tokens,
                                hit.output_tokens,
                            );
                            params.meta.cache_hit = Some(CacheHitPayload {
                                text: hit.text,
                                match_type: hit.match_type,
                                similarity: hit.similarity,
                                saved_cost,
                                saved_input_tokens: hit.input_tokens,
                                saved_output_tokens: hit.output_tokens,
                            });
                            return;
                        }
                        // The sibling build failed: take another turn, this
                        // request may claim the build itself.
                        None => continue,
                    }
                }
            }
        }
    }

    fn reject(&self, params: &ShieldParams, fingerprint: &str, module: &str, reason: &str) {
        self.bus.emit(ShieldEvent::RequestBlocked {
            fingerprint: fingerprint.to_string(),
            reason: reason.to_string(),
        });
        let _ = self.audit.record(
            "request_blocked",
            AuditSeverity::Warning,
            module,
            format!("request to {} blocked: {}", params.model_id(), reason),
            serde_json::json!({ "reason": reason, "model": params.model_id() }),
        );
    }
}

impl Drop for TokenShield {
    fn drop(&mut self) {
        self.dispose();
    }
}
