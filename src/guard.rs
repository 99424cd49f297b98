//! Request guard: admission rules evaluated before any money is spent.
//!
//! Rules run in a fixed order and the first failure wins: minimum input
//! length, maximum input tokens, debounce, duplicate window, sliding
//! per-minute rate limit, rolling per-hour cost limit. All state is
//! process-local; windowed structures are append-and-prune on each check.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cache::fingerprint;
use crate::pricing::CostEstimator;
use crate::tokens::TokenCounter;

/// Guard thresholds. `None` disables the corresponding rule.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Minimum prompt length in characters.
    pub min_input_length: usize,
    /// Maximum prompt size in estimated tokens.
    pub max_input_tokens: Option<u64>,
    /// Reject an identical prompt arriving again within this window.
    pub debounce_ms: u64,
    /// Reject an identical prompt while one is in flight or completed
    /// within this window.
    pub deduplicate_window_ms: u64,
    /// Sliding 60-second request cap.
    pub max_requests_per_minute: Option<u32>,
    /// Rolling 60-minute cap on actual completed spend.
    pub max_cost_per_hour: Option<f64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_input_length: 2,
            max_input_tokens: None,
            debounce_ms: 500,
            deduplicate_window_ms: 5_000,
            max_requests_per_minute: Some(60),
            max_cost_per_hour: None,
        }
    }
}

/// The rule that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    InputTooShort,
    InputTooLong,
    Debounced,
    Duplicate,
    RateLimited,
    CostLimited,
}

impl std::fmt::Display for GuardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InputTooShort => "input_too_short",
            Self::InputTooLong => "input_too_long",
            Self::Debounced => "debounce",
            Self::Duplicate => "duplicate",
            Self::RateLimited => "rate_limit",
            Self::CostLimited => "cost_limit",
        };
        write!(f, "{}", s)
    }
}

/// Result of a guard check.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: Option<GuardReason>,
    /// Dollar estimate for the request if it proceeds.
    pub estimated_cost: f64,
}

/// Point-in-time guard counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardStats {
    pub requests_last_minute: usize,
    pub cost_last_hour: f64,
    pub inflight: usize,
}

struct GuardState {
    /// Fingerprint -> last time it was started.
    last_seen: HashMap<String, Instant>,
    inflight: HashSet<String>,
    /// Completions inside the dedup window, oldest first.
    completed: VecDeque<(Instant, String)>,
    /// Request starts inside the rate window, oldest first.
    started: VecDeque<Instant>,
    /// Completed spend inside the cost window, oldest first.
    costs: VecDeque<(Instant, f64)>,
}

/// Debounce, dedup, rate and cost gating for the pipeline's front door.
pub struct RequestGuard {
    config: GuardConfig,
    counter: TokenCounter,
    estimator: CostEstimator,
    state: Mutex<GuardState>,
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const COST_WINDOW: Duration = Duration::from_secs(3600);

/// When the host gives no output estimate, assume a mid-sized reply.
const DEFAULT_EXPECTED_OUTPUT_TOKENS: u64 = 256;

impl RequestGuard {
    pub fn new(config: GuardConfig, estimator: CostEstimator) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
            estimator,
            state: Mutex::new(GuardState {
                last_seen: HashMap::new(),
                inflight: HashSet::new(),
                completed: VecDeque::new(),
                started: VecDeque::new(),
                costs: VecDeque::new(),
            }),
        }
    }

    /// Evaluate the rules in order; the first failure wins.
    pub fn check(
        &self,
        prompt: &str,
        model_id: &str,
        expected_output_tokens: Option<u64>,
    ) -> GuardDecision {
        let now = Instant::now();
        let input_tokens = self.counter.count(prompt);
        let estimated_cost = self.estimator.safe_cost(
            model_id,
            input_tokens,
            expected_output_tokens.unwrap_or(DEFAULT_EXPECTED_OUTPUT_TOKENS),
        );

        let reject = |reason| GuardDecision {
            allowed: false,
            reason: Some(reason),
            estimated_cost,
        };

        if prompt.chars().count() < self.config.min_input_length {
            return reject(GuardReason::InputTooShort);
        }

        if let Some(max) = self.config.max_input_tokens {
            if input_tokens > max {
                return reject(GuardReason::InputTooLong);
            }
        }

        let fp = fingerprint(prompt);
        let mut state = self.lock();
        Self::prune(&mut state, now, self.config.deduplicate_window_ms);

        if let Some(last) = state.last_seen.get(&fp) {
            if now.duration_since(*last) < Duration::from_millis(self.config.debounce_ms) {
                return reject(GuardReason::Debounced);
            }
        }

        if self.config.deduplicate_window_ms > 0 {
            let duplicate = state.inflight.contains(&fp)
                || state.completed.iter().any(|(_, f)| f == &fp);
            if duplicate {
                return reject(GuardReason::Duplicate);
            }
        }

        if let Some(max) = self.config.max_requests_per_minute {
            if state.started.len() >= max as usize {
                return reject(GuardReason::RateLimited);
            }
        }

        if let Some(max) = self.config.max_cost_per_hour {
            let spent: f64 = state.costs.iter().map(|(_, c)| c).sum();
            if spent + estimated_cost > max {
                return reject(GuardReason::CostLimited);
            }
        }

        GuardDecision {
            allowed: true,
            reason: None,
            estimated_cost,
        }
    }

    /// Record an admitted request entering flight.
    pub fn start_request(&self, prompt: &str) {
        let fp = fingerprint(prompt);
        let now = Instant::now();
        let mut state = self.lock();
        state.last_seen.insert(fp.clone(), now);
        state.inflight.insert(fp);
        state.started.push_back(now);
    }

    /// Record completion with the actual spend for the cost window.
    pub fn complete_request(
        &self,
        prompt: &str,
        input_tokens: u64,
        output_tokens: u64,
        model_id: &str,
    ) {
        let cost = self
            .estimator
            .safe_cost(model_id, input_tokens, output_tokens);
        let fp = fingerprint(prompt);
        let now = Instant::now();
        let mut state = self.lock();
        state.inflight.remove(&fp);
        state.completed.push_back((now, fp));
        state.costs.push_back((now, cost));
    }

    /// Drop an in-flight marker without charging spend, for requests that
    /// never completed (provider failure, short-circuit).
    pub fn cancel_request(&self, prompt: &str) {
        let fp = fingerprint(prompt);
        self.lock().inflight.remove(&fp);
    }

    pub fn stats(&self) -> GuardStats {
        let now = Instant::now();
        let mut state = self.lock();
        Self::prune(&mut state, now, self.config.deduplicate_window_ms);
        GuardStats {
            requests_last_minute: state.started.len(),
            cost_last_hour: state.costs.iter().map(|(_, c)| c).sum(),
            inflight: state.inflight.len(),
        }
    }

    fn prune(state: &mut GuardState, now: Instant, dedup_window_ms: u64) {
        while state
            .started
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
        {
            state.started.pop_front();
        }
        while state
            .costs
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) >= COST_WINDOW)
        {
            state.costs.pop_front();
        }
        let dedup = Duration::from_millis(dedup_window_ms);
        while state
            .completed
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) >= dedup)
        {
            state.completed.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
