//! Provider health derived from observed request outcomes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Derived provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

/// Rolling view of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    /// Exponentially weighted latency in milliseconds.
    pub latency_ewma_ms: f64,
    /// Exponentially weighted failure rate in [0, 1].
    pub error_rate_ewma: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub uptime_percent: f64,
    pub status: HealthStatus,
}

impl ProviderHealth {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            latency_ewma_ms: 0.0,
            error_rate_ewma: 0.0,
            request_count: 0,
            success_count: 0,
            uptime_percent: 100.0,
            status: HealthStatus::Healthy,
        }
    }

    fn refresh(&mut self) {
        self.uptime_percent = if self.request_count == 0 {
            100.0
        } else {
            self.success_count as f64 / self.request_count as f64 * 100.0
        };
        self.status = if self.error_rate_ewma > DOWN_ERROR_RATE {
            HealthStatus::Down
        } else if self.error_rate_ewma > DEGRADED_ERROR_RATE
            || self.latency_ewma_ms > DEGRADED_LATENCY_MS
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }
}

/// EWMA smoothing factor: each new observation carries this much weight.
const EWMA_ALPHA: f64 = 0.2;
const DEGRADED_ERROR_RATE: f64 = 0.1;
const DOWN_ERROR_RATE: f64 = 0.5;
const DEGRADED_LATENCY_MS: f64 = 30_000.0;

/// Tracks health per provider name.
#[derive(Default)]
pub struct ProviderHealthTracker {
    providers: Mutex<HashMap<String, ProviderHealth>>,
}

impl ProviderHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider: &str, latency_ms: u64) {
        let mut providers = self.lock();
        let health = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(provider));
        health.request_count += 1;
        health.success_count += 1;
        health.latency_ewma_ms = if health.request_count == 1 {
            latency_ms as f64
        } else {
            EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * health.latency_ewma_ms
        };
        health.error_rate_ewma *= 1.0 - EWMA_ALPHA;
        health.refresh();
    }

    pub fn record_failure(&self, provider: &str) {
        let mut providers = self.lock();
        let health = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(provider));
        health.request_count += 1;
        health.error_rate_ewma = EWMA_ALPHA + (1.0 - EWMA_ALPHA) * health.error_rate_ewma;
        health.refresh();
    }

    pub fn get(&self, provider: &str) -> Option<ProviderHealth> {
        self.lock().get(provider).cloned()
    }

    pub fn all(&self) -> Vec<ProviderHealth> {
        let mut all: Vec<ProviderHealth> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderHealth>> {
        self.providers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
