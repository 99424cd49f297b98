//! Spend and token anomaly detection.
//!
//! Rolling statistics (mean, stddev, p95) over per-request cost and token
//! count. A sample flags a spike when it sits beyond both the sigma bound
//! and the ratio bound; a sustained shift between the last window and the
//! one before it flags a rate change. Severity grades by magnitude.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::events::{EventBus, ShieldEvent};

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Samples kept for spike statistics.
    pub window: usize,
    /// Samples per side of the rate-change comparison.
    pub rate_window: usize,
    /// Spike: value must exceed mean + this many standard deviations...
    pub spike_sigma: f64,
    /// ...and exceed mean by this ratio.
    pub spike_ratio: f64,
    /// Rate change: recent average vs prior average beyond this factor.
    pub rate_change_factor: f64,
    /// No flags until this many samples have been seen.
    pub min_samples: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: 100,
            rate_window: 10,
            spike_sigma: 2.0,
            spike_ratio: 2.0,
            rate_change_factor: 3.0,
            min_samples: 10,
        }
    }
}

/// What kind of anomaly fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    CostSpike,
    TokenSpike,
    CostRateChange,
    TokenRateChange,
}

/// Graded by how far past the bound the sample landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

/// One detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub metric: String,
    pub value: f64,
    pub expected: f64,
    pub message: String,
}

/// Rolling statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub mean: f64,
    pub stddev: f64,
    pub p95: f64,
    pub samples: usize,
}

struct MetricWindow {
    samples: VecDeque<f64>,
}

impl MetricWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, value: f64, cap: usize) {
        self.samples.push_back(value);
        while self.samples.len() > cap {
            self.samples.pop_front();
        }
    }

    fn stats(&self) -> MetricStats {
        let n = self.samples.len();
        if n == 0 {
            return MetricStats::default();
        }
        let mean = self.samples.iter().sum::<f64>() / n as f64;
        let variance =
            self.samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95_idx = ((n as f64 * 0.95).ceil() as usize).saturating_sub(1);

        MetricStats {
            mean,
            stddev: variance.sqrt(),
            p95: sorted[p95_idx.min(n - 1)],
            samples: n,
        }
    }

    /// Average of the last `w` samples vs the `w` before them.
    fn rate_shift(&self, w: usize) -> Option<(f64, f64)> {
        if self.samples.len() < w * 2 {
            return None;
        }
        let recent: f64 = self.samples.iter().rev().take(w).sum::<f64>() / w as f64;
        let prior: f64 =
            self.samples.iter().rev().skip(w).take(w).sum::<f64>() / w as f64;
        Some((prior, recent))
    }
}

struct DetectorState {
    cost: MetricWindow,
    tokens: MetricWindow,
}

/// The anomaly detector.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    state: Mutex<DetectorState>,
    bus: Arc<EventBus>,
    on_anomaly: Option<Arc<dyn Fn(&AnomalyReport) + Send + Sync>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                cost: MetricWindow::new(),
                tokens: MetricWindow::new(),
            }),
            bus,
            on_anomaly: None,
        }
    }

    /// Install the host's anomaly callback.
    pub fn with_callback(mut self, callback: Arc<dyn Fn(&AnomalyReport) + Send + Sync>) -> Self {
        self.on_anomaly = Some(callback);
        self
    }

    /// Feed one completed request; returns whatever fired.
    pub fn observe(&self, cost: f64, tokens: u64) -> Vec<AnomalyReport> {
        let reports = {
            let mut state = self.lock();
            let mut reports = Vec::new();

            reports.extend(self.check_metric(
                &state.cost,
                cost,
                "cost",
                AnomalyKind::CostSpike,
                AnomalyKind::CostRateChange,
            ));
            reports.extend(self.check_metric(
                &state.tokens,
                tokens as f64,
                "tokens",
                AnomalyKind::TokenSpike,
                AnomalyKind::TokenRateChange,
            ));

            state.cost.push(cost, self.config.window);
            state.tokens.push(tokens as f64, self.config.window);
            reports
        };

        for report in &reports {
            self.bus.emit(ShieldEvent::AnomalyDetected {
                report: report.clone(),
            });
            if let Some(cb) = &self.on_anomaly {
                cb(report);
            }
        }
        reports
    }

    /// Current rolling statistics.
    pub fn stats(&self) -> (MetricStats, MetricStats) {
        let state = self.lock();
        (state.cost.stats(), state.tokens.stats())
    }

    fn check_metric(
        &self,
        window: &MetricWindow,
        value: f64,
        metric: &str,
        spike_kind: AnomalyKind,
        rate_kind: AnomalyKind,
    ) -> Vec<AnomalyReport> {
        let mut reports = Vec::new();
        let stats = window.stats();

        if stats.samples >= self.config.min_samples {
            let sigma_bound = stats.mean + self.config.spike_sigma * stats.stddev;
            let ratio_bound = stats.mean * self.config.spike_ratio;
            if value > sigma_bound && value > ratio_bound && stats.mean > 0.0 {
                let severity = if value > stats.mean + 4.0 * stats.stddev
                    && value > stats.mean * 4.0
                {
                    AnomalySeverity::High
                } else if value > stats.mean + 3.0 * stats.stddev
                    && value > stats.mean * 3.0
                {
                    AnomalySeverity::Medium
                } else {
                    AnomalySeverity::Low
                };
                reports.push(AnomalyReport {
                    kind: spike_kind,
                    severity,
                    metric: metric.to_string(),
                    value,
                    expected: stats.mean,
                    message: format!(
                        "{} {:.6} is {:.1}x the rolling mean {:.6}",
                        metric,
                        value,
                        value / stats.mean,
                        stats.mean
                    ),
                });
            }
        }

        if let Some((prior, recent)) = window.rate_shift(self.config.rate_window) {
            if prior > 0.0 {
                let factor = recent / prior;
                if factor >= self.config.rate_change_factor
                    || factor <= 1.0 / self.config.rate_change_factor
                {
                    let severity = if factor >= self.config.rate_change_factor * 2.0 {
                        AnomalySeverity::High
                    } else {
                        AnomalySeverity::Medium
                    };
                    reports.push(AnomalyReport {
                        kind: rate_kind,
                        severity,
                        metric: metric.to_string(),
                        value: recent,
                        expected: prior,
                        message: format!(
                            "{} rate moved {:.2}x between windows",
                            metric, factor
                        ),
                    });
                }
            }
        }

        reports
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
