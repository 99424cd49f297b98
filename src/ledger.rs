//! Append-only cost ledger.
//!
//! Every completed request lands here exactly once: spend, token counts,
//! and the per-stage savings breakdown. Entries are never updated. Cache
//! hits record savings-only entries with zero spend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::events::{EventBus, ShieldEvent};
use crate::persist::{keys, DebouncedStore, VersionedRecord};
use crate::pricing::CostEstimator;

/// Dollar savings attributed to each stage for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsBreakdown {
    pub cache: f64,
    pub context: f64,
    pub router: f64,
    pub prefix: f64,
}

impl SavingsBreakdown {
    pub fn total(&self) -> f64 {
        self.cache + self.context + self.router + self.prefix
    }
}

/// One completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Process-monotonic sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Dollars actually spent.
    pub cost: f64,
    pub savings: SavingsBreakdown,
    /// Host-supplied feature tag for attribution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub latency_ms: u64,
}

/// Fields the caller provides; seq and timestamp are assigned on append.
#[derive(Debug, Clone, Default)]
pub struct LedgerDraft {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub savings: SavingsBreakdown,
    pub latency_ms: u64,
}

/// Aggregate view over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_spent: f64,
    pub total_saved: f64,
    pub total_calls: u64,
    pub per_model: HashMap<String, ModelSummary>,
}

/// Per-model aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub spent: f64,
    pub saved: f64,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Export envelope shared with the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerExport {
    pub exported_at: DateTime<Utc>,
    pub integrity: ExportIntegrity,
    pub total_entries: usize,
    pub entries: Vec<LedgerEntry>,
}

/// Integrity summary carried by exports. The ledger has no hash chain, so
/// its exports are always `valid`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportIntegrity {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pruned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_from: Option<u64>,
}

struct LedgerState {
    entries: Vec<LedgerEntry>,
    next_seq: u64,
}

/// The append-only cost ledger.
pub struct CostLedger {
    state: Mutex<LedgerState>,
    estimator: CostEstimator,
    bus: Arc<EventBus>,
    persist: Option<Arc<DebouncedStore>>,
    feature: Option<String>,
}

impl CostLedger {
    pub fn new(estimator: CostEstimator, bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                entries: Vec::new(),
                next_seq: 1,
            }),
            estimator,
            bus,
            persist: None,
            feature: None,
        }
    }

    /// Tag every entry with a feature name.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    /// Persist entries through the given store, reloading whatever a
    /// previous process left behind.
    pub fn with_persistence(mut self, store: Arc<DebouncedStore>) -> Self {
        self.persist = Some(store);
        self.load();
        self
    }

    /// Append a completed request. Returns the sealed entry.
    pub fn record(&self, draft: LedgerDraft) -> LedgerEntry {
        let entry = {
            let mut state = self.lock();
            let entry = LedgerEntry {
                seq: state.next_seq,
                timestamp: Utc::now(),
                model: draft.model,
                input_tokens: draft.input_tokens,
                output_tokens: draft.output_tokens,
                cost: draft.cost,
                savings: draft.savings,
                feature: self.feature.clone(),
                latency_ms: draft.latency_ms,
            };
            state.next_seq += 1;
            state.entries.push(entry.clone());
            entry
        };

        self.bus.emit(ShieldEvent::LedgerEntry {
            model: entry.model.clone(),
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            cost: entry.cost,
            saved: entry.savings.total(),
            latency_ms: entry.latency_ms,
        });
        self.save();
        entry
    }

    /// Append a savings-only entry for a cache hit: zero spend, zero
    /// tokens billed, the avoided cost recorded under `savings.cache`.
    pub fn record_cache_hit(
        &self,
        model: &str,
        saved_input_tokens: u64,
        saved_output_tokens: u64,
    ) -> LedgerEntry {
        let saved = self
            .estimator
            .safe_cost(model, saved_input_tokens, saved_output_tokens);
        self.record(LedgerDraft {
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            savings: SavingsBreakdown {
                cache: saved,
                ..SavingsBreakdown::default()
            },
            latency_ms: 0,
        })
    }

    pub fn get_summary(&self) -> LedgerSummary {
        let state = self.lock();
        let mut summary = LedgerSummary::default();
        for entry in &state.entries {
            summary.total_spent += entry.cost;
            summary.total_saved += entry.savings.total();
            summary.total_calls += 1;

            let model = summary.per_model.entry(entry.model.clone()).or_default();
            model.spent += entry.cost;
            model.saved += entry.savings.total();
            model.calls += 1;
            model.input_tokens += entry.input_tokens;
            model.output_tokens += entry.output_tokens;
        }
        summary
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export as a self-describing JSON document.
    pub fn export_json(&self) -> Result<String> {
        let export = LedgerExport {
            exported_at: Utc::now(),
            integrity: ExportIntegrity {
                valid: true,
                pruned: None,
                verified_from: None,
            },
            total_entries: self.len(),
            entries: self.entries(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Export the spend/savings time series as CSV with ISO-8601 stamps.
    pub fn export_csv(&self) -> String {
        let mut csv = String::from("timestamp,spent,saved,cumulative_spent,cumulative_saved\n");
        let mut cumulative_spent = 0.0;
        let mut cumulative_saved = 0.0;
        for entry in self.lock().entries.iter() {
            cumulative_spent += entry.cost;
            cumulative_saved += entry.savings.total();
            csv.push_str(&format!(
                "{},{:.6},{:.6},{:.6},{:.6}\n",
                entry.timestamp.to_rfc3339(),
                entry.cost,
                entry.savings.total(),
                cumulative_spent,
                cumulative_saved,
            ));
        }
        csv
    }

    /// Replace the ledger with a previously exported document.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let export: LedgerExport = serde_json::from_str(json)?;
        let mut state = self.lock();
        state.next_seq = export.entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        state.entries = export.entries;
        drop(state);
        self.save();
        Ok(())
    }

    fn save(&self) {
        let Some(store) = &self.persist else { return };
        let entries = self.entries();
        let result = VersionedRecord::new(entries)
            .to_json()
            .and_then(|json| store.put(keys::LEDGER_ENTRIES, &json));
        if let Err(e) = result {
            self.bus.emit(ShieldEvent::StorageError {
                module: "ledger".to_string(),
                operation: "persist".to_string(),
                error: e.to_string(),
            });
        }
    }

    fn load(&self) {
        let Some(store) = &self.persist else { return };
        match store.get(keys::LEDGER_ENTRIES) {
            Ok(Some(json)) => match VersionedRecord::<Vec<LedgerEntry>>::from_json(&json) {
                Ok(entries) => {
                    let mut state = self.lock();
                    state.next_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
                    state.entries = entries;
                }
                Err(e) => self.bus.emit(ShieldEvent::StorageError {
                    module: "ledger".to_string(),
                    operation: "load".to_string(),
                    error: e.to_string(),
                }),
            },
            Ok(None) => {}
            Err(e) => self.bus.emit(ShieldEvent::StorageError {
                module: "ledger".to_string(),
                operation: "load".to_string(),
                error: e.to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::pricing::PricingRegistry;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ledger() -> CostLedger {
        CostLedger::new(
            CostEstimator::new(Arc::new(PricingRegistry::builtin())),
            Arc::new(EventBus::new()),
        )
    }

    fn draft(model: &str, cost: f64) -> LedgerDraft {
        LedgerDraft {
            model: model.to_string(),
            input_tokens: 1000,
            output_tokens: 500,
            cost,
            savings: SavingsBreakdown {
                router: 0.01,
                ..SavingsBreakdown::default()
            },
            latency_ms: 120,
        }
    }

    #[test]
    fn test_seq_is_monotonic() {
        let ledger = ledger();
        let a = ledger.record(draft("gpt-4o", 0.01));
        let b = ledger.record(draft("gpt-4o", 0.02));
        let c = ledger.record(draft("gpt-4o-mini", 0.001));
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[test]
    fn test_record_emits_event() {
        let bus = Arc::new(EventBus::new());
        let ledger = CostLedger::new(
            CostEstimator::new(Arc::new(PricingRegistry::builtin())),
            Arc::clone(&bus),
        );

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(crate::events::EventKind::LedgerEntry, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        ledger.record(draft("gpt-4o", 0.01));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_hit_entry_is_savings_only() {
        let ledger = ledger();
        let entry = ledger.record_cache_hit("gpt-4o", 1000, 500);
        assert_eq!(entry.cost, 0.0);
        assert_eq!(entry.input_tokens, 0);
        assert_eq!(entry.output_tokens, 0);
        assert!(entry.savings.cache > 0.0);
    }

    #[test]
    fn test_summary() {
        let ledger = ledger();
        ledger.record(draft("gpt-4o", 0.01));
        ledger.record(draft("gpt-4o", 0.02));
        ledger.record(draft("gpt-4o-mini", 0.001));

        let summary = ledger.get_summary();
        assert_eq!(summary.total_calls, 3);
        assert!((summary.total_spent - 0.031).abs() < 1e-9);
        assert!((summary.total_saved - 0.03).abs() < 1e-9);
        assert_eq!(summary.per_model.len(), 2);
        assert_eq!(summary.per_model["gpt-4o"].calls, 2);
    }

    #[test]
    fn test_export_import_roundtrip_preserves_summary() {
        let ledger1 = ledger();
        ledger1.record(draft("gpt-4o", 0.01));
        ledger1.record_cache_hit("gpt-4o", 1000, 500);

        let json = ledger1.export_json().unwrap();

        let ledger2 = ledger();
        ledger2.import_json(&json).unwrap();
        assert_eq!(ledger1.get_summary(), ledger2.get_summary());

        // Appending after import continues the sequence.
        let next = ledger2.record(draft("gpt-4o", 0.01));
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn test_csv_export_shape() {
        let ledger = ledger();
        ledger.record(draft("gpt-4o", 0.01));
        ledger.record(draft("gpt-4o", 0.02));

        let csv = ledger.export_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,spent,saved,cumulative_spent,cumulative_saved"
        );
        assert_eq!(lines.len(), 3);
        // Cumulative column grows.
        assert!(lines[2].contains("0.030000"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store = Arc::new(DebouncedStore::with_interval(
            Arc::new(MemoryStore::new()),
            std::time::Duration::from_millis(0),
        ));
        let bus = Arc::new(EventBus::new());
        let estimator = CostEstimator::new(Arc::new(PricingRegistry::builtin()));

        {
            let ledger = CostLedger::new(estimator.clone(), Arc::clone(&bus))
                .with_persistence(Arc::clone(&store));
            ledger.record(draft("gpt-4o", 0.01));
        }

        let reloaded =
            CostLedger::new(estimator, bus).with_persistence(store);
        assert_eq!(reloaded.len(), 1);
        let next = reloaded.record(draft("gpt-4o", 0.02));
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn test_feature_tag() {
        let ledger = ledger().with_feature("chat");
        let entry = ledger.record(draft("gpt-4o", 0.01));
        assert_eq!(entry.feature.as_deref(), Some("chat"));
    }
}
