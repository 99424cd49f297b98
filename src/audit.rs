//! Tamper-evident audit log.
//!
//! Entries form a hash chain: each hash covers the entry's canonical form
//! plus the previous hash. Old entries are only ever dropped as a whole
//! prefix; verification then reports `pruned` along with the first
//! sequence number it could still verify from. Severity and event-type
//! filters drop entries before they enter the chain, so filtering never
//! breaks integrity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::events::{EventBus, ShieldEvent};
use crate::ledger::ExportIntegrity;
use crate::persist::{keys, DebouncedStore, VersionedRecord};

/// Hash of "nothing before this": the chain anchor for entry 1.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Entry severity, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One chained entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub module: String,
    pub description: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// The canonical byte string covered by this entry's hash.
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.seq,
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.severity,
            self.module,
            self.description,
            self.payload,
            self.prev_hash,
        )
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Audit log configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Entry cap; exceeding it drops the oldest prefix wholesale.
    pub max_entries: usize,
    /// Entries below this severity never enter the chain.
    pub min_severity: AuditSeverity,
    /// Event types that never enter the chain.
    pub ignored_types: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            min_severity: AuditSeverity::Info,
            ignored_types: Vec::new(),
        }
    }
}

/// Result of walking the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    /// A prefix has been dropped; verification starts mid-chain.
    pub pruned: bool,
    /// First sequence number the walk could verify from, when pruned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_from: Option<u64>,
    /// First entry whose hash did not match, when invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid_seq: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAudit {
    entries: Vec<AuditEntry>,
    pruned: bool,
    next_seq: u64,
}

struct AuditState {
    entries: VecDeque<AuditEntry>,
    next_seq: u64,
    pruned: bool,
}

/// The hash-chained audit log.
pub struct AuditLog {
    config: AuditConfig,
    state: Mutex<AuditState>,
    bus: Arc<EventBus>,
    persist: Option<Arc<DebouncedStore>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            state: Mutex::new(AuditState {
                entries: VecDeque::new(),
                next_seq: 1,
                pruned: false,
            }),
            bus,
            persist: None,
        }
    }

    /// Persist the chain through the given store, reloading whatever a
    /// previous process left behind.
    pub fn with_persistence(mut self, store: Arc<DebouncedStore>) -> Self {
        self.persist = Some(store);
        self.load();
        self
    }

    /// Record an entry. Returns `None` when a filter dropped it.
    pub fn record(
        &self,
        event_type: impl Into<String>,
        severity: AuditSeverity,
        module: impl Into<String>,
        description: impl Into<String>,
        payload: Value,
    ) -> Option<AuditEntry> {
        let event_type = event_type.into();
        if severity < self.config.min_severity
            || self.config.ignored_types.contains(&event_type)
        {
            return None;
        }

        let entry = {
            let mut state = self.lock();
            let prev_hash = state
                .entries
                .back()
                .map(|e| e.hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());

            let mut entry = AuditEntry {
                seq: state.next_seq,
                timestamp: Utc::now(),
                event_type,
                severity,
                module: module.into(),
                description: description.into(),
                payload,
                prev_hash,
                hash: String::new(),
            };
            entry.hash = entry.compute_hash();

            state.next_seq += 1;
            state.entries.push_back(entry.clone());

            // Wholesale prefix drop on overflow.
            if state.entries.len() > self.config.max_entries {
                let overflow = state.entries.len() - self.config.max_entries;
                state.entries.drain(..overflow);
                state.pruned = true;
            }
            entry
        };

        self.save();
        Some(entry)
    }

    /// Walk the chain and report the first mismatch, if any.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let state = self.lock();
        let pruned = state.pruned;
        let verified_from = if pruned {
            state.entries.front().map(|e| e.seq)
        } else {
            None
        };

        let mut prev_hash: Option<String> = None;
        for entry in &state.entries {
            // Link check: each entry must point at its predecessor. The
            // first surviving entry after a prune keeps its original link,
            // which is trusted as the anchor.
            if let Some(prev) = &prev_hash {
                if entry.prev_hash != *prev {
                    return IntegrityReport {
                        valid: false,
                        pruned,
                        verified_from,
                        first_invalid_seq: Some(entry.seq),
                    };
                }
            } else if !pruned && entry.prev_hash != GENESIS_HASH {
                return IntegrityReport {
                    valid: false,
                    pruned,
                    verified_from,
                    first_invalid_seq: Some(entry.seq),
                };
            }

            // Content check: the stored hash must match the recomputation.
            if entry.compute_hash() != entry.hash {
                return IntegrityReport {
                    valid: false,
                    pruned,
                    verified_from,
                    first_invalid_seq: Some(entry.seq),
                };
            }
            prev_hash = Some(entry.hash.clone());
        }

        IntegrityReport {
            valid: true,
            pruned,
            verified_from,
            first_invalid_seq: None,
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export as JSON. Appends a self-describing `export_requested` entry
    /// before serializing, so exports are themselves auditable.
    pub fn export_json(&self) -> Result<String> {
        self.record_export_marker("json");
        let integrity = self.verify_integrity();

        #[derive(Serialize)]
        struct AuditExport {
            exported_at: DateTime<Utc>,
            integrity: ExportIntegrity,
            total_entries: usize,
            entries: Vec<AuditEntry>,
        }

        let export = AuditExport {
            exported_at: Utc::now(),
            integrity: ExportIntegrity {
                valid: integrity.valid,
                pruned: integrity.pruned.then_some(true),
                verified_from: integrity.verified_from,
            },
            total_entries: self.len(),
            entries: self.entries(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Export as CSV, one row per entry.
    pub fn export_csv(&self) -> String {
        self.record_export_marker("csv");
        let mut csv = String::from("seq,timestamp,event_type,severity,module,description\n");
        for entry in self.lock().entries.iter() {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                entry.seq,
                entry.timestamp.to_rfc3339(),
                entry.event_type,
                entry.severity,
                entry.module,
                csv_escape(&entry.description),
            ));
        }
        csv
    }

    fn record_export_marker(&self, format: &str) {
        let _ = self.record(
            "export_requested",
            AuditSeverity::Info,
            "audit",
            format!("audit export in {} format", format),
            serde_json::json!({ "format": format }),
        );
    }

    fn save(&self) {
        let Some(store) = &self.persist else { return };
        let record = {
            let state = self.lock();
            PersistedAudit {
                entries: state.entries.iter().cloned().collect(),
                pruned: state.pruned,
                next_seq: state.next_seq,
            }
        };
        let result = VersionedRecord::new(record)
            .to_json()
            .and_then(|json| store.put(keys::AUDIT_ENTRIES, &json));
        if let Err(e) = result {
            self.bus.emit(ShieldEvent::StorageError {
                module: "audit".to_string(),
                operation: "persist".to_string(),
                error: e.to_string(),
            });
        }
    }

    fn load(&self) {
        let Some(store) = &self.persist else { return };
        match store.get(keys::AUDIT_ENTRIES) {
            Ok(Some(json)) => match VersionedRecord::<PersistedAudit>::from_json(&json) {
                Ok(record) => {
                    let mut state = self.lock();
                    state.entries = record.entries.into();
                    state.pruned = record.pruned;
                    state.next_seq = record.next_seq;
                }
                Err(e) => self.bus.emit(ShieldEvent::StorageError {
                    module: "audit".to_string(),
                    operation: "load".to_string(),
                    error: e.to_string(),
                }),
            },
            Ok(None) => {}
            Err(e) => self.bus.emit(ShieldEvent::StorageError {
                module: "audit".to_string(),
                operation: "load".to_string(),
                error: e.to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: corrupt a stored entry in place.
    #[cfg(test)]
    fn tamper_description(&self, seq: u64, description: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.seq == seq) {
            entry.description = description.to_string();
        }
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn log() -> AuditLog {
        AuditLog::new(AuditConfig::default(), Arc::new(EventBus::new()))
    }

    fn record_n(log: &AuditLog, n: usize) {
        for i in 0..n {
            log.record(
                "request_completed",
                AuditSeverity::Info,
                "pipeline",
                format!("request {}", i),
                json!({ "i": i }),
            );
        }
    }

    #[test]
    fn test_chain_is_valid() {
        let log = log();
        record_n(&log, 5);
        let report = log.verify_integrity();
        assert!(report.valid);
        assert!(!report.pruned);
        assert_eq!(report.first_invalid_seq, None);
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let log = log();
        assert!(log.verify_integrity().valid);
    }

    #[test]
    fn test_entries_link() {
        let log = log();
        record_n(&log, 3);
        let entries = log.entries();
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
    }

    #[test]
    fn test_tamper_detected_at_mutated_entry() {
        let log = log();
        record_n(&log, 5);
        log.tamper_description(3, "rewritten history");

        let report = log.verify_integrity();
        assert!(!report.valid);
        assert_eq!(report.first_invalid_seq, Some(3));
    }

    #[test]
    fn test_prune_keeps_suffix_verifiable() {
        let log = AuditLog::new(
            AuditConfig {
                max_entries: 10,
                ..AuditConfig::default()
            },
            Arc::new(EventBus::new()),
        );
        record_n(&log, 25);

        assert_eq!(log.len(), 10);
        let report = log.verify_integrity();
        assert!(report.valid);
        assert!(report.pruned);
        assert_eq!(report.verified_from, Some(16));
    }

    #[test]
    fn test_severity_filter_drops_before_chain() {
        let log = AuditLog::new(
            AuditConfig {
                min_severity: AuditSeverity::Warning,
                ..AuditConfig::default()
            },
            Arc::new(EventBus::new()),
        );

        assert!(log
            .record("noise", AuditSeverity::Info, "m", "d", json!({}))
            .is_none());
        assert!(log
            .record("trouble", AuditSeverity::Error, "m", "d", json!({}))
            .is_some());

        // Dropped entries never entered the chain, so it stays valid.
        assert_eq!(log.len(), 1);
        assert!(log.verify_integrity().valid);
    }

    #[test]
    fn test_event_type_filter() {
        let log = AuditLog::new(
            AuditConfig {
                ignored_types: vec!["heartbeat".to_string()],
                ..AuditConfig::default()
            },
            Arc::new(EventBus::new()),
        );
        assert!(log
            .record("heartbeat", AuditSeverity::Info, "m", "d", json!({}))
            .is_none());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_export_json_appends_marker_and_reports_integrity() {
        let log = log();
        record_n(&log, 2);
        let json = log.export_json().unwrap();

        assert!(json.contains("export_requested"));
        assert!(json.contains("\"valid\": true"));
        // 2 recorded + 1 export marker.
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_export_csv_shape() {
        let log = log();
        record_n(&log, 2);
        let csv = log.export_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "seq,timestamp,event_type,severity,module,description");
        // Header + 2 entries + export marker.
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_csv_escaping() {
        let log = log();
        log.record(
            "odd",
            AuditSeverity::Info,
            "m",
            "contains, comma and \"quotes\"",
            json!({}),
        );
        let csv = log.export_csv();
        assert!(csv.contains("\"contains, comma and \"\"quotes\"\"\""));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store = Arc::new(DebouncedStore::with_interval(
            Arc::new(crate::persist::MemoryStore::new()),
            std::time::Duration::from_millis(0),
        ));
        let bus = Arc::new(EventBus::new());

        {
            let log = AuditLog::new(AuditConfig::default(), Arc::clone(&bus))
                .with_persistence(Arc::clone(&store));
            record_n(&log, 3);
        }

        let reloaded =
            AuditLog::new(AuditConfig::default(), bus).with_persistence(store);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.verify_integrity().valid);

        // The chain continues where it left off.
        let next = reloaded
            .record("more", AuditSeverity::Info, "m", "d", json!({}))
            .unwrap();
        assert_eq!(next.seq, 4);
        assert!(reloaded.verify_integrity().valid);
    }
}
