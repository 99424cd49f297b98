//! Key-value persistence behind a storage trait.
//!
//! Subsystems persist JSON values under stable string keys
//! (`ledger:entries`, `audit:entries`, `breaker:state`,
//! `userBudget:<userId>`, `cache:<fingerprint>`). Values carry a leading
//! `schema_version`. Storage failures are surfaced as `storage:error`
//! events by the calling subsystem and never block the hot path.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Current on-disk schema version for all persisted records.
pub const SCHEMA_VERSION: u32 = 1;

/// JSON framing for persisted values: `{"schema_version":1,"data":...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRecord<T> {
    pub schema_version: u32,
    pub data: T,
}

impl<T: Serialize> VersionedRecord<T> {
    pub fn new(data: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            data,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> VersionedRecord<T> {
    /// Parse a persisted value, rejecting newer schema versions.
    pub fn from_json(json: &str) -> Result<T> {
        let record: VersionedRecord<T> = serde_json::from_str(json)?;
        if record.schema_version > SCHEMA_VERSION {
            return Err(Error::persistence(format!(
                "unsupported schema version {}",
                record.schema_version
            )));
        }
        Ok(record.data)
    }
}

/// Synchronous key-value storage.
///
/// Intentionally not async: terminal stream accounting runs from `Drop`,
/// so everything it reaches must be callable without an executor.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::persistence(e.to_string()))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::persistence(e.to_string()))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS shield_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::persistence(e.to_string()))?;
        Ok(())
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::persistence(e.to_string()))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM shield_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shield_kv (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM shield_kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM shield_kv WHERE key LIKE ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![format!("{}%", prefix)], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(keys)
        })
    }
}

/// In-memory store, used in tests and as the persistence-off backend.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Write-coalescing wrapper around a [`KvStore`].
///
/// Repeated writes to the same key within the debounce interval overwrite
/// the pending value; at most one physical write per key per interval
/// reaches the backing store. `flush` forces everything out, and is called
/// by the engine's `dispose`.
pub struct DebouncedStore {
    inner: Arc<dyn KvStore>,
    interval: Duration,
    state: Mutex<DebounceState>,
}

struct DebounceState {
    pending: HashMap<String, String>,
    last_flush: Instant,
}

impl DebouncedStore {
    /// Default coalescing window.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self::with_interval(inner, Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(inner: Arc<dyn KvStore>, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            state: Mutex::new(DebounceState {
                pending: HashMap::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Queue a write; flushes the whole pending set once the interval from
    /// the previous flush has elapsed.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let due = {
            let mut state = self.lock();
            state.pending.insert(key.to_string(), value.to_string());
            if state.last_flush.elapsed() >= self.interval {
                state.last_flush = Instant::now();
                Some(std::mem::take(&mut state.pending))
            } else {
                None
            }
        };

        if let Some(pending) = due {
            self.write_all(pending)?;
        }
        Ok(())
    }

    /// Read through: pending value wins over the backing store.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(v) = self.lock().pending.get(key) {
            return Ok(Some(v.clone()));
        }
        self.inner.get(key)
    }

    /// Drop any pending write for `key` and delete it from the backing store.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.lock().pending.remove(key);
        self.inner.delete(key)
    }

    /// Keys visible through this wrapper: backing-store keys plus pending
    /// unflushed ones.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.inner.keys(prefix)?;
        {
            let state = self.lock();
            for key in state.pending.keys() {
                if key.starts_with(prefix) && !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Force out all pending writes.
    pub fn flush(&self) -> Result<()> {
        let pending = {
            let mut state = self.lock();
            state.last_flush = Instant::now();
            std::mem::take(&mut state.pending)
        };
        self.write_all(pending)
    }

    /// Number of queued, unflushed writes.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn write_all(&self, pending: HashMap<String, String>) -> Result<()> {
        for (key, value) in pending {
            self.inner.put(&key, &value)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stable persistence keys.
pub mod keys {
    pub const LEDGER_ENTRIES: &str = "ledger:entries";
    pub const AUDIT_ENTRIES: &str = "audit:entries";
    pub const BREAKER_STATE: &str = "breaker:state";

    pub fn user_budget(user_id: &str) -> String {
        format!("userBudget:{}", user_id)
    }

    pub fn cache_entry(fingerprint: &str) -> String {
        format!("cache:{}", fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_memory_store_prefix_keys() {
        let store = MemoryStore::new();
        store.put("userBudget:u1", "{}").unwrap();
        store.put("userBudget:u2", "{}").unwrap();
        store.put("ledger:entries", "[]").unwrap();

        let keys = store.keys("userBudget:").unwrap();
        assert_eq!(keys, vec!["userBudget:u1", "userBudget:u2"]);
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("breaker:state", "{\"spent\":1.0}").unwrap();
        assert_eq!(
            store.get("breaker:state").unwrap(),
            Some("{\"spent\":1.0}".to_string())
        );

        store.put("breaker:state", "{\"spent\":2.0}").unwrap();
        assert_eq!(
            store.get("breaker:state").unwrap(),
            Some("{\"spent\":2.0}".to_string())
        );
    }

    #[test]
    fn test_sqlite_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shield.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("k", "v").unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_versioned_record_roundtrip() {
        let json = VersionedRecord::new(vec![1u32, 2, 3]).to_json().unwrap();
        assert!(json.contains("\"schema_version\":1"));
        let data: Vec<u32> = VersionedRecord::from_json(&json).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_versioned_record_rejects_future_schema() {
        let json = "{\"schema_version\":99,\"data\":[]}";
        let result: Result<Vec<u32>> = VersionedRecord::from_json(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_debounce_coalesces_writes() {
        let inner = Arc::new(MemoryStore::new());
        let store =
            DebouncedStore::with_interval(Arc::clone(&inner) as Arc<dyn KvStore>, Duration::from_secs(60));

        store.put("k", "1").unwrap();
        store.put("k", "2").unwrap();
        // Nothing has reached the backing store yet.
        assert_eq!(inner.get("k").unwrap(), None);
        // Read-through still sees the latest pending value.
        assert_eq!(store.get("k").unwrap(), Some("2".to_string()));

        store.flush().unwrap();
        assert_eq!(inner.get("k").unwrap(), Some("2".to_string()));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_debounce_flushes_after_interval() {
        let inner = Arc::new(MemoryStore::new());
        let store = DebouncedStore::with_interval(
            Arc::clone(&inner) as Arc<dyn KvStore>,
            Duration::from_millis(0),
        );

        store.put("k", "1").unwrap();
        assert_eq!(inner.get("k").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(keys::user_budget("u1"), "userBudget:u1");
        assert_eq!(keys::cache_entry("abc"), "cache:abc");
    }
}
