//! Fuzzy response cache with at-most-once build per fingerprint.
//!
//! Prompts are normalized (lowercased, whitespace-collapsed, terminal
//! punctuation stripped) and fingerprinted with SHA-256. Lookup tries an
//! exact fingerprint hit first, then the MinHash side-index for a fuzzy
//! match at or above the similarity threshold. Entries are LRU-evicted and
//! TTL-expired lazily.
//!
//! While a build for a fingerprint is in flight, sibling lookups for the
//! same fingerprint wait on the build instead of issuing a duplicate model
//! call; the leader resolves them on store or failure, and an abandoned
//! permit resolves them on drop.

pub mod minhash;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::persist::{keys, DebouncedStore, VersionedRecord};

pub use minhash::{FuzzyMatch, MinHashConfig, MinHashIndex, MinHashStats};

/// How a lookup matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// Cache sizing and matching configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry cap across all scopes; least-recently-used entries evict first.
    pub max_entries: usize,
    /// Entry lifetime. `None` disables expiry.
    pub ttl: Option<Duration>,
    /// Minimum Jaccard estimate for a fuzzy hit.
    pub similarity_threshold: f64,
    /// Key entries per model id instead of globally.
    pub scope_by_model: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Some(Duration::hours(1)),
            similarity_threshold: 0.85,
            scope_by_model: true,
        }
    }
}

/// A successful cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub text: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub match_type: MatchType,
    pub similarity: Option<f64>,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
    pub pending_builds: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.fuzzy_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.fuzzy_hits) as f64 / total as f64
        }
    }
}

/// Progress of an in-flight build, broadcast to waiting siblings.
#[derive(Debug, Clone)]
pub enum BuildState {
    Pending,
    /// `None` means the build failed; waiters fall through to their own call.
    Done(Option<CacheHit>),
}

/// Outcome of [`ResponseCache::lookup_or_build`].
pub enum BuildTicket {
    /// The response was already cached.
    Hit(CacheHit),
    /// Caller owns the build; it must resolve the permit.
    Leader(BuildPermit),
    /// Another caller owns the build; wait on the receiver.
    Follower(watch::Receiver<BuildState>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    scope: String,
    fingerprint: String,
    normalized: String,
    model_id: String,
    text: String,
    input_tokens: u64,
    output_tokens: u64,
    created_at: DateTime<Utc>,
    hit_count: u64,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    fingerprint: String,
    normalized: String,
    model_id: String,
    text: String,
    input_tokens: u64,
    output_tokens: u64,
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    hit_count: u64,
}

impl StoredEntry {
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            Some(ttl) => now - self.created_at > ttl,
            None => false,
        }
    }

    fn to_hit(&self, match_type: MatchType, similarity: Option<f64>) -> CacheHit {
        CacheHit {
            text: self.text.clone(),
            model_id: self.model_id.clone(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            match_type,
            similarity,
        }
    }
}

#[derive(Default)]
struct Scope {
    entries: HashMap<String, StoredEntry>,
    index: MinHashIndex<String>,
}

struct CacheInner {
    scopes: HashMap<String, Scope>,
    pending: HashMap<(String, String), watch::Sender<BuildState>>,
    hits: u64,
    fuzzy_hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheShared {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    persist: Option<Arc<DebouncedStore>>,
}

/// The response cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResponseCache {
    shared: Arc<CacheShared>,
}

/// Normalize prompt text for fingerprinting: lowercase, collapse
/// whitespace, strip terminal punctuation.
pub fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();
    lowered
        .trim_end_matches(['.', '!', '?'])
        .trim_end()
        .to_string()
}

/// SHA-256 fingerprint of normalized prompt text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                config,
                inner: Mutex::new(CacheInner {
                    scopes: HashMap::new(),
                    pending: HashMap::new(),
                    hits: 0,
                    fuzzy_hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
                persist: None,
            }),
        }
    }

    /// Build a cache that writes entries through to persistent storage and
    /// reloads surviving entries on construction.
    pub fn with_persistence(config: CacheConfig, store: Arc<DebouncedStore>) -> Self {
        let cache = Self {
            shared: Arc::new(CacheShared {
                config,
                inner: Mutex::new(CacheInner {
                    scopes: HashMap::new(),
                    pending: HashMap::new(),
                    hits: 0,
                    fuzzy_hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
                persist: Some(store),
            }),
        };
        cache.shared.load_persisted();
        cache
    }

    /// Look up a prompt. Exact fingerprint match wins; otherwise the best
    /// fuzzy candidate at or above the similarity threshold.
    pub fn lookup(&self, prompt: &str, model_id: &str) -> Option<CacheHit> {
        self.shared.lookup(prompt, model_id)
    }

    /// Look up, and on a miss either claim the build or join the in-flight
    /// one for the same fingerprint.
    pub fn lookup_or_build(&self, prompt: &str, model_id: &str) -> BuildTicket {
        let scope = self.shared.scope_key(model_id);
        let fp = fingerprint(prompt);

        if let Some(hit) = self.shared.lookup(prompt, model_id) {
            return BuildTicket::Hit(hit);
        }

        let mut inner = self.shared.lock();
        let key = (scope.clone(), fp.clone());
        if let Some(tx) = inner.pending.get(&key) {
            return BuildTicket::Follower(tx.subscribe());
        }

        let (tx, _rx) = watch::channel(BuildState::Pending);
        inner.pending.insert(key, tx);
        drop(inner);

        BuildTicket::Leader(BuildPermit {
            shared: Arc::clone(&self.shared),
            scope,
            fingerprint: fp,
            prompt: prompt.to_string(),
            model_id: model_id.to_string(),
            resolved: false,
        })
    }

    /// Store a completed response. Fire-and-forget: storage problems
    /// degrade to a warning, never an error on the request path.
    pub fn store(
        &self,
        prompt: &str,
        response_text: &str,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.shared
            .store(prompt, response_text, model_id, input_tokens, output_tokens);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.lock();
        CacheStats {
            hits: inner.hits,
            fuzzy_hits: inner.fuzzy_hits,
            misses: inner.misses,
            entries: inner.scopes.values().map(|s| s.entries.len()).sum(),
            evictions: inner.evictions,
            pending_builds: inner.pending.len(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.shared.lock();
        inner.scopes.clear();
    }
}

impl CacheShared {
    fn scope_key(&self, model_id: &str) -> String {
        if self.config.scope_by_model {
            model_id.to_string()
        } else {
            "global".to_string()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, prompt: &str, model_id: &str) -> Option<CacheHit> {
        let scope_key = self.scope_key(model_id);
        let normalized = normalize(prompt);
        let fp = fingerprint(prompt);
        let now = Utc::now();
        let ttl = self.config.ttl;

        let mut hit: Option<CacheHit> = None;
        let mut lazily_evicted: Vec<String> = Vec::new();

        let mut inner = self.lock();
        if let Some(scope) = inner.scopes.get_mut(&scope_key) {
            // Exact fingerprint hit.
            let exact_expired = scope
                .entries
                .get(&fp)
                .is_some_and(|e| e.is_expired(ttl, now));
            if exact_expired {
                Self::evict_entry(scope, &fp);
                lazily_evicted.push(fp.clone());
            } else if let Some(entry) = scope.entries.get_mut(&fp) {
                entry.last_access = now;
                entry.hit_count += 1;
                hit = Some(entry.to_hit(MatchType::Exact, None));
            }

            // Fuzzy candidate from the MinHash index.
            if hit.is_none() {
                if let Some(m) = scope
                    .index
                    .find(&normalized, self.config.similarity_threshold)
                {
                    let candidate = m.data;
                    let candidate_expired = scope
                        .entries
                        .get(&candidate)
                        .is_some_and(|e| e.is_expired(ttl, now));
                    if candidate_expired {
                        Self::evict_entry(scope, &candidate);
                        lazily_evicted.push(candidate);
                    } else if let Some(entry) = scope.entries.get_mut(&candidate) {
                        entry.last_access = now;
                        entry.hit_count += 1;
                        hit = Some(entry.to_hit(MatchType::Fuzzy, Some(m.similarity)));
                    }
                }
            }
        }

        inner.evictions += lazily_evicted.len() as u64;
        match &hit {
            Some(h) if h.match_type == MatchType::Exact => inner.hits += 1,
            Some(_) => inner.fuzzy_hits += 1,
            None => inner.misses += 1,
        }
        drop(inner);

        for fp in lazily_evicted {
            self.delete_persisted(&fp);
        }
        hit
    }

    fn store(
        &self,
        prompt: &str,
        response_text: &str,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let scope_key = self.scope_key(model_id);
        let normalized = normalize(prompt);
        let fp = fingerprint(prompt);
        let now = Utc::now();

        let entry = StoredEntry {
            fingerprint: fp.clone(),
            normalized: normalized.clone(),
            model_id: model_id.to_string(),
            text: response_text.to_string(),
            input_tokens,
            output_tokens,
            created_at: now,
            last_access: now,
            hit_count: 0,
        };

        let evicted = {
            let mut inner = self.lock();
            let evicted = self.evict_to_capacity(&mut inner);

            let scope = inner.scopes.entry(scope_key).or_default();
            scope.index.insert(&normalized, fp.clone());
            scope.entries.insert(fp.clone(), entry.clone());
            evicted
        };

        for evicted_fp in evicted {
            self.delete_persisted(&evicted_fp);
        }
        self.persist_entry(&entry);
    }

    /// Make room for one insertion. Returns evicted fingerprints.
    fn evict_to_capacity(&self, inner: &mut CacheInner) -> Vec<String> {
        let mut evicted = Vec::new();
        loop {
            let total: usize = inner.scopes.values().map(|s| s.entries.len()).sum();
            if total < self.config.max_entries {
                break;
            }
            // LRU by last_access across scopes.
            let victim = inner
                .scopes
                .iter()
                .flat_map(|(scope_key, scope)| {
                    scope
                        .entries
                        .values()
                        .map(move |e| (scope_key.clone(), e.fingerprint.clone(), e.last_access))
                })
                .min_by_key(|(_, _, last)| *last);

            let Some((scope_key, fp, _)) = victim else {
                break;
            };
            if let Some(scope) = inner.scopes.get_mut(&scope_key) {
                Self::evict_entry(scope, &fp);
            }
            inner.evictions += 1;
            evicted.push(fp);
        }
        evicted
    }

    fn evict_entry(scope: &mut Scope, fp: &str) {
        if let Some(entry) = scope.entries.remove(fp) {
            scope.index.remove(&entry.normalized);
        }
    }

    fn resolve_pending(&self, scope: &str, fp: &str, state: BuildState) {
        let tx = {
            let mut inner = self.lock();
            inner.pending.remove(&(scope.to_string(), fp.to_string()))
        };
        if let Some(tx) = tx {
            // Waiters may have gone away; a closed channel is fine.
            let _ = tx.send(state);
        }
    }

    fn persist_entry(&self, entry: &StoredEntry) {
        let Some(store) = &self.persist else { return };
        let record = PersistedEntry {
            scope: self.scope_key(&entry.model_id),
            fingerprint: entry.fingerprint.clone(),
            normalized: entry.normalized.clone(),
            model_id: entry.model_id.clone(),
            text: entry.text.clone(),
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            created_at: entry.created_at,
            hit_count: entry.hit_count,
        };
        let result = VersionedRecord::new(record)
            .to_json()
            .and_then(|json| store.put(&keys::cache_entry(&entry.fingerprint), &json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "cache persistence write failed");
        }
    }

    fn delete_persisted(&self, fp: &str) {
        let Some(store) = &self.persist else { return };
        if let Err(e) = store.delete(&keys::cache_entry(fp)) {
            tracing::warn!(error = %e, "cache persistence delete failed");
        }
    }

    /// Best-effort reload of surviving entries at construction. Unreadable
    /// records are skipped; expired ones are dropped on first lookup.
    fn load_persisted(&self) {
        let Some(store) = &self.persist else { return };
        let entry_keys = match store.keys("cache:") {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "cache persistence reload failed");
                return;
            }
        };

        let mut inner = self.lock();
        for key in entry_keys {
            let Ok(Some(json)) = store.get(&key) else {
                continue;
            };
            let Ok(record) = VersionedRecord::<PersistedEntry>::from_json(&json) else {
                tracing::warn!(key, "skipping unreadable cache record");
                continue;
            };
            let scope = inner.scopes.entry(record.scope.clone()).or_default();
            scope
                .index
                .insert(&record.normalized, record.fingerprint.clone());
            scope.entries.insert(
                record.fingerprint.clone(),
                StoredEntry {
                    fingerprint: record.fingerprint,
                    normalized: record.normalized,
                    model_id: record.model_id,
                    text: record.text,
                    input_tokens: record.input_tokens,
                    output_tokens: record.output_tokens,
                    created_at: record.created_at,
                    last_access: record.created_at,
                    hit_count: record.hit_count,
                },
            );
        }
    }
}

/// Exclusive right to build the response for one fingerprint.
///
/// Resolve with [`BuildPermit::complete`] on success or
/// [`BuildPermit::fail`] on provider failure. Dropping an unresolved
/// permit releases waiting siblings with a failed-build signal.
pub struct BuildPermit {
    shared: Arc<CacheShared>,
    scope: String,
    fingerprint: String,
    prompt: String,
    model_id: String,
    resolved: bool,
}

impl BuildPermit {
    /// Store the built response and wake all waiting siblings with a hit.
    pub fn complete(mut self, response_text: &str, input_tokens: u64, output_tokens: u64) {
        self.resolved = true;
        self.shared.store(
            &self.prompt,
            response_text,
            &self.model_id,
            input_tokens,
            output_tokens,
        );
        let hit = CacheHit {
            text: response_text.to_string(),
            model_id: self.model_id.clone(),
            input_tokens,
            output_tokens,
            match_type: MatchType::Exact,
            similarity: None,
        };
        self.shared
            .resolve_pending(&self.scope, &self.fingerprint, BuildState::Done(Some(hit)));
    }

    /// Wake waiting siblings without storing anything.
    pub fn fail(mut self) {
        self.resolved = true;
        self.shared
            .resolve_pending(&self.scope, &self.fingerprint, BuildState::Done(None));
    }
}

impl std::fmt::Debug for BuildPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildPermit")
            .field("scope", &self.scope)
            .field("fingerprint", &self.fingerprint)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared
                .resolve_pending(&self.scope, &self.fingerprint, BuildState::Done(None));
        }
    }
}
