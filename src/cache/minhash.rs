//! MinHash / LSH side-index for fuzzy prompt matching.
//!
//! Signatures are fixed-width arrays of 64-bit min-hashes over k-shingled
//! word streams, banded into buckets for sub-linear candidate retrieval.
//! Defaults (128 hashes, 32 bands x 4 rows, k=3) put the banded candidate
//! probability at Jaccard 0.85 above 0.999999, so the post-retrieval
//! similarity estimate does the real filtering.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use crate::tokens::TokenCounter;

/// Tunables for the index.
#[derive(Debug, Clone)]
pub struct MinHashConfig {
    /// Signature width. Must equal `bands * rows`.
    pub num_hashes: usize,
    /// Number of LSH bands.
    pub bands: usize,
    /// Rows per band.
    pub rows: usize,
    /// Words per shingle.
    pub shingle_k: usize,
}

impl Default for MinHashConfig {
    fn default() -> Self {
        Self {
            num_hashes: 128,
            bands: 32,
            rows: 4,
            shingle_k: 3,
        }
    }
}

/// A fuzzy match returned by [`MinHashIndex::find`].
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch<D> {
    pub data: D,
    /// Estimated Jaccard similarity in [0, 1].
    pub similarity: f64,
}

/// Index statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MinHashStats {
    pub entries: usize,
    pub buckets: usize,
}

struct IndexedEntry<D> {
    text_key: u64,
    signature: Vec<u64>,
    data: D,
}

/// Locality-sensitive index over shingled text.
pub struct MinHashIndex<D> {
    config: MinHashConfig,
    counter: TokenCounter,
    seeds: Vec<u64>,
    /// entry id -> signature + payload; ids are monotonic so larger means
    /// more recently inserted.
    entries: HashMap<u64, IndexedEntry<D>>,
    /// exact text hash -> entry id, for removal and replacement.
    by_text: HashMap<u64, u64>,
    /// (band index, band hash) -> ordered entry ids.
    buckets: HashMap<(usize, u64), BTreeSet<u64>>,
    next_id: u64,
}

impl<D: Clone> MinHashIndex<D> {
    pub fn new(config: MinHashConfig) -> Self {
        debug_assert_eq!(config.num_hashes, config.bands * config.rows);
        let seeds = (0..config.num_hashes as u64)
            .map(|i| splitmix64(0x5EED_0000_0000_0000 ^ i))
            .collect();
        Self {
            config,
            counter: TokenCounter::new(),
            seeds,
            entries: HashMap::new(),
            by_text: HashMap::new(),
            buckets: HashMap::new(),
            next_id: 0,
        }
    }

    /// Insert text with an attached payload, replacing any previous entry
    /// for the identical text.
    pub fn insert(&mut self, text: &str, data: D) {
        let text_key = text_hash(text);
        if self.by_text.contains_key(&text_key) {
            self.remove(text);
        }

        let signature = self.signature(text);
        let id = self.next_id;
        self.next_id += 1;

        for (band, band_hash) in self.band_hashes(&signature) {
            self.buckets.entry((band, band_hash)).or_default().insert(id);
        }

        self.by_text.insert(text_key, id);
        self.entries.insert(
            id,
            IndexedEntry {
                text_key,
                signature,
                data,
            },
        );
    }

    /// Find the best entry with estimated similarity >= `threshold`.
    ///
    /// Ties are broken by highest similarity, then most recent insertion.
    pub fn find(&self, text: &str, threshold: f64) -> Option<FuzzyMatch<D>> {
        let signature = self.signature(text);

        let mut candidates: BTreeSet<u64> = BTreeSet::new();
        for (band, band_hash) in self.band_hashes(&signature) {
            if let Some(ids) = self.buckets.get(&(band, band_hash)) {
                candidates.extend(ids.iter().copied());
            }
        }

        let mut best: Option<(f64, u64)> = None;
        for id in candidates {
            let entry = &self.entries[&id];
            let similarity = estimate_similarity(&signature, &entry.signature);
            if similarity < threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((s, prev_id)) => {
                    similarity > s || (similarity == s && id > prev_id)
                }
            };
            if better {
                best = Some((similarity, id));
            }
        }

        best.map(|(similarity, id)| FuzzyMatch {
            data: self.entries[&id].data.clone(),
            similarity,
        })
    }

    /// Remove the entry for exactly this text. Returns true if present.
    pub fn remove(&mut self, text: &str) -> bool {
        let text_key = text_hash(text);
        let Some(id) = self.by_text.remove(&text_key) else {
            return false;
        };
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        debug_assert_eq!(entry.text_key, text_key);

        for (band, band_hash) in self.band_hashes(&entry.signature) {
            if let Some(bucket) = self.buckets.get_mut(&(band, band_hash)) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.buckets.remove(&(band, band_hash));
                }
            }
        }
        true
    }

    pub fn stats(&self) -> MinHashStats {
        MinHashStats {
            entries: self.entries.len(),
            buckets: self.buckets.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// MinHash signature of the shingle set of `text`.
    fn signature(&self, text: &str) -> Vec<u64> {
        let shingles = self.shingles(text);
        let mut signature = vec![u64::MAX; self.config.num_hashes];
        for shingle in &shingles {
            for (i, seed) in self.seeds.iter().enumerate() {
                let h = splitmix64(shingle ^ seed);
                if h < signature[i] {
                    signature[i] = h;
                }
            }
        }
        signature
    }

    /// Hashed k-shingles of the word stream. Texts shorter than k words
    /// contribute a single whole-text shingle so they still index.
    fn shingles(&self, text: &str) -> Vec<u64> {
        let words = self.counter.words(text);
        if words.len() < self.config.shingle_k {
            return vec![text_hash(&words.join(" "))];
        }
        words
            .windows(self.config.shingle_k)
            .map(|w| text_hash(&w.join(" ")))
            .collect()
    }

    fn band_hashes(&self, signature: &[u64]) -> Vec<(usize, u64)> {
        signature
            .chunks(self.config.rows)
            .enumerate()
            .map(|(band, rows)| {
                let mut h = 0xCBF2_9CE4_8422_2325u64;
                for v in rows {
                    h = splitmix64(h ^ v);
                }
                (band, h)
            })
            .collect()
    }
}

impl<D: Clone> Default for MinHashIndex<D> {
    fn default() -> Self {
        Self::new(MinHashConfig::default())
    }
}

/// Fraction of agreeing signature components: an unbiased Jaccard estimate.
fn estimate_similarity(a: &[u64], b: &[u64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let equal = a.iter().zip(b).filter(|(x, y)| x == y).count();
    equal as f64 / a.len() as f64
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// 64-bit finalizer from the splitmix64 generator.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> MinHashIndex<String> {
        MinHashIndex::new(MinHashConfig::default())
    }

    #[test]
    fn test_identical_text_full_similarity() {
        let mut idx = index();
        idx.insert("what is the capital of france", "fp1".to_string());

        let m = idx.find("what is the capital of france", 0.99).unwrap();
        assert_eq!(m.data, "fp1");
        assert!((m.similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_near_duplicate_found() {
        let mut idx = index();
        idx.insert(
            "please summarize the quarterly sales report for the emea region in detail",
            "fp1".to_string(),
        );

        // One word changed out of twelve: most shingles survive.
        let m = idx.find(
            "please summarize the quarterly sales report for the apac region in detail",
            0.5,
        );
        assert!(m.is_some());
    }

    #[test]
    fn test_unrelated_text_not_found() {
        let mut idx = index();
        idx.insert("what is the capital of france", "fp1".to_string());

        let m = idx.find("write a haiku about rust lifetimes today", 0.85);
        assert!(m.is_none());
    }

    #[test]
    fn test_remove() {
        let mut idx = index();
        idx.insert("some cached prompt text here", "fp1".to_string());
        assert_eq!(idx.len(), 1);

        assert!(idx.remove("some cached prompt text here"));
        assert!(!idx.remove("some cached prompt text here"));
        assert!(idx.is_empty());
        assert!(idx.find("some cached prompt text here", 0.5).is_none());
        assert_eq!(idx.stats().buckets, 0);
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut idx = index();
        idx.insert("the same prompt text", "fp1".to_string());
        idx.insert("the same prompt text", "fp2".to_string());
        assert_eq!(idx.len(), 1);

        let m = idx.find("the same prompt text", 0.99).unwrap();
        assert_eq!(m.data, "fp2");
    }

    #[test]
    fn test_short_text_still_indexes() {
        let mut idx = index();
        idx.insert("hi", "fp1".to_string());
        let m = idx.find("hi", 0.99).unwrap();
        assert_eq!(m.data, "fp1");
    }

    #[test]
    fn test_best_match_wins() {
        let mut idx = index();
        idx.insert(
            "explain the borrow checker rules for mutable references in rust",
            "close".to_string(),
        );
        idx.insert(
            "explain the borrow checker rules for shared references in java today",
            "far".to_string(),
        );

        let m = idx
            .find(
                "explain the borrow checker rules for mutable references in rust",
                0.5,
            )
            .unwrap();
        assert_eq!(m.data, "close");
    }

    #[test]
    fn test_stats() {
        let mut idx = index();
        assert_eq!(idx.stats(), MinHashStats::default());
        idx.insert("first entry text goes here", "a".to_string());
        let stats = idx.stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.buckets > 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The similarity estimate is symmetric and bounded.
            #[test]
            fn similarity_estimate_bounded(
                a in proptest::collection::vec(any::<u64>(), 16),
                b in proptest::collection::vec(any::<u64>(), 16),
            ) {
                let s1 = estimate_similarity(&a, &b);
                let s2 = estimate_similarity(&b, &a);
                prop_assert!((0.0..=1.0).contains(&s1));
                prop_assert!((s1 - s2).abs() < 1e-12);
            }

            // Inserted text is always findable at full similarity.
            #[test]
            fn self_similarity_is_one(words in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
                let text = words.join(" ");
                let mut idx = MinHashIndex::new(MinHashConfig::default());
                idx.insert(&text, ());
                let m = idx.find(&text, 0.999);
                prop_assert!(m.is_some());
            }
        }
    }
}
