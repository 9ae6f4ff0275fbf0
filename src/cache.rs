//! Content-addressed cache of test-execution outcomes.
//!
//! Entries are keyed by a `Fingerprint` over the submitted code and test files.
//! Eviction is least-recently-used, bounded both by entry count and by total
//! byte size; whichever limit is crossed first triggers eviction. A reverse
//! index from feature id to fingerprints supports explicit invalidation when a
//! feature's code changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::collab::{SourceFiles, TestRunResult};

/// Deterministic hash identifying a (code, tests) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash code and test files. Independent of map insertion order; code and
    /// test files with identical paths hash differently.
    pub fn compute(code: &SourceFiles, tests: &SourceFiles) -> Self {
        let mut hasher = Sha256::new();
        for (section, files) in [("code", code), ("tests", tests)] {
            hasher.update(section.as_bytes());
            hasher.update([0u8]);
            for (path, content) in files {
                hasher.update(path.as_bytes());
                hasher.update([0u8]);
                hasher.update((content.len() as u64).to_le_bytes());
                hasher.update(content.as_bytes());
            }
            hasher.update([0xffu8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cached test outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: TestRunResult,
    pub created_at: DateTime<Utc>,
    pub feature_id: String,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn estimate_size(fingerprint: &Fingerprint, result: &TestRunResult, feature_id: &str) -> usize {
        fingerprint.as_str().len()
            + feature_id.len()
            + result.raw_output.len()
            + std::mem::size_of::<TestRunResult>()
    }
}

/// Cache capacity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Result of a cache lookup that may be bypassed.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    /// The caller expects a failing run; the cache was not consulted.
    Bypassed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl CacheStats {
    /// Hit rate over non-bypassed lookups, in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    last_used: u64,
    /// Features indexed to this entry, including the owner.
    lineage: Vec<String>,
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: HashMap<Fingerprint, Slot>,
    recency: BTreeMap<u64, Fingerprint>,
    by_feature: HashMap<String, HashSet<Fingerprint>>,
    total_bytes: usize,
    tick: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(fingerprint)?;
        self.recency.remove(&slot.last_used);
        slot.last_used = tick;
        self.recency.insert(tick, fingerprint.clone());
        Some(slot.entry.clone())
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.recency.remove(&slot.last_used);
        for feature in &slot.lineage {
            if let Some(set) = self.by_feature.get_mut(feature) {
                set.remove(fingerprint);
                if set.is_empty() {
                    self.by_feature.remove(feature);
                }
            }
        }
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot)
    }

    fn over_limit(&self, config: &CacheConfig) -> bool {
        self.slots.len() > config.max_entries || self.total_bytes > config.max_bytes
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.recency.iter().next().map(|(t, f)| (*t, f.clone()))?;
        self.remove(&fingerprint);
        self.stats.evictions += 1;
        Some(fingerprint)
    }
}

/// Thread-safe LRU cache of test outcomes.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry, marking it most recently used on a hit.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let found = inner.touch(fingerprint);
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    /// Look up an entry unless the caller expects the tests to fail. RED
    /// validation must observe a real failing run, so it never reads the cache.
    pub fn lookup(&self, fingerprint: &Fingerprint, expect_failure: bool) -> CacheLookup {
        if expect_failure {
            self.lock().stats.bypasses += 1;
            return CacheLookup::Bypassed;
        }
        match self.get(fingerprint) {
            Some(entry) => CacheLookup::Hit(entry),
            None => CacheLookup::Miss,
        }
    }

    /// Whether an entry exists, without touching recency or stats.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().slots.contains_key(fingerprint)
    }

    /// Store a result owned by `feature_id`. Returns false when the entry is
    /// larger than the whole cache and was not admitted.
    pub fn put(&self, fingerprint: Fingerprint, result: TestRunResult, feature_id: &str) -> bool {
        self.put_with_lineage(fingerprint, result, feature_id, &[])
    }

    /// Store a result and index it under the owner and every feature whose
    /// code contributed to the fingerprint, so invalidating any of them drops it.
    pub fn put_with_lineage(
        &self,
        fingerprint: Fingerprint,
        result: TestRunResult,
        feature_id: &str,
        lineage: &[String],
    ) -> bool {
        let size_bytes = CacheEntry::estimate_size(&fingerprint, &result, feature_id);
        if self.config.max_entries == 0 || size_bytes > self.config.max_bytes {
            tracing::debug!(
                feature = feature_id,
                fingerprint = fingerprint.short(),
                size_bytes,
                "cache entry not admitted"
            );
            return false;
        }

        let mut inner = self.lock();
        inner.remove(&fingerprint);

        let mut features = vec![feature_id.to_string()];
        for id in lineage {
            if !features.contains(id) {
                features.push(id.clone());
            }
        }
        for id in &features {
            inner
                .by_feature
                .entry(id.clone())
                .or_default()
                .insert(fingerprint.clone());
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, fingerprint.clone());
        inner.total_bytes += size_bytes;
        inner.slots.insert(
            fingerprint.clone(),
            Slot {
                entry: CacheEntry {
                    fingerprint,
                    result,
                    created_at: Utc::now(),
                    feature_id: feature_id.to_string(),
                    size_bytes,
                },
                last_used: tick,
                lineage: features,
            },
        );

        while inner.over_limit(&self.config) {
            match inner.evict_lru() {
                Some(evicted) => {
                    tracing::debug!(fingerprint = evicted.short(), "cache entry evicted");
                }
                None => break,
            }
        }

        true
    }

    /// Drop every entry whose fingerprint traces through `feature_id`'s code.
    pub fn invalidate(&self, feature_id: &str) -> usize {
        let mut inner = self.lock();
        let Some(fingerprints) = inner.by_feature.remove(feature_id) else {
            return 0;
        };

        let mut removed = 0;
        for fingerprint in fingerprints {
            if inner.remove(&fingerprint).is_some() {
                removed += 1;
            }
        }
        inner.stats.invalidations += removed as u64;
        if removed > 0 {
            tracing::debug!(feature = feature_id, removed, "cache entries invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let stats = inner.stats;
        *inner = CacheInner {
            stats,
            ..CacheInner::default()
        };
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.slots.len(),
            bytes: inner.total_bytes,
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn files(pairs: &[(&str, &str)]) -> SourceFiles {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    fn result(passed: bool, output: &str) -> TestRunResult {
        TestRunResult {
            passed,
            raw_output: output.to_string(),
            duration_ms: 10,
            coverage_percent: None,
        }
    }

    fn small_cache(max_entries: usize) -> ResultCache {
        ResultCache::new(CacheConfig {
            max_entries,
            max_bytes: 1024 * 1024,
        })
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let code = files(&[("a.py", "x = 1"), ("b.py", "y = 2")]);
        let tests = files(&[("test_a.py", "assert x == 1")]);

        let a = Fingerprint::compute(&code, &tests);
        let b = Fingerprint::compute(&code, &tests);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_separates_code_from_tests() {
        let x = files(&[("a.py", "x = 1")]);
        let empty = SourceFiles::new();
        assert_ne!(
            Fingerprint::compute(&x, &empty),
            Fingerprint::compute(&empty, &x)
        );
        assert_ne!(
            Fingerprint::compute(&x, &empty),
            Fingerprint::compute(&files(&[("a.py", "x = 2")]), &empty)
        );
    }

    #[test]
    fn test_put_then_get() {
        let cache = small_cache(4);
        let fp = Fingerprint::from("fp-1");

        assert!(cache.put(fp.clone(), result(true, "3 passed"), "auth"));
        let entry = cache.get(&fp).unwrap();
        assert!(entry.result.passed);
        assert_eq!(entry.feature_id, "auth");
        assert!(cache.get(&Fingerprint::from("fp-2")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let cache = small_cache(3);
        for i in 0..3 {
            cache.put(Fingerprint::from(format!("fp-{}", i).as_str()), result(true, ""), "f");
        }

        // Touch fp-0 so fp-1 becomes least recently used.
        assert!(cache.get(&Fingerprint::from("fp-0")).is_some());
        cache.put(Fingerprint::from("fp-3"), result(true, ""), "f");

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&Fingerprint::from("fp-0")));
        assert!(!cache.contains(&Fingerprint::from("fp-1")));
        assert!(cache.contains(&Fingerprint::from("fp-3")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_eviction_by_bytes() {
        let entry_size =
            CacheEntry::estimate_size(&Fingerprint::from("fp-0"), &result(true, &"x".repeat(100)), "f");
        let cache = ResultCache::new(CacheConfig {
            max_entries: 100,
            max_bytes: entry_size * 2,
        });

        for i in 0..3 {
            cache.put(
                Fingerprint::from(format!("fp-{}", i).as_str()),
                result(true, &"x".repeat(100)),
                "f",
            );
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&Fingerprint::from("fp-0")));
        assert!(cache.stats().bytes <= entry_size * 2);
    }

    #[test]
    fn test_oversized_entry_not_admitted() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 10,
            max_bytes: 64,
        });
        assert!(!cache.put(Fingerprint::from("big"), result(false, &"E".repeat(500)), "f"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replacing_entry_keeps_byte_accounting() {
        let cache = small_cache(4);
        let fp = Fingerprint::from("fp");
        cache.put(fp.clone(), result(false, "long failure output"), "f");
        cache.put(fp.clone(), result(true, "ok"), "f");

        assert_eq!(cache.len(), 1);
        let expected = CacheEntry::estimate_size(&fp, &result(true, "ok"), "f");
        assert_eq!(cache.stats().bytes, expected);
    }

    #[test]
    fn test_lookup_bypassed_when_expecting_failure() {
        let cache = small_cache(4);
        let fp = Fingerprint::from("fp");
        cache.put(fp.clone(), result(true, "passed"), "f");

        assert_eq!(cache.lookup(&fp, true), CacheLookup::Bypassed);
        assert!(matches!(cache.lookup(&fp, false), CacheLookup::Hit(_)));
        assert_eq!(
            cache.lookup(&Fingerprint::from("other"), false),
            CacheLookup::Miss
        );

        let stats = cache.stats();
        assert_eq!(stats.bypasses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidate_by_owner_and_lineage() {
        let cache = small_cache(10);
        cache.put(Fingerprint::from("base"), result(true, ""), "base");
        cache.put_with_lineage(
            Fingerprint::from("api"),
            result(true, ""),
            "api",
            &["base".to_string()],
        );
        cache.put(Fingerprint::from("ui"), result(true, ""), "ui");

        assert_eq!(cache.invalidate("base"), 2);
        assert!(!cache.contains(&Fingerprint::from("api")));
        assert!(cache.contains(&Fingerprint::from("ui")));

        // Reverse index entries are cleaned up with the slot.
        assert_eq!(cache.invalidate("api"), 0);
        assert_eq!(cache.invalidate("missing"), 0);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = small_cache(4);
        cache.put(Fingerprint::from("fp"), result(true, ""), "f");
        cache.get(&Fingerprint::from("fp"));
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(small_cache(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let fp = Fingerprint::from(format!("{}-{}", t, i).as_str());
                        cache.put(fp.clone(), result(true, ""), &format!("f{}", t));
                        assert!(cache.get(&fp).is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
        assert_eq!(cache.invalidate("f3"), 50);
        assert_eq!(cache.len(), 350);
    }
}
