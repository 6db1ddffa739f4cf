use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::storage::KeyValueStore;
use crate::sweep::{spawn_periodic, SweepHandle};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Prefix shared by every durable-tier key.
pub const DURABLE_PREFIX: &str = "cache_";

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_\s]").unwrap());

/// A stored generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub hits: u64,
    pub user_id: String,
    pub briefing_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// Normalize a briefing the way cache keys are derived: lower-case, trim,
/// collapse whitespace, then drop anything that is not an ASCII word char or
/// whitespace.
pub fn normalize_briefing(briefing: &str) -> String {
    let lowered = briefing.to_lowercase();
    let collapsed = WHITESPACE_RE.replace_all(lowered.trim(), " ");
    NON_WORD_RE.replace_all(&collapsed, "").into_owned()
}

/// Short, non-cryptographic key for a briefing. Different briefings may collide.
pub fn briefing_hash(briefing: &str) -> String {
    let normalized = normalize_briefing(briefing);
    let mut hash: i32 = 0;
    for unit in normalized.encode_utf16() {
        hash = (hash << 5).wrapping_sub(hash).wrapping_add(unit as i32);
    }
    to_base36((hash as i64).unsigned_abs())
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Bag-of-words Jaccard score over single-space tokens.
///
/// The intersection counts every token of `a` that appears in `b`, duplicates
/// included; the union is the distinct token set of both.
pub fn word_similarity(a: &str, b: &str) -> f64 {
    let words_a: Vec<&str> = a.split(' ').collect();
    let words_b: Vec<&str> = b.split(' ').collect();

    let intersection = words_a.iter().filter(|w| words_b.contains(w)).count();
    let union: HashSet<&str> = words_a.iter().chain(words_b.iter()).copied().collect();

    intersection as f64 / union.len() as f64
}

/// Two-tier result cache: a bounded in-memory map in front of a durable
/// key-value store.
///
/// The memory lock is never held across a store call.
pub struct SmartCache {
    memory: Mutex<HashMap<String, CachedResult>>,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    max_memory_entries: usize,
    max_age_ms: i64,
    purge_interval_ms: i64,
    last_purge_ms: AtomicI64,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum MemoryLookup {
    Hit(CachedResult),
    Expired,
    Missing,
}

impl SmartCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: SharedClock, config: &CacheConfig) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            store,
            clock,
            max_memory_entries: config.max_memory_entries,
            max_age_ms: Duration::from_secs(config.max_age_secs).as_millis() as i64,
            purge_interval_ms: Duration::from_secs(config.sweep_interval_secs).as_millis() as i64,
            last_purge_ms: AtomicI64::new(i64::MIN),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, CachedResult>> {
        match self.memory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_valid(&self, result: &CachedResult) -> bool {
        self.clock.now_ms() - result.timestamp < self.max_age_ms
    }

    fn memory_key(identity: &str, hash: &str) -> String {
        format!("{identity}_{hash}")
    }

    fn lookup_memory(&self, key: &str) -> MemoryLookup {
        let mut memory = self.memory();
        let found = memory.remove(key);
        match found {
            Some(mut entry) if self.is_valid(&entry) => {
                entry.hits += 1;
                memory.insert(key.to_string(), entry.clone());
                MemoryLookup::Hit(entry)
            }
            Some(_) => MemoryLookup::Expired,
            None => MemoryLookup::Missing,
        }
    }

    /// Look up an exact match, promoting durable hits into memory.
    pub async fn get(&self, briefing: &str, identity: &str) -> Option<CachedResult> {
        let hash = briefing_hash(briefing);
        let key = Self::memory_key(identity, &hash);
        let durable_key = format!("{DURABLE_PREFIX}{key}");

        match self.lookup_memory(&key) {
            MemoryLookup::Hit(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
            MemoryLookup::Expired => {
                self.delete_durable(vec![durable_key]).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            MemoryLookup::Missing => {}
        }

        let stored = match self.store.get(&durable_key).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, key = %durable_key, "cache read error");
                None
            }
        };

        if let Some(raw) = stored {
            match serde_json::from_str::<CachedResult>(&raw) {
                Ok(mut entry) if self.is_valid(&entry) => {
                    entry.hits += 1;
                    self.memory().insert(key, entry.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry);
                }
                Ok(_) => {
                    self.delete_durable(vec![durable_key]).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, key = %durable_key, "unparseable cache entry");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a fresh result in both tiers, then run cleanup.
    pub async fn set(&self, briefing: &str, identity: &str, data: serde_json::Value) {
        let hash = briefing_hash(briefing);
        let key = Self::memory_key(identity, &hash);
        let entry = CachedResult {
            data,
            timestamp: self.clock.now_ms(),
            hits: 0,
            user_id: identity.to_string(),
            briefing_hash: hash,
        };

        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&format!("{DURABLE_PREFIX}{key}"), &raw).await {
                    tracing::warn!(error = %e, "cache write error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cache entry serialization failed"),
        }

        self.memory().insert(key, entry);
        self.cleanup().await;
    }

    /// Entries owned by `identity` whose stored hash scores at least
    /// `threshold` against the lower-cased query, most hit first.
    ///
    /// The comparison is against `briefing_hash`, not the original briefing
    /// text, so ordinary prose queries rarely match anything.
    pub fn find_similar(&self, briefing: &str, identity: &str, threshold: f64) -> Vec<CachedResult> {
        let query = briefing.to_lowercase();
        let query = query.trim();

        let mut similar: Vec<CachedResult> = self
            .memory()
            .values()
            .filter(|entry| entry.user_id == identity)
            .filter(|entry| word_similarity(query, &entry.briefing_hash) >= threshold)
            .cloned()
            .collect();

        similar.sort_by(|a, b| b.hits.cmp(&a.hits));
        similar
    }

    /// Evict the oldest half of memory when over capacity, then sweep the
    /// durable tier if no sweep ran within the last purge interval.
    pub async fn cleanup(&self) {
        self.evict_oldest_half();
        if self.purge_due() {
            self.purge_expired().await;
        }
    }

    fn evict_oldest_half(&self) {
        let mut memory = self.memory();
        if memory.len() <= self.max_memory_entries {
            return;
        }
        let mut by_age: Vec<(String, i64)> = memory
            .iter()
            .map(|(k, v)| (k.clone(), v.timestamp))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);
        for (key, _) in by_age.into_iter().take(self.max_memory_entries / 2) {
            memory.remove(&key);
        }
    }

    /// Claims the next durable sweep. Only one caller wins per interval.
    fn purge_due(&self) -> bool {
        let now = self.clock.now_ms();
        let last = self.last_purge_ms.load(Ordering::Acquire);
        now.saturating_sub(last) >= self.purge_interval_ms
            && self
                .last_purge_ms
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Drop every expired or unparseable durable entry. Returns how many were
    /// removed. Keys outside the cache prefix are never touched.
    pub async fn purge_expired(&self) -> usize {
        self.last_purge_ms
            .store(self.clock.now_ms(), Ordering::Release);

        let entries = match self.store.scan(DURABLE_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "cache cleanup error");
                return 0;
            }
        };

        let stale: Vec<String> = entries
            .into_iter()
            .filter(|(_, raw)| {
                !serde_json::from_str::<CachedResult>(raw)
                    .map(|entry| self.is_valid(&entry))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect();

        if stale.is_empty() {
            return 0;
        }
        self.delete_durable(stale).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.memory().len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Remove every entry owned by `identity` from both tiers.
    pub async fn clear_identity(&self, identity: &str) {
        self.memory().retain(|_, entry| entry.user_id != identity);
        self.delete_durable_prefix(&format!("{DURABLE_PREFIX}{identity}_"))
            .await;
    }

    pub async fn clear(&self) {
        self.memory().clear();
        self.delete_durable_prefix(DURABLE_PREFIX).await;
    }

    /// Spawn the periodic durable-tier sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let cache = Arc::clone(self);
        spawn_periodic(Arc::clone(&self.clock), interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                let removed = cache.purge_expired().await;
                if removed > 0 {
                    tracing::info!(removed, "purged expired cache entries");
                }
            }
        })
    }

    async fn delete_durable(&self, keys: Vec<String>) -> usize {
        match self.store.delete(keys).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "cache delete error");
                0
            }
        }
    }

    async fn delete_durable_prefix(&self, prefix: &str) {
        match self.store.scan(prefix).await {
            Ok(entries) => {
                let keys = entries.into_iter().map(|(key, _)| key).collect();
                self.delete_durable(keys).await;
            }
            Err(e) => tracing::warn!(error = %e, "cache clear error"),
        }
    }
}
