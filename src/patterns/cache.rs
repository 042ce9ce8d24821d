//! TTL + LRU cache over pattern store reads.
//!
//! Cache keys embed an hour bucket so entries silently expire at hourly
//! rollovers independently of the TTL sweep. Expired entries are removed
//! lazily on `get` and swept opportunistically on `set`.

use super::{EntityTypeInfo, Pattern, PatternStore, RelationshipPattern};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Sweep expired entries on every Nth insert.
const SWEEP_EVERY: u64 = 10;

type CachedValue = Arc<dyn Any + Send + Sync>;

struct CacheEntry {
    data: CachedValue,
    created_at: Instant,
    accessed_at: Instant,
    access_count: u64,
}

/// Hit/miss counters for the whole cache or one method.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub total_requests: u64,
}

impl CacheCounters {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.misses as f64 / self.total_requests as f64
        }
    }

    fn report(&self) -> CounterReport {
        CounterReport {
            hits: self.hits,
            misses: self.misses,
            expirations: self.expirations,
            evictions: self.evictions,
            total_requests: self.total_requests,
            hit_rate: (self.hit_rate() * 10_000.0).round() / 10_000.0,
            miss_rate: (self.miss_rate() * 10_000.0).round() / 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterReport {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
}

/// Full cache metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsReport {
    pub overall: CounterReport,
    pub cache_size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub utilization: f64,
    pub method_metrics: BTreeMap<String, CounterReport>,
}

/// Per-entry detail for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub age_seconds: f64,
    pub seconds_since_access: f64,
    pub access_count: u64,
    pub is_expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfoReport {
    pub total_entries: usize,
    pub entries: Vec<CacheEntryInfo>,
    pub metrics: CacheMetricsReport,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    counters: CacheCounters,
    method_counters: HashMap<String, CacheCounters>,
    inserts: u64,
}

/// High-performance cache with LRU eviction and TTL expiration (C2).
pub struct PatternCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl PatternCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        info!(
            "PatternCache initialized: max_size={}, ttl={:?}",
            max_size, ttl
        );
        Self {
            max_size,
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                counters: CacheCounters::default(),
                method_counters: HashMap::new(),
                inserts: 0,
            }),
        }
    }

    /// Hour-bucketed cache key: `method:YYYYMMDDHH:args`.
    pub fn cache_key(method: &str, args: &str) -> String {
        let bucket = chrono::Local::now().format("%Y%m%d%H");
        format!("{}:{}:{}", method, bucket, args)
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.total_requests += 1;

        let Some(entry) = inner.entries.get_mut(key) else {
            inner.counters.misses += 1;
            return None;
        };

        if entry.created_at.elapsed() > self.ttl {
            inner.entries.remove(key);
            inner.counters.expirations += 1;
            inner.counters.misses += 1;
            return None;
        }

        entry.accessed_at = Instant::now();
        entry.access_count += 1;
        let data = Arc::clone(&entry.data);
        inner.counters.hits += 1;
        Some(data)
    }

    pub fn set(&self, key: String, value: CachedValue) {
        let mut inner = self.inner.lock().unwrap();
        inner.inserts += 1;

        if inner.inserts % SWEEP_EVERY == 0 {
            self.sweep_expired(&mut inner);
        }

        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&key) {
            self.evict_lru(&mut inner);
        }

        let now = Instant::now();
        inner.entries.insert(
            key,
            CacheEntry {
                data: value,
                created_at: now,
                accessed_at: now,
                access_count: 1,
            },
        );
    }

    /// Memoise one method call through the cache. `compute` runs on a miss;
    /// per-method counters are updated either way.
    pub fn get_or_insert_with<T, F>(&self, method: &str, args: &str, compute: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = Self::cache_key(method, args);

        if let Some(cached) = self.get(&key) {
            if let Ok(typed) = cached.downcast::<T>() {
                self.record_method(method, true);
                debug!("Cache hit for {}: {}", method, key);
                return typed;
            }
        }

        debug!("Cache miss for {}: {}", method, key);
        let value = Arc::new(compute());
        self.set(key, Arc::clone(&value) as CachedValue);
        self.record_method(method, false);
        value
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.entries.len();
        inner.entries.clear();
        info!("Cache cleared: {} entries removed", removed);
    }

    pub fn metrics(&self) -> CacheMetricsReport {
        let inner = self.inner.lock().unwrap();
        CacheMetricsReport {
            overall: inner.counters.report(),
            cache_size: inner.entries.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
            utilization: if self.max_size > 0 {
                (inner.entries.len() as f64 / self.max_size as f64 * 10_000.0).round() / 10_000.0
            } else {
                0.0
            },
            method_metrics: inner
                .method_counters
                .iter()
                .map(|(k, v)| (k.clone(), v.report()))
                .collect(),
        }
    }

    pub fn info(&self) -> CacheInfoReport {
        let (total_entries, entries) = {
            let inner = self.inner.lock().unwrap();
            let mut entries: Vec<CacheEntryInfo> = inner
                .entries
                .iter()
                .map(|(key, entry)| CacheEntryInfo {
                    key: key.clone(),
                    age_seconds: entry.created_at.elapsed().as_secs_f64(),
                    seconds_since_access: entry.accessed_at.elapsed().as_secs_f64(),
                    access_count: entry.access_count,
                    is_expired: entry.created_at.elapsed() > self.ttl,
                })
                .collect();
            entries.sort_by(|a, b| {
                a.seconds_since_access
                    .partial_cmp(&b.seconds_since_access)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let total = inner.entries.len();
            entries.truncate(20);
            (total, entries)
        };

        CacheInfoReport {
            total_entries,
            entries,
            metrics: self.metrics(),
        }
    }

    fn record_method(&self, method: &str, hit: bool) {
        let mut inner = self.inner.lock().unwrap();
        let counters = inner
            .method_counters
            .entry(method.to_string())
            .or_default();
        counters.total_requests += 1;
        if hit {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
    }

    fn sweep_expired(&self, inner: &mut CacheInner) {
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);
        let swept = before - inner.entries.len();
        if swept > 0 {
            inner.counters.expirations += swept as u64;
            debug!("Swept {} expired cache entries", swept);
        }
    }

    fn evict_lru(&self, inner: &mut CacheInner) {
        let lru_key = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.accessed_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = lru_key {
            inner.entries.remove(&key);
            inner.counters.evictions += 1;
            debug!("Evicted LRU cache entry: {}", key);
        }
    }
}

/// Pattern store wrapper that serves the hot read paths from the cache and
/// delegates everything else (C1 behind C2).
pub struct CachedPatternStore {
    store: Arc<PatternStore>,
    cache: PatternCache,
}

impl CachedPatternStore {
    pub fn new(store: Arc<PatternStore>, max_size: usize, ttl: Duration) -> Self {
        Self {
            store,
            cache: PatternCache::new(max_size, ttl),
        }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn cache(&self) -> &PatternCache {
        &self.cache
    }

    pub fn entity_types(&self) -> Arc<Vec<String>> {
        self.cache
            .get_or_insert_with("get_entity_types", "", || self.store.get_entity_types())
    }

    pub fn entity_types_with_examples(&self) -> Arc<Vec<String>> {
        self.cache
            .get_or_insert_with("get_entity_types_with_examples", "", || {
                self.store.get_entity_types_with_examples()
            })
    }

    pub fn patterns_by_entity_type(&self, entity_type: &str) -> Arc<Vec<Arc<Pattern>>> {
        self.cache
            .get_or_insert_with("get_patterns_by_entity_type", entity_type, || {
                self.store.get_patterns_by_entity_type(entity_type)
            })
    }

    pub fn aggregated_examples(&self, entity_type: &str) -> Arc<Vec<String>> {
        self.cache
            .get_or_insert_with("get_aggregated_examples", entity_type, || {
                self.store.get_aggregated_examples(entity_type)
            })
    }

    pub fn all_aggregated_examples(&self) -> Arc<HashMap<String, Vec<String>>> {
        self.cache
            .get_or_insert_with("get_all_aggregated_examples", "", || {
                self.store.get_all_aggregated_examples()
            })
    }

    pub fn relationship_patterns(&self) -> Arc<BTreeMap<String, Vec<RelationshipPattern>>> {
        self.cache
            .get_or_insert_with("get_relationship_patterns", "", || {
                self.store.get_relationship_patterns()
            })
    }

    pub fn relationship_types(&self) -> Arc<Vec<String>> {
        self.cache
            .get_or_insert_with("get_relationship_types", "", || {
                self.store.get_relationship_types()
            })
    }

    pub fn entity_type_info(&self, entity_type: &str) -> Arc<EntityTypeInfo> {
        self.cache
            .get_or_insert_with("get_entity_type_info", entity_type, || {
                self.store.entity_type_info(entity_type)
            })
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_types::AliasMap;

    fn cache() -> PatternCache {
        PatternCache::new(4, Duration::from_secs(3600))
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = cache();
        let key = PatternCache::cache_key("method", "arg");

        assert!(cache.get(&key).is_none());
        cache.set(key.clone(), Arc::new(42usize));
        assert!(cache.get(&key).is_some());

        let metrics = cache.metrics();
        assert_eq!(metrics.overall.hits, 1);
        assert_eq!(metrics.overall.misses, 1);
        assert_eq!(metrics.overall.total_requests, 2);
        assert_eq!(metrics.overall.hit_rate, 0.5);
    }

    #[test]
    fn test_ttl_expiry_is_lazy_on_get() {
        let cache = PatternCache::new(4, Duration::ZERO);
        let key = PatternCache::cache_key("method", "arg");
        cache.set(key.clone(), Arc::new(1usize));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.overall.expirations, 1);
        assert_eq!(metrics.cache_size, 0);
    }

    #[test]
    fn test_lru_eviction_on_insert() {
        let cache = PatternCache::new(2, Duration::from_secs(3600));
        cache.set("a".to_string(), Arc::new(1usize));
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b".to_string(), Arc::new(2usize));
        std::thread::sleep(Duration::from_millis(2));

        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(2));

        cache.set("c".to_string(), Arc::new(3usize));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.metrics().overall.evictions, 1);
    }

    #[test]
    fn test_existing_key_does_not_evict() {
        let cache = PatternCache::new(2, Duration::from_secs(3600));
        cache.set("a".to_string(), Arc::new(1usize));
        cache.set("b".to_string(), Arc::new(2usize));
        cache.set("a".to_string(), Arc::new(3usize));

        assert_eq!(cache.metrics().overall.evictions, 0);
        assert_eq!(cache.metrics().cache_size, 2);
    }

    #[test]
    fn test_get_or_insert_with_memoises() {
        let cache = cache();
        let mut calls = 0;

        let first = cache.get_or_insert_with("m", "x", || {
            calls += 1;
            "value".to_string()
        });
        assert_eq!(*first, "value");
        assert_eq!(calls, 1);

        let second = cache.get_or_insert_with("m", "x", || {
            calls += 1;
            "other".to_string()
        });
        assert_eq!(*second, "value");
        assert_eq!(calls, 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.method_metrics["m"].hits, 1);
        assert_eq!(metrics.method_metrics["m"].misses, 1);
    }

    #[test]
    fn test_clear_empties_cache() {
        let cache = cache();
        cache.set("a".to_string(), Arc::new(1usize));
        cache.set("b".to_string(), Arc::new(2usize));
        cache.clear();
        assert_eq!(cache.metrics().cache_size, 0);
    }

    #[test]
    fn test_utilization() {
        let cache = cache();
        cache.set("a".to_string(), Arc::new(1usize));
        assert_eq!(cache.metrics().utilization, 0.25);
    }

    #[test]
    fn test_cache_key_embeds_hour_bucket() {
        let key = PatternCache::cache_key("method", "arg");
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "method");
        assert_eq!(parts[1].len(), 10); // YYYYMMDDHH
        assert_eq!(parts[2], "arg");
    }

    #[test]
    fn test_cached_store_delegates_and_memoises() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("courts.json"),
            r#"{
                "metadata": {"pattern_type": "courts", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "supreme", "match_expression": "Supreme Court",
                     "entity_types": ["COURT"], "examples": ["Supreme Court"]}
                ]
            }"#,
        )
        .unwrap();

        let store = Arc::new(PatternStore::new(dir.path(), AliasMap::builtin()));
        store.load_all();

        let cached = CachedPatternStore::new(store, 16, Duration::from_secs(3600));
        let first = cached.entity_types();
        let second = cached.entity_types();
        assert_eq!(*first, *second);
        assert!(first.contains(&"COURT".to_string()));

        assert_eq!(cached.patterns_by_entity_type("COURT").len(), 1);
        assert_eq!(cached.aggregated_examples("COURT").len(), 1);

        let metrics = cached.cache().metrics();
        assert_eq!(metrics.method_metrics["get_entity_types"].hits, 1);
    }
}
