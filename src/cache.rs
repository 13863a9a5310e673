//! Size-bounded, TTL-expiring, LRU-evicting in-memory cache.
//!
//! One implementation serves all three player-scoped tiers (preprocessed,
//! solver, sts); the tier name is threaded through to the metric labels.
//! All operations serialize on a single mutex; critical sections are a map
//! lookup plus bookkeeping, so contention is not a concern at the configured
//! capacities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::CacheTierConfig;
use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// Entry & stats
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    /// Monotonic access stamp; the smallest stamp is the LRU victim.
    last_access: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub ops: u64,
    pub errors: u64,
}

struct Inner<V> {
    map: HashMap<String, Entry<V>>,
    stamp: u64,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct TieredCache<V> {
    name: &'static str,
    max_entries: usize,
    ttl: Duration,
    sweep_interval: Duration,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    ops: AtomicU64,
    errors: AtomicU64,
    metrics: Arc<Metrics>,
}

impl<V: Clone + Send + 'static> TieredCache<V> {
    pub fn new(name: &'static str, cfg: CacheTierConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            name,
            max_entries: cfg.max_entries.max(1),
            ttl: cfg.ttl,
            sweep_interval: cfg.sweep_interval,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                stamp: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lock the map, recovering (and counting) a poisoned mutex rather than
    /// propagating the panic of whichever caller died holding it.
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .cache_ops
                    .with(&[self.name, "lock", "error"])
                    .inc();
                poisoned.into_inner()
            }
        }
    }

    fn expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) > self.ttl
    }

    fn publish_size(&self, size: usize) {
        self.metrics.cache_size.with(&[self.name]).set(size as i64);
    }

    fn record_op(&self, op: &str, started: Instant) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_ops.with(&[self.name, op, "success"]).inc();
        self.metrics
            .cache_op_duration
            .with(&[self.name, op])
            .observe(started.elapsed());
    }

    /// Fetch a live entry, refreshing its LRU position. An expired entry is
    /// removed on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let started = Instant::now();
        let now = Instant::now();
        let mut inner = self.lock();
        inner.stamp += 1;
        let stamp = inner.stamp;

        enum Lookup<V> {
            Hit(V),
            Expired,
            Miss,
        }

        let lookup = match inner.map.get_mut(key) {
            Some(entry) if !self.expired(entry, now) => {
                entry.last_access = stamp;
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        let result = match lookup {
            Lookup::Hit(value) => Some(value),
            Lookup::Expired => {
                inner.map.remove(key);
                self.metrics
                    .cache_evictions
                    .with(&[self.name, "ttl"])
                    .inc();
                None
            }
            Lookup::Miss => None,
        };

        let size = inner.map.len();
        drop(inner);

        match result {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_hits.with(&[self.name]).inc();
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_misses.with(&[self.name]).inc();
            }
        }
        self.publish_size(size);
        self.record_op("get", started);
        result
    }

    /// Insert or refresh an entry. Overflow evicts least-recently-used
    /// entries until the cache fits its capacity again.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let started = Instant::now();
        let mut inner = self.lock();
        inner.stamp += 1;
        let stamp = inner.stamp;

        inner.map.insert(
            key.into(),
            Entry {
                value,
                inserted_at: Instant::now(),
                last_access: stamp,
            },
        );

        while inner.map.len() > self.max_entries {
            let victim = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    inner.map.remove(&k);
                    self.metrics
                        .cache_evictions
                        .with(&[self.name, "lru"])
                        .inc();
                    tracing::debug!("[cache:{}] lru evict {}", self.name, &k[..k.len().min(12)]);
                }
                None => break,
            }
        }

        let size = inner.map.len();
        drop(inner);

        self.publish_size(size);
        self.record_op("put", started);
    }

    /// Remove an entry; true when something was actually there.
    pub fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        let mut inner = self.lock();
        let removed = inner.map.remove(key).is_some();
        let size = inner.map.len();
        drop(inner);

        self.publish_size(size);
        self.record_op("delete", started);
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let started = Instant::now();
        let mut inner = self.lock();
        let dropped = inner.map.len();
        inner.map.clear();
        drop(inner);

        if dropped > 0 {
            tracing::info!("[cache:{}] cleared {} entries", self.name, dropped);
        }
        self.publish_size(0);
        self.record_op("clear", started);
    }

    /// Liveness check without disturbing LRU order.
    pub fn has(&self, key: &str) -> bool {
        let started = Instant::now();
        let now = Instant::now();
        let inner = self.lock();
        let live = inner
            .map
            .get(key)
            .map(|e| !self.expired(e, now))
            .unwrap_or(false);
        drop(inner);

        self.record_op("has", started);
        live
    }

    /// Refresh an entry's LRU position without reading it.
    pub fn touch(&self, key: &str) -> bool {
        let started = Instant::now();
        let mut inner = self.lock();
        inner.stamp += 1;
        let stamp = inner.stamp;
        let touched = match inner.map.get_mut(key) {
            Some(entry) => {
                entry.last_access = stamp;
                true
            }
            None => false,
        };
        drop(inner);

        self.record_op("touch", started);
        touched
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observational snapshot for `/status`.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let gets = hits + misses;
        CacheStats {
            name: self.name,
            hits,
            misses,
            size: self.len(),
            max_size: self.max_entries,
            hit_rate: if gets == 0 {
                0.0
            } else {
                hits as f64 / gets as f64
            },
            ops: self.ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let started = Instant::now();
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.map.len();
        let ttl = self.ttl;
        inner
            .map
            .retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        let dropped = before - inner.map.len();
        let size = inner.map.len();
        drop(inner);

        if dropped > 0 {
            self.metrics
                .cache_evictions
                .with(&[self.name, "ttl"])
                .add(dropped as u64);
            tracing::info!("[sweep:{}] evicted {} expired entries", self.name, dropped);
        }
        self.publish_size(size);
        self.record_op("sweep", started);
        dropped
    }

    /// Periodic expiry sweep. Runs until the process exits; a sweep can
    /// never take the task down.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays quiet.
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max: usize, ttl_ms: u64) -> CacheTierConfig {
        CacheTierConfig {
            max_entries: max,
            ttl: Duration::from_millis(ttl_ms),
            sweep_interval: Duration::from_secs(600),
        }
    }

    #[test]
    fn get_put_roundtrip_and_counters() {
        let c = TieredCache::new("solver", tier(10, 10_000), Metrics::new());
        assert!(c.get("a").is_none());
        c.put("a", 1u32);
        assert_eq!(c.get("a"), Some(1));
        assert_eq!(c.get("a"), Some(1));

        let stats = c.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.misses, 3); // every get accounted for
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_overflow_evicts_least_recently_used() {
        let c = TieredCache::new("solver", tier(3, 10_000), Metrics::new());
        c.put("a", 1u32);
        c.put("b", 2);
        c.put("c", 3);
        // Touch "a" so "b" becomes the LRU victim.
        assert_eq!(c.get("a"), Some(1));
        c.put("d", 4);

        assert_eq!(c.len(), 3);
        assert!(c.has("a"));
        assert!(!c.has("b"));
        assert!(c.has("c"));
        assert!(c.has("d"));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let c = TieredCache::new("sts", tier(5, 10_000), Metrics::new());
        for i in 0..50 {
            c.put(format!("k{i}"), i);
            assert!(c.len() <= 5);
        }
        // The survivors are exactly the five most recent inserts.
        for i in 45..50 {
            assert!(c.has(&format!("k{i}")));
        }
    }

    #[test]
    fn expired_entries_vanish_on_get() {
        let c = TieredCache::new("sts", tier(10, 20), Metrics::new());
        c.put("a", 1u32);
        assert_eq!(c.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert!(c.get("a").is_none());
        assert_eq!(c.len(), 0);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn put_refreshes_insert_time() {
        let c = TieredCache::new("sts", tier(10, 120), Metrics::new());
        c.put("a", 1u32);
        std::thread::sleep(Duration::from_millis(80));
        c.put("a", 2);
        std::thread::sleep(Duration::from_millis(80));
        // 160ms after the first put but only 80ms after the refresh.
        assert_eq!(c.get("a"), Some(2));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let c = TieredCache::new("preprocessed", tier(10, 30), Metrics::new());
        c.put("old", 1u32);
        std::thread::sleep(Duration::from_millis(50));
        c.put("new", 2);
        let dropped = c.sweep();
        assert_eq!(dropped, 1);
        assert!(!c.has("old"));
        assert!(c.has("new"));
    }

    #[test]
    fn delete_and_clear() {
        let c = TieredCache::new("solver", tier(10, 10_000), Metrics::new());
        c.put("a", 1u32);
        c.put("b", 2);
        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn touch_protects_from_eviction() {
        let c = TieredCache::new("solver", tier(2, 10_000), Metrics::new());
        c.put("a", 1u32);
        c.put("b", 2);
        assert!(c.touch("a"));
        c.put("c", 3);
        assert!(c.has("a"));
        assert!(!c.has("b"));
        assert!(!c.touch("missing"));
    }
}
