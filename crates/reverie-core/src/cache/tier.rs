//! A single TTL + LRU cache tier
//!
//! Expired entries are removed lazily on access and by `sweep_expired`.
//! At capacity, expired entries are purged first; only then is the
//! least-recently-accessed entry evicted.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::TierConfig;

/// A cached value with its lifetime bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            last_accessed_at: now,
            ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Counters for one tier. All counts are monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

impl TierStats {
    /// Hit rate in [0, 1]; 0 when the tier has never been read
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe TTL + LRU tier
pub struct CacheTier<K: Hash + Eq, V> {
    name: &'static str,
    default_ttl: Duration,
    capacity: NonZeroUsize,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> CacheTier<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, config: TierConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            default_ttl: config.ttl(),
            capacity,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        // Entries stay consistent even if a holder panicked mid-read
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry, promoting it to most-recently-used
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a live entry exists, without touching recency or counters
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or replace an entry. `ttl = None` uses the tier default.
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut entries = self.lock();

        if !entries.contains(&key) && entries.len() >= self.capacity.get() {
            let purged = purge_expired(&mut entries, now);
            if purged > 0 {
                self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
            }
            if entries.len() >= self.capacity.get() && entries.pop_lru().is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.put(key, CacheEntry::new(value, ttl, now));
    }

    /// Remove an entry; returns whether it was present
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Remove all expired entries; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let purged = purge_expired(&mut self.lock(), now);
        if purged > 0 {
            self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity.get(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

fn purge_expired<K, V>(entries: &mut LruCache<K, CacheEntry<V>>, now: Instant) -> usize
where
    K: Hash + Eq + Clone,
{
    let expired: Vec<K> = entries
        .iter()
        .filter(|(_, entry)| entry.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}
