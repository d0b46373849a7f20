//! Cache Manager
//!
//! Three independent tiers, each with its own TTL and capacity:
//!
//! | Tier       | Key                                   | Value              |
//! |------------|---------------------------------------|--------------------|
//! | `source`   | user id + raw history digest          | prepared payload   |
//! | `response` | digest of the prompt text             | raw response text  |
//! | `result`   | digest of payload + parameter digests | analysis result    |
//!
//! The generic `get`/`put`/`invalidate` contract is made type safe by the
//! [`TierSpec`] markers: `cache.get::<ResultTier>(&key)` only accepts a result
//! key and only returns a result.

mod tier;

pub use tier::{CacheEntry, CacheTier, TierStats};

use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::types::AnalysisResult;
use crate::validator::AnalysisPayload;

// ============================================================================
// TIER MARKERS
// ============================================================================

/// Which tier an operation or statistic refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Source,
    Response,
    Result,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Source => write!(f, "source"),
            TierKind::Response => write!(f, "response"),
            TierKind::Result => write!(f, "result"),
        }
    }
}

/// Type-level description of a tier
pub trait TierSpec {
    type Key: Hash + Eq + Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    const KIND: TierKind;

    fn tier(cache: &CacheManager) -> &CacheTier<Self::Key, Self::Value>;
}

/// Source tier key: raw history is only reusable for the same user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub user_id: String,
    pub raw_digest: Digest,
}

/// Prepared payloads
pub struct SourceTier;
/// Raw inference responses
pub struct ResponseTier;
/// Finished analysis results
pub struct ResultTier;

impl TierSpec for SourceTier {
    type Key = SourceKey;
    type Value = Arc<AnalysisPayload>;
    const KIND: TierKind = TierKind::Source;

    fn tier(cache: &CacheManager) -> &CacheTier<Self::Key, Self::Value> {
        &cache.source
    }
}

impl TierSpec for ResponseTier {
    type Key = Digest;
    type Value = Arc<String>;
    const KIND: TierKind = TierKind::Response;

    fn tier(cache: &CacheManager) -> &CacheTier<Self::Key, Self::Value> {
        &cache.response
    }
}

impl TierSpec for ResultTier {
    type Key = Digest;
    type Value = Arc<AnalysisResult>;
    const KIND: TierKind = TierKind::Result;

    fn tier(cache: &CacheManager) -> &CacheTier<Self::Key, Self::Value> {
        &cache.result
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Statistics for all tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub source: TierStats,
    pub response: TierStats,
    pub result: TierStats,
}

/// Owner of the three cache tiers
pub struct CacheManager {
    source: CacheTier<SourceKey, Arc<AnalysisPayload>>,
    response: CacheTier<Digest, Arc<String>>,
    result: CacheTier<Digest, Arc<AnalysisResult>>,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            source: CacheTier::new("source", config.source),
            response: CacheTier::new("response", config.response),
            result: CacheTier::new("result", config.result),
        }
    }

    pub fn get<T: TierSpec>(&self, key: &T::Key) -> Option<T::Value> {
        T::tier(self).get(key)
    }

    /// Store a value; `ttl = None` uses the tier default
    pub fn put<T: TierSpec>(&self, key: T::Key, value: T::Value, ttl: Option<Duration>) {
        T::tier(self).put(key, value, ttl)
    }

    pub fn invalidate<T: TierSpec>(&self, key: &T::Key) -> bool {
        T::tier(self).invalidate(key)
    }

    pub fn stats(&self, kind: TierKind) -> TierStats {
        match kind {
            TierKind::Source => self.source.stats(),
            TierKind::Response => self.response.stats(),
            TierKind::Result => self.result.stats(),
        }
    }

    pub fn all_stats(&self) -> CacheStats {
        CacheStats {
            source: self.source.stats(),
            response: self.response.stats(),
            result: self.result.stats(),
        }
    }

    /// Sweep every tier; returns the total number of expired entries removed
    pub fn sweep_expired(&self) -> usize {
        self.source.sweep_expired() + self.response.sweep_expired() + self.result.sweep_expired()
    }

    pub fn clear(&self) {
        self.source.clear();
        self.response.clear();
        self.result.clear();
    }

    /// Spawn the periodic expiry sweep. The task holds only a weak reference
    /// and exits once the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<CacheManager> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}
