//! Engine configuration
//!
//! Every tunable has a default. Configuration is layered:
//!
//! 1. `EngineConfig::default()`
//! 2. an optional JSON file (`EngineConfig::from_json_file`), where missing
//!    fields keep their defaults
//! 3. `REVERIE_*` environment variables (`with_env_overrides`)
//!
//! `validate()` runs last and rejects values the engine cannot operate with.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

// ============================================================================
// VALIDATOR
// ============================================================================

/// Input preparation thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorConfig {
    /// Minimum number of usable records before analysis runs
    pub min_records: usize,
    /// Minimum total normalized characters before analysis runs
    pub min_total_chars: usize,
    /// Per-entry truncation limit (characters)
    pub max_entry_chars: usize,
    /// Maximum characters per inference chunk
    pub chunk_budget_chars: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_records: 5,
            min_total_chars: 200,
            max_entry_chars: 2_000,
            chunk_budget_chars: 24_000,
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Configuration for one cache tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    /// Default time-to-live for entries in this tier
    pub ttl_secs: u64,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl TierConfig {
    pub const fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            ttl_secs,
            max_entries,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Cache manager configuration
///
/// A partial tier object in a config file only replaces the fields it
/// names; the rest keep that tier's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", from = "CacheConfigFile")]
pub struct CacheConfig {
    /// Prepared payloads keyed by user + raw history digest
    pub source: TierConfig,
    /// Raw inference responses keyed by prompt digest
    pub response: TierConfig,
    /// Finished results keyed by payload + parameter digest
    pub result: TierConfig,
    /// Interval of the background expiry sweep (0 disables it)
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            source: TierConfig::new(300, 256),
            response: TierConfig::new(3_600, 1_024),
            result: TierConfig::new(1_800, 512),
            sweep_interval_secs: 60,
        }
    }
}

/// Tier fields as they appear in a config file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TierOverride {
    ttl_secs: Option<u64>,
    max_entries: Option<usize>,
}

impl TierOverride {
    fn over(self, base: TierConfig) -> TierConfig {
        TierConfig {
            ttl_secs: self.ttl_secs.unwrap_or(base.ttl_secs),
            max_entries: self.max_entries.unwrap_or(base.max_entries),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CacheConfigFile {
    source: TierOverride,
    response: TierOverride,
    result: TierOverride,
    sweep_interval_secs: Option<u64>,
}

impl From<CacheConfigFile> for CacheConfig {
    fn from(file: CacheConfigFile) -> Self {
        let defaults = CacheConfig::default();
        Self {
            source: file.source.over(defaults.source),
            response: file.response.over(defaults.response),
            result: file.result.over(defaults.result),
            sweep_interval_secs: file
                .sweep_interval_secs
                .unwrap_or(defaults.sweep_interval_secs),
        }
    }
}

// ============================================================================
// CONCURRENCY
// ============================================================================

/// Admission control limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    /// Maximum computations running at once
    pub max_in_flight: usize,
    /// Maximum computations waiting for a slot
    pub max_queue: usize,
    /// Retry hint returned with `CapacityExceeded`
    pub retry_after_secs: u64,
}

impl ConcurrencyConfig {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            max_queue: 16,
            retry_after_secs: 30,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Inference orchestration tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Model identifier sent to the inference service
    pub model: String,
    /// Output token limit per call
    pub max_output_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Timeout for a single inference attempt
    pub attempt_timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay of the exponential backoff
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Chunks analysed concurrently for one request
    pub chunk_parallelism: usize,
    /// Token Jaccard similarity at which two meta-patterns are merged
    pub pattern_similarity_threshold: f64,
}

impl OrchestratorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_output_tokens: 2_048,
            temperature: 0.7,
            attempt_timeout_secs: 60,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            chunk_parallelism: 2,
            pattern_similarity_threshold: 0.85,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub validator: ValidatorConfig,
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse from a JSON string
    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply `REVERIE_*` environment variable overrides
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `REVERIE_MODEL` | `orchestrator.model` |
    /// | `REVERIE_MAX_RETRIES` | `orchestrator.max_retries` |
    /// | `REVERIE_ATTEMPT_TIMEOUT_SECS` | `orchestrator.attempt_timeout_secs` |
    /// | `REVERIE_CHUNK_PARALLELISM` | `orchestrator.chunk_parallelism` |
    /// | `REVERIE_MAX_IN_FLIGHT` | `concurrency.max_in_flight` |
    /// | `REVERIE_MAX_QUEUE` | `concurrency.max_queue` |
    /// | `REVERIE_SOURCE_TTL_SECS` | `cache.source.ttl_secs` |
    /// | `REVERIE_RESPONSE_TTL_SECS` | `cache.response.ttl_secs` |
    /// | `REVERIE_RESULT_TTL_SECS` | `cache.result.ttl_secs` |
    /// | `REVERIE_MIN_RECORDS` | `validator.min_records` |
    /// | `REVERIE_CHUNK_BUDGET_CHARS` | `validator.chunk_budget_chars` |
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment, test maps)
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("REVERIE_MODEL") {
            if !model.trim().is_empty() {
                self.orchestrator.model = model.trim().to_string();
            }
        }
        override_parsed(&lookup, "REVERIE_MAX_RETRIES", &mut self.orchestrator.max_retries);
        override_parsed(
            &lookup,
            "REVERIE_ATTEMPT_TIMEOUT_SECS",
            &mut self.orchestrator.attempt_timeout_secs,
        );
        override_parsed(
            &lookup,
            "REVERIE_CHUNK_PARALLELISM",
            &mut self.orchestrator.chunk_parallelism,
        );
        override_parsed(&lookup, "REVERIE_MAX_IN_FLIGHT", &mut self.concurrency.max_in_flight);
        override_parsed(&lookup, "REVERIE_MAX_QUEUE", &mut self.concurrency.max_queue);
        override_parsed(&lookup, "REVERIE_SOURCE_TTL_SECS", &mut self.cache.source.ttl_secs);
        override_parsed(&lookup, "REVERIE_RESPONSE_TTL_SECS", &mut self.cache.response.ttl_secs);
        override_parsed(&lookup, "REVERIE_RESULT_TTL_SECS", &mut self.cache.result.ttl_secs);
        override_parsed(&lookup, "REVERIE_MIN_RECORDS", &mut self.validator.min_records);
        override_parsed(
            &lookup,
            "REVERIE_CHUNK_BUDGET_CHARS",
            &mut self.validator.chunk_budget_chars,
        );
        self
    }

    /// Reject configurations the engine cannot operate with
    pub fn validate(&self) -> EngineResult<()> {
        let tiers = [
            ("source", &self.cache.source),
            ("response", &self.cache.response),
            ("result", &self.cache.result),
        ];
        for (name, tier) in tiers {
            if tier.max_entries == 0 {
                return Err(EngineError::Config(format!(
                    "cache.{}.maxEntries must be > 0",
                    name
                )));
            }
            if tier.ttl_secs == 0 {
                return Err(EngineError::Config(format!(
                    "cache.{}.ttlSecs must be > 0",
                    name
                )));
            }
        }
        if self.concurrency.max_in_flight == 0 {
            return Err(EngineError::Config(
                "concurrency.maxInFlight must be > 0".to_string(),
            ));
        }
        if self.orchestrator.attempt_timeout_secs == 0 {
            return Err(EngineError::Config(
                "orchestrator.attemptTimeoutSecs must be > 0".to_string(),
            ));
        }
        if self.orchestrator.chunk_parallelism == 0 {
            return Err(EngineError::Config(
                "orchestrator.chunkParallelism must be > 0".to_string(),
            ));
        }
        if self.orchestrator.model.trim().is_empty() {
            return Err(EngineError::Config(
                "orchestrator.model cannot be empty".to_string(),
            ));
        }
        if self.orchestrator.backoff_base_ms > self.orchestrator.backoff_max_ms {
            return Err(EngineError::Config(format!(
                "orchestrator.backoffBaseMs ({}) cannot exceed backoffMaxMs ({})",
                self.orchestrator.backoff_base_ms, self.orchestrator.backoff_max_ms
            )));
        }
        let threshold = self.orchestrator.pattern_similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "orchestrator.patternSimilarityThreshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.validator.max_entry_chars == 0 || self.validator.chunk_budget_chars == 0 {
            return Err(EngineError::Config(
                "validator limits must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config override"),
        }
    }
}
