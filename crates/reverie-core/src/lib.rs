//! # Reverie Core
//!
//! Insight discovery engine. Scans a user's accumulated interaction history
//! for non-obvious connections and recurring patterns, using a slow,
//! unreliable external text-generation service for the reasoning, and makes
//! that call usable as a repeatable, concurrent, cost-bounded primitive:
//!
//! - **Validator**: normalizes raw history, detects insufficient data,
//!   chunks oversized payloads and computes stable content digests
//! - **Tiered Cache**: source-data, AI-response and finished-result tiers,
//!   each with TTL and LRU size bounds plus a periodic sweep
//! - **Concurrency Controller**: FIFO admission with a bounded queue and
//!   at-most-one computation per key
//! - **AI Orchestrator**: prompt construction, per-attempt timeouts,
//!   jittered backoff, degraded fallback, tolerant parsing, strict
//!   validation and streaming partial results
//! - **Metrics**: fire-and-forget events and per-result metadata
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reverie_core::prelude::*;
//!
//! let history = Arc::new(SqliteHistoryStore::new(None)?);
//! let inference = Arc::new(HttpInferenceClient::from_env("gpt-4o-mini")?);
//! let engine = InsightEngine::new(EngineConfig::default().with_env_overrides(), history, inference)?;
//!
//! match engine.request_analysis("user-1", &AnalysisParameters::default()).await? {
//!     AnalysisOutcome::Completed(result) => println!("{}", result.summary),
//!     AnalysisOutcome::InsufficientData(data) => println!("{}", data.message),
//!     AnalysisOutcome::CapacityExceeded(busy) => println!("retry in {}s", busy.retry_after_secs),
//! }
//!
//! engine.shutdown().await;
//! ```
//!
//! ## Feature Flags
//!
//! - `http` (default): OpenAI-compatible HTTP inference client with SSE streaming
//! - `bundled-sqlite` (default): compile SQLite into the binary

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod storage;
pub mod types;
pub mod validator;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Result types
pub use types::{
    AnalysisParameters, AnalysisResult, CacheHitClass, Connection, ConnectionCategory,
    MetaPattern, Metadata, ResponseFormat,
};

// Engine
pub use engine::{
    AnalysisEvent, AnalysisOutcome, AnalysisStream, EngineStats, InsightEngine,
    StreamingOutcome,
};

// Errors
pub use error::{EngineError, EngineResult};

// Configuration
pub use config::{
    CacheConfig, ConcurrencyConfig, EngineConfig, OrchestratorConfig, TierConfig,
    ValidatorConfig,
};

// Collaborator seams
pub use history::{HistoryError, HistoryRecord, HistoryStore, InMemoryHistoryStore};
pub use orchestrator::{InferenceError, InferenceRequest, InferenceService, PartialInsights};

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use orchestrator::http::HttpInferenceClient;

// Components
pub use cache::{CacheManager, CacheStats, TierKind, TierStats};
pub use concurrency::{CapacityExceeded, ConcurrencyController, ControllerStats};
pub use digest::Digest;
pub use metrics::{InMemoryMetrics, MetricEvent, MetricsSink, NoopMetrics, TracingMetrics};
pub use storage::{AnalysisRun, SqliteHistoryStore};
pub use validator::{AnalysisPayload, InsufficientData, Preparation, Validator};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AnalysisEvent, AnalysisOutcome, AnalysisParameters, AnalysisResult, EngineConfig,
        EngineError, EngineResult, HistoryRecord, HistoryStore, InferenceService, InsightEngine,
        ResponseFormat, SqliteHistoryStore, StreamingOutcome,
    };

    #[cfg(feature = "http")]
    pub use crate::HttpInferenceClient;
}
