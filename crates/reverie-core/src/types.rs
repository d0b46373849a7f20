//! Analysis types - the structured result handed to the presentation layer
//!
//! - Connections between two or more history entries
//! - Meta-patterns spanning many entries
//! - Per-request analysis parameters
//! - Result metadata (timing, model, cache-hit class, retries)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONNECTION CATEGORIES
// ============================================================================

/// Fixed set of connection categories
///
/// Anything the inference service returns outside this set is mapped to
/// [`ConnectionCategory::Other`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionCategory {
    /// Recurring habits or actions
    Behavioral,
    /// Shared subject matter
    Thematic,
    /// Time-based relationship (sequence, cadence, seasonality)
    Temporal,
    /// Shared mood or emotional arc
    Emotional,
    /// Anything else
    #[default]
    Other,
}

impl ConnectionCategory {
    /// Map free text onto the fixed category set, falling back to `Other`
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(ConnectionCategory::Other)
    }

    /// All categories, in prompt order
    pub fn all() -> [ConnectionCategory; 5] {
        [
            ConnectionCategory::Behavioral,
            ConnectionCategory::Thematic,
            ConnectionCategory::Temporal,
            ConnectionCategory::Emotional,
            ConnectionCategory::Other,
        ]
    }
}

impl std::fmt::Display for ConnectionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionCategory::Behavioral => write!(f, "behavioral"),
            ConnectionCategory::Thematic => write!(f, "thematic"),
            ConnectionCategory::Temporal => write!(f, "temporal"),
            ConnectionCategory::Emotional => write!(f, "emotional"),
            ConnectionCategory::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for ConnectionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "behavioral" | "behavioural" => Ok(ConnectionCategory::Behavioral),
            "thematic" => Ok(ConnectionCategory::Thematic),
            "temporal" => Ok(ConnectionCategory::Temporal),
            "emotional" => Ok(ConnectionCategory::Emotional),
            "other" => Ok(ConnectionCategory::Other),
            _ => Err(format!("Unknown connection category: {}", s)),
        }
    }
}

// ============================================================================
// DISCOVERED STRUCTURE
// ============================================================================

/// A discovered relationship between two or more history entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Participating entry IDs (at least two, all present in the payload)
    pub entry_ids: Vec<String>,
    /// Human-readable description of the relationship
    pub description: String,
    /// How unexpected the connection is (0-1)
    pub surprise: f64,
    /// How relevant the connection is to the user (0-1)
    pub relevance: f64,
    /// Category from the fixed set
    pub category: ConnectionCategory,
}

/// A higher-order recurring pattern not tied to exactly two entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaPattern {
    /// Pattern description
    pub description: String,
    /// Confidence in the pattern (0-1)
    pub confidence: f64,
    /// Supporting entry IDs (all present in the payload)
    pub supporting_entry_ids: Vec<String>,
}

// ============================================================================
// METADATA
// ============================================================================

/// Which cache tier (if any) satisfied a request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheHitClass {
    /// Full orchestration ran
    #[default]
    Miss,
    /// Raw inference responses came from the response tier; parsing and validation ran
    ResponseHit,
    /// The finished result came from the result tier
    ResultHit,
}

impl std::fmt::Display for CacheHitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheHitClass::Miss => write!(f, "miss"),
            CacheHitClass::ResponseHit => write!(f, "response-hit"),
            CacheHitClass::ResultHit => write!(f, "result-hit"),
        }
    }
}

impl std::str::FromStr for CacheHitClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "miss" => Ok(CacheHitClass::Miss),
            "response-hit" => Ok(CacheHitClass::ResponseHit),
            "result-hit" => Ok(CacheHitClass::ResultHit),
            _ => Err(format!("Unknown cache hit class: {}", s)),
        }
    }
}

/// Metadata attached to every analysis result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the analysis completed
    pub completed_at: DateTime<Utc>,
    /// Model identifier used for inference
    pub model: String,
    /// Wall-clock duration of the request
    pub duration_ms: u64,
    /// Cache-hit classification
    pub cache_hit: CacheHitClass,
    /// Total retries across all inference attempts
    pub retry_count: u32,
    /// Whether this is a degraded (reduced) result
    pub degraded: bool,
    /// Number of payload chunks analysed
    pub chunk_count: usize,
    /// Number of chunks that fell back to a degraded response
    pub degraded_chunks: usize,
    /// Number of normalized history entries analysed
    pub entry_count: usize,
    /// Digest of the analysed payload
    pub payload_digest: String,
}

// ============================================================================
// ANALYSIS RESULT
// ============================================================================

/// The full output of an analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Discovered connections, in emission order
    pub connections: Vec<Connection>,
    /// Discovered meta-patterns, in emission order
    pub meta_patterns: Vec<MetaPattern>,
    /// Overall summary
    pub summary: String,
    /// Ordered recommendations
    pub recommendations: Vec<String>,
    /// Result metadata
    pub metadata: Metadata,
}

impl AnalysisResult {
    /// Whether this result was produced by the degraded fallback path
    pub fn is_degraded(&self) -> bool {
        self.metadata.degraded
    }

    /// Copy of this result re-labelled for a later request served from cache
    pub fn served_from_cache(&self, cache_hit: CacheHitClass, duration_ms: u64) -> Self {
        let mut result = self.clone();
        result.metadata.cache_hit = cache_hit;
        result.metadata.duration_ms = duration_ms;
        result.metadata.retry_count = 0;
        result.metadata.completed_at = Utc::now();
        result
    }
}

// ============================================================================
// REQUEST PARAMETERS
// ============================================================================

/// Response-format hint forwarded to the prompt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Full descriptions and recommendations
    #[default]
    Detailed,
    /// Short descriptions, at most a handful of items
    Concise,
}

impl std::fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseFormat::Detailed => write!(f, "detailed"),
            ResponseFormat::Concise => write!(f, "concise"),
        }
    }
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detailed" => Ok(ResponseFormat::Detailed),
            "concise" => Ok(ResponseFormat::Concise),
            _ => Err(format!("Unknown response format: {}", s)),
        }
    }
}

/// Parameters supplied by the request gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisParameters {
    /// Bypass the result tier and recompute
    pub force_refresh: bool,
    /// Response-format hint
    pub response_format: ResponseFormat,
    /// Optional focus hint (e.g. "sleep", "work habits")
    pub focus: Option<String>,
}

impl AnalysisParameters {
    /// Stable fingerprint of everything that changes the analysis output.
    ///
    /// `force_refresh` is excluded: it changes how a request is served, not
    /// what the answer is.
    pub fn fingerprint(&self) -> String {
        let focus = self.normalized_focus().unwrap_or_default();
        format!("format={};focus={}", self.response_format, focus)
    }

    /// Focus hint as used everywhere: lowercased, whitespace collapsed,
    /// `None` when blank
    pub fn normalized_focus(&self) -> Option<String> {
        self.focus
            .as_deref()
            .map(|f| f.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
            .filter(|f| !f.is_empty())
    }
}
