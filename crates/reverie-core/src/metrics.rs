//! Metrics and metadata recording
//!
//! Recording is synchronous and fire-and-forget: a sink must never block
//! or fail the request path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::time::Instant;

use crate::cache::TierKind;
use crate::types::{CacheHitClass, Metadata};
use crate::validator::AnalysisPayload;

// ============================================================================
// EVENTS
// ============================================================================

/// Observable engine events
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    CacheLookup { tier: TierKind, hit: bool },
    QueueDepth { queued: usize },
    InFlight { count: usize },
    Retry { retry: u32, reason: String, delay_ms: u64 },
    Degraded { chunk: usize, reason: String },
    Rejected { in_flight: usize, queued: usize },
    InsufficientData { record_count: usize },
    RequestCompleted {
        duration_ms: u64,
        cache_hit: CacheHitClass,
        retry_count: u32,
        degraded: bool,
    },
    RequestFailed { code: &'static str },
}

/// Destination for metric events
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

// ============================================================================
// SINKS
// ============================================================================

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Emits events as structured `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::CacheLookup { tier, hit } => {
                tracing::debug!(tier = %tier, hit, "cache lookup");
            }
            MetricEvent::QueueDepth { queued } => tracing::debug!(queued, "queue depth"),
            MetricEvent::InFlight { count } => tracing::debug!(in_flight = count, "in flight"),
            MetricEvent::Retry {
                retry,
                reason,
                delay_ms,
            } => tracing::info!(retry, delay_ms, reason = %reason, "retrying inference"),
            MetricEvent::Degraded { chunk, reason } => {
                tracing::warn!(chunk, reason = %reason, "chunk degraded")
            }
            MetricEvent::Rejected { in_flight, queued } => {
                tracing::warn!(in_flight, queued, "request rejected")
            }
            MetricEvent::InsufficientData { record_count } => {
                tracing::info!(record_count, "insufficient data")
            }
            MetricEvent::RequestCompleted {
                duration_ms,
                cache_hit,
                retry_count,
                degraded,
            } => tracing::info!(
                duration_ms,
                cache_hit = %cache_hit,
                retry_count,
                degraded,
                "analysis completed"
            ),
            MetricEvent::RequestFailed { code } => tracing::warn!(code, "analysis failed"),
        }
    }
}

/// Counter snapshot kept by [`InMemoryMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub source_hits: u64,
    pub source_misses: u64,
    pub response_hits: u64,
    pub response_misses: u64,
    pub result_hits: u64,
    pub result_misses: u64,
    pub retries: u64,
    pub degraded_chunks: u64,
    pub rejected: u64,
    pub insufficient: u64,
    pub completed: u64,
    pub failed: u64,
    pub max_queue_depth: usize,
    pub max_in_flight: usize,
}

/// Accumulates counters in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    snapshot: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, event: MetricEvent) {
        let mut s = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            MetricEvent::CacheLookup { tier, hit } => {
                let counter = match (tier, hit) {
                    (TierKind::Source, true) => &mut s.source_hits,
                    (TierKind::Source, false) => &mut s.source_misses,
                    (TierKind::Response, true) => &mut s.response_hits,
                    (TierKind::Response, false) => &mut s.response_misses,
                    (TierKind::Result, true) => &mut s.result_hits,
                    (TierKind::Result, false) => &mut s.result_misses,
                };
                *counter += 1;
            }
            MetricEvent::QueueDepth { queued } => {
                s.max_queue_depth = s.max_queue_depth.max(queued);
            }
            MetricEvent::InFlight { count } => s.max_in_flight = s.max_in_flight.max(count),
            MetricEvent::Retry { .. } => s.retries += 1,
            MetricEvent::Degraded { .. } => s.degraded_chunks += 1,
            MetricEvent::Rejected { .. } => s.rejected += 1,
            MetricEvent::InsufficientData { .. } => s.insufficient += 1,
            MetricEvent::RequestCompleted { .. } => s.completed += 1,
            MetricEvent::RequestFailed { .. } => s.failed += 1,
        }
    }
}

// ============================================================================
// REQUEST TIMER
// ============================================================================

/// Wall-clock timer for one request; builds its [`Metadata`]
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    started: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Metadata for a freshly computed result
    pub fn metadata(
        &self,
        model: &str,
        cache_hit: CacheHitClass,
        retry_count: u32,
        payload: &AnalysisPayload,
        degraded_chunks: usize,
    ) -> Metadata {
        let chunk_count = payload.chunk_count();
        Metadata {
            completed_at: Utc::now(),
            model: model.to_string(),
            duration_ms: self.elapsed_ms(),
            cache_hit,
            retry_count,
            degraded: chunk_count > 0 && degraded_chunks == chunk_count,
            chunk_count,
            degraded_chunks,
            entry_count: payload.entries.len(),
            payload_digest: payload.digest.to_string(),
        }
    }
}
