//! AI Orchestrator
//!
//! Wraps the unreliable inference service:
//!
//! - per-chunk prompt construction, keyed into the response tier together
//!   with the model and generation settings
//! - per-attempt timeouts, jittered exponential backoff, bounded retries
//! - tolerant parsing, then strict validation against the payload
//! - degraded fallback once retries are exhausted
//! - incremental partial results for streaming services
//! - bounded-parallel chunk fan-out with order-preserving merge

mod merge;
mod parser;
mod prompt;
mod retry;
mod validate;

pub mod inference;

#[cfg(feature = "http")]
pub mod http;

pub use inference::{
    FragmentStream, InferenceError, InferenceRequest, InferenceService,
};
pub use merge::{jaccard_similarity, normalize_text};
pub use parser::{ParseError, extract_partial, extract_structure};
pub use prompt::InsightPromptBuilder;
pub use retry::{RetryMachine, RetryOutcome, RetryPolicy, RetryState, run_with_retry};
pub use validate::{
    ValidatedInsights, ValidationError, ValidationMode, ValidationReport, validate_insights,
};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheManager, ResponseTier, TierKind};
use crate::config::OrchestratorConfig;
use crate::digest::{Digest, DigestBuilder};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricEvent, MetricsSink};
use crate::types::{AnalysisParameters, CacheHitClass, Connection, MetaPattern};
use crate::validator::AnalysisPayload;

const DEGRADED_SUMMARY: &str = "We couldn't complete a full analysis of your history right now, \
so these results are reduced. Please try again later for a complete set of insights.";

const PARTIALLY_DEGRADED_NOTE: &str =
    "Part of your history could not be analysed right now, so some insights may be missing.";

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Merged output of all chunks, before metadata is attached
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratedInsights {
    pub connections: Vec<Connection>,
    pub meta_patterns: Vec<MetaPattern>,
    pub summary: String,
    pub recommendations: Vec<String>,
    /// Retries summed over every chunk
    pub retry_count: u32,
    pub chunk_count: usize,
    /// Chunks whose raw response came from the response tier
    pub response_cache_hits: usize,
    /// Chunks that fell back to a degraded response
    pub degraded_chunks: usize,
    /// Repairs summed over every chunk
    pub report: ValidationReport,
}

impl OrchestratedInsights {
    /// `response-hit` only when no chunk needed a fresh inference call
    pub fn cache_hit_class(&self) -> CacheHitClass {
        if self.chunk_count > 0 && self.response_cache_hits == self.chunk_count {
            CacheHitClass::ResponseHit
        } else {
            CacheHitClass::Miss
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.chunk_count > 0 && self.degraded_chunks == self.chunk_count
    }
}

/// Validated prefix of a streaming analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialInsights {
    pub connections: Vec<Connection>,
    pub meta_patterns: Vec<MetaPattern>,
    pub summary: Option<String>,
    pub recommendations: Vec<String>,
    /// Chunks fully analysed so far
    pub chunks_completed: usize,
    pub chunk_count: usize,
}

/// Result of one chunk
#[derive(Debug, Clone)]
struct ChunkOutcome {
    insights: ValidatedInsights,
    retries: u32,
    from_cache: bool,
    degraded: bool,
}

impl ChunkOutcome {
    fn degraded(retries: u32) -> Self {
        Self {
            insights: ValidatedInsights::default(),
            retries,
            from_cache: false,
            degraded: true,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Drives inference for a prepared payload
pub struct Orchestrator {
    inference: Arc<dyn InferenceService>,
    cache: Arc<CacheManager>,
    metrics: Arc<dyn MetricsSink>,
    config: OrchestratorConfig,
    prompts: InsightPromptBuilder,
}

impl Orchestrator {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        cache: Arc<CacheManager>,
        metrics: Arc<dyn MetricsSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inference,
            cache,
            metrics,
            config,
            prompts: InsightPromptBuilder::new(),
        }
    }

    /// Replace the prompt builder
    pub fn with_prompts(mut self, prompts: InsightPromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Model identifier reported in metadata
    pub fn model_id(&self) -> String {
        let id = self.inference.model_id();
        if id.is_empty() {
            self.config.model.clone()
        } else {
            id
        }
    }

    pub fn supports_streaming(&self) -> bool {
        self.inference.supports_streaming()
    }

    /// Analyse every chunk (bounded parallelism, order preserved) and merge
    pub async fn analyze(
        &self,
        payload: &AnalysisPayload,
        params: &AnalysisParameters,
    ) -> EngineResult<OrchestratedInsights> {
        let outcomes: Vec<EngineResult<ChunkOutcome>> = stream::iter(0..payload.chunk_count())
            .map(|index| self.analyze_chunk(payload, params, index))
            .buffered(self.config.chunk_parallelism.max(1))
            .collect()
            .await;

        let chunks = outcomes.into_iter().collect::<EngineResult<Vec<_>>>()?;
        Ok(self.merge(chunks))
    }

    /// Analyse chunks in order, reporting each strictly-refining validated
    /// prefix through `on_partial`. Services that cannot stream produce no
    /// partials.
    pub async fn analyze_streaming<P>(
        &self,
        payload: &AnalysisPayload,
        params: &AnalysisParameters,
        mut on_partial: P,
    ) -> EngineResult<OrchestratedInsights>
    where
        P: FnMut(PartialInsights) + Send,
    {
        if !self.supports_streaming() {
            return self.analyze(payload, params).await;
        }

        let chunk_count = payload.chunk_count();
        let mut finished: Vec<ChunkOutcome> = Vec::with_capacity(chunk_count);
        let mut emitted = ValidatedInsights::default();

        for index in 0..chunk_count {
            let outcome = self
                .stream_chunk(payload, params, index, &finished, &mut emitted, &mut on_partial)
                .await?;
            finished.push(outcome);
        }

        Ok(self.merge(finished))
    }

    // ------------------------------------------------------------------------
    // Single chunk
    // ------------------------------------------------------------------------

    fn request_for(&self, prompt: String) -> InferenceRequest {
        InferenceRequest {
            prompt,
            model: self.config.model.clone(),
            max_output_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Response tier key: the prompt and every setting that shapes generation
    fn response_key(&self, request: &InferenceRequest) -> Digest {
        let mut builder = DigestBuilder::new();
        builder
            .push(&request.prompt)
            .push(&request.model)
            .push(self.model_id())
            .push(request.max_output_tokens.to_le_bytes())
            .push(request.temperature.to_bits().to_le_bytes());
        builder.finish()
    }

    /// Serve a chunk from the response tier, re-validating the cached text
    fn cached_chunk(&self, prompt_key: &Digest, known: &HashSet<&str>) -> Option<ChunkOutcome> {
        let cached = self.cache.get::<ResponseTier>(prompt_key);
        self.metrics.record(MetricEvent::CacheLookup {
            tier: TierKind::Response,
            hit: cached.is_some(),
        });
        let raw = cached?;
        match parse_and_validate(&raw, known) {
            Ok(insights) => Some(ChunkOutcome {
                insights,
                retries: 0,
                from_cache: true,
                degraded: false,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Cached response failed validation; discarding");
                self.cache.invalidate::<ResponseTier>(prompt_key);
                None
            }
        }
    }

    async fn analyze_chunk(
        &self,
        payload: &AnalysisPayload,
        params: &AnalysisParameters,
        index: usize,
    ) -> EngineResult<ChunkOutcome> {
        let entries = payload.chunk(index);
        let known: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let prompt = self
            .prompts
            .build(entries, params, index, payload.chunk_count());
        let request = self.request_for(prompt);
        let prompt_key = self.response_key(&request);

        if let Some(outcome) = self.cached_chunk(&prompt_key, &known) {
            return Ok(outcome);
        }

        let timeout = self.config.attempt_timeout();
        let inference = &self.inference;
        let request_ref = &request;
        let known_ref = &known;

        let outcome = run_with_retry(
            RetryPolicy::from_config(&self.config),
            move |attempt| async move {
                tracing::debug!(chunk = index, attempt, "Inference attempt");
                let raw = tokio::time::timeout(timeout, inference.generate(request_ref))
                    .await
                    .map_err(|_| InferenceError::Timeout(timeout))??;
                let insights = parse_and_validate(&raw, known_ref)?;
                Ok::<_, InferenceError>((raw, insights))
            },
            |retry, error, delay| self.record_retry(index, retry, error, delay),
        )
        .await;

        self.finish_chunk(index, prompt_key, outcome)
    }

    async fn stream_chunk<P>(
        &self,
        payload: &AnalysisPayload,
        params: &AnalysisParameters,
        index: usize,
        finished: &[ChunkOutcome],
        emitted: &mut ValidatedInsights,
        on_partial: &mut P,
    ) -> EngineResult<ChunkOutcome>
    where
        P: FnMut(PartialInsights) + Send,
    {
        let entries = payload.chunk(index);
        let known: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let prompt = self
            .prompts
            .build(entries, params, index, payload.chunk_count());
        let request = self.request_for(prompt);
        let prompt_key = self.response_key(&request);

        if let Some(outcome) = self.cached_chunk(&prompt_key, &known) {
            return Ok(outcome);
        }

        let timeout = self.config.attempt_timeout();
        let mut machine = RetryMachine::new(RetryPolicy::from_config(&self.config));
        let chunk_count = payload.chunk_count();

        let outcome = loop {
            match machine.state().clone() {
                RetryState::Attempting { attempt } => {
                    tracing::debug!(chunk = index, attempt, "Streaming inference attempt");
                    let attempt_result = tokio::time::timeout(
                        timeout,
                        self.stream_attempt(&request, &known, |partial| {
                            let cumulative = accumulate(finished, partial);
                            if cumulative.refines(emitted) {
                                on_partial(PartialInsights {
                                    connections: cumulative.connections.clone(),
                                    meta_patterns: cumulative.meta_patterns.clone(),
                                    summary: cumulative.summary.clone(),
                                    recommendations: cumulative.recommendations.clone(),
                                    chunks_completed: finished.len(),
                                    chunk_count,
                                });
                                *emitted = cumulative;
                            }
                        }),
                    )
                    .await
                    .unwrap_or(Err(InferenceError::Timeout(timeout)));

                    match attempt_result {
                        Ok(value) => {
                            machine.succeed();
                            break RetryOutcome::Succeeded {
                                value,
                                retries: machine.retries(),
                            };
                        }
                        Err(error) => machine.fail(error),
                    }
                }
                RetryState::Backoff { delay, error, .. } => {
                    self.record_retry(index, machine.retries(), &error, delay);
                    tokio::time::sleep(delay).await;
                    machine.resume();
                }
                RetryState::Failed(error) => {
                    break RetryOutcome::Failed {
                        error,
                        retries: machine.retries(),
                    };
                }
                RetryState::Degraded { last_error } => {
                    break RetryOutcome::Exhausted {
                        last_error,
                        retries: machine.retries(),
                    };
                }
                RetryState::Succeeded { .. } => {
                    unreachable!("success breaks out of the attempt arm")
                }
            }
        };

        self.finish_chunk(index, prompt_key, outcome)
    }

    /// One streaming attempt: accumulate fragments, surface validated
    /// prefixes, then fully validate the complete text
    async fn stream_attempt<F>(
        &self,
        request: &InferenceRequest,
        known: &HashSet<&str>,
        mut on_prefix: F,
    ) -> Result<(String, ValidatedInsights), InferenceError>
    where
        F: FnMut(ValidatedInsights),
    {
        let mut fragments = self.inference.generate_stream(request).await?;
        let mut buffer = String::new();

        while let Some(fragment) = fragments.next().await {
            buffer.push_str(&fragment?);
            if let Some(map) = extract_partial(&buffer) {
                if let Ok(prefix) = validate_insights(&map, known, ValidationMode::Partial) {
                    on_prefix(prefix);
                }
            }
        }

        let insights = parse_and_validate(&buffer, known)?;
        Ok((buffer, insights))
    }

    fn record_retry(&self, chunk: usize, retry: u32, error: &InferenceError, delay: std::time::Duration) {
        tracing::warn!(
            chunk,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Inference attempt failed; retrying"
        );
        self.metrics.record(MetricEvent::Retry {
            retry,
            reason: error.to_string(),
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn finish_chunk(
        &self,
        index: usize,
        prompt_key: Digest,
        outcome: RetryOutcome<(String, ValidatedInsights)>,
    ) -> EngineResult<ChunkOutcome> {
        match outcome {
            RetryOutcome::Succeeded {
                value: (raw, insights),
                retries,
            } => {
                // Only validated responses are cached
                self.cache
                    .put::<ResponseTier>(prompt_key, Arc::new(raw), None);
                Ok(ChunkOutcome {
                    insights,
                    retries,
                    from_cache: false,
                    degraded: false,
                })
            }
            RetryOutcome::Failed { error, retries } => {
                tracing::error!(chunk = index, retries, error = %error, "Inference failed permanently");
                Err(EngineError::upstream(error))
            }
            RetryOutcome::Exhausted {
                last_error,
                retries,
            } => {
                tracing::warn!(
                    chunk = index,
                    retries,
                    error = %last_error,
                    "Retries exhausted; degrading chunk"
                );
                self.metrics.record(MetricEvent::Degraded {
                    chunk: index,
                    reason: last_error.to_string(),
                });
                Ok(ChunkOutcome::degraded(retries))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------------

    fn merge(&self, chunks: Vec<ChunkOutcome>) -> OrchestratedInsights {
        let chunk_count = chunks.len();
        let mut connections = Vec::new();
        let mut patterns = Vec::new();
        let mut recommendations = Vec::new();
        let mut summaries = Vec::new();
        let mut retry_count = 0;
        let mut response_cache_hits = 0;
        let mut degraded_chunks = 0;
        let mut report = ValidationReport::default();

        for chunk in chunks {
            retry_count += chunk.retries;
            if chunk.from_cache {
                response_cache_hits += 1;
            }
            if chunk.degraded {
                degraded_chunks += 1;
            }
            let r = chunk.insights.report;
            report.unknown_ids_dropped += r.unknown_ids_dropped;
            report.connections_dropped += r.connections_dropped;
            report.patterns_dropped += r.patterns_dropped;
            report.scores_clamped += r.scores_clamped;
            report.categories_remapped += r.categories_remapped;
            report.recommendations_dropped += r.recommendations_dropped;

            connections.extend(chunk.insights.connections);
            patterns.extend(chunk.insights.meta_patterns);
            recommendations.extend(chunk.insights.recommendations);
            if let Some(summary) = chunk.insights.summary.filter(|s| !s.is_empty()) {
                summaries.push(summary);
            }
        }

        let summary = if chunk_count > 0 && degraded_chunks == chunk_count {
            DEGRADED_SUMMARY.to_string()
        } else if degraded_chunks > 0 {
            summaries.push(PARTIALLY_DEGRADED_NOTE.to_string());
            summaries.join(" ")
        } else {
            summaries.join(" ")
        };

        OrchestratedInsights {
            connections: merge::merge_connections(connections),
            meta_patterns: merge::merge_patterns(
                patterns,
                self.config.pattern_similarity_threshold,
            ),
            summary,
            recommendations: merge::merge_recommendations(recommendations),
            retry_count,
            chunk_count,
            response_cache_hits,
            degraded_chunks,
            report,
        }
    }
}

/// Parse then strictly validate raw response text. Any failure is a
/// retryable malformed response.
fn parse_and_validate(raw: &str, known: &HashSet<&str>) -> Result<ValidatedInsights, InferenceError> {
    let map =
        extract_structure(raw).map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;
    validate_insights(&map, known, ValidationMode::Strict)
        .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
}

/// Finished chunks followed by the current chunk's validated prefix
fn accumulate(finished: &[ChunkOutcome], current: ValidatedInsights) -> ValidatedInsights {
    let mut out = ValidatedInsights::default();
    let mut summaries = Vec::new();
    for chunk in finished {
        out.connections.extend(chunk.insights.connections.iter().cloned());
        out.meta_patterns.extend(chunk.insights.meta_patterns.iter().cloned());
        out.recommendations.extend(chunk.insights.recommendations.iter().cloned());
        if let Some(summary) = chunk.insights.summary.as_ref().filter(|s| !s.is_empty()) {
            summaries.push(summary.clone());
        }
    }
    out.connections.extend(current.connections);
    out.meta_patterns.extend(current.meta_patterns);
    out.recommendations.extend(current.recommendations);
    if let Some(summary) = current.summary.filter(|s| !s.is_empty()) {
        summaries.push(summary);
    }
    if !summaries.is_empty() {
        out.summary = Some(summaries.join(" "));
    }
    out
}
