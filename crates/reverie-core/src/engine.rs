//! Insight Engine
//!
//! The explicitly constructed service instance. It owns the three cache
//! tiers, the pending-request set and the sweeper task, and wires the
//! request path:
//!
//! ```text
//! history store → source tier / validator → result tier
//!     → concurrency controller → orchestrator → result tier → metadata hook
//! ```

use futures::Stream;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheManager, CacheStats, ResultTier, SourceKey, SourceTier, TierKind};
use crate::concurrency::{
    CapacityExceeded, ConcurrencyController, ControllerStats, SubmissionRole, SubmitError,
};
use crate::config::EngineConfig;
use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};
use crate::history::HistoryStore;
use crate::metrics::{MetricEvent, MetricsSink, RequestTimer, TracingMetrics};
use crate::orchestrator::{
    InferenceService, OrchestratedInsights, Orchestrator, PartialInsights,
};
use crate::types::{AnalysisParameters, AnalysisResult, CacheHitClass, Metadata};
use crate::validator::{AnalysisPayload, InsufficientData, Preparation, Validator, raw_history_digest};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Outcome of a non-streaming analysis request
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Completed(AnalysisResult),
    InsufficientData(InsufficientData),
    CapacityExceeded(CapacityExceeded),
}

impl AnalysisOutcome {
    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            AnalysisOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<AnalysisResult> {
        match self {
            AnalysisOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }
}

/// One event of a streaming analysis
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    /// Validated, strictly refining prefix of the result
    Partial(PartialInsights),
    /// Complete result; always the last event on success
    Final(AnalysisResult),
    /// Hard error; always the last event on failure
    Failed(EngineError),
}

impl AnalysisEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisEvent::Partial(_))
    }
}

/// Outcome of a streaming analysis request
pub enum StreamingOutcome {
    Streaming(AnalysisStream),
    InsufficientData(InsufficientData),
    CapacityExceeded(CapacityExceeded),
}

/// Finite, non-restartable sequence of [`AnalysisEvent`]s ending with
/// exactly one terminal event
pub struct AnalysisStream {
    rx: mpsc::UnboundedReceiver<AnalysisEvent>,
    finished: bool,
}

impl AnalysisStream {
    fn new(rx: mpsc::UnboundedReceiver<AnalysisEvent>) -> Self {
        Self { rx, finished: false }
    }

    /// Stream holding only a final result
    fn completed(result: AnalysisResult) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AnalysisEvent::Final(result));
        Self::new(rx)
    }

    /// Skip partials and wait for the terminal event
    pub async fn into_final(mut self) -> EngineResult<AnalysisResult> {
        while let Some(event) = self.rx.recv().await {
            match event {
                AnalysisEvent::Partial(_) => continue,
                AnalysisEvent::Final(result) => return Ok(result),
                AnalysisEvent::Failed(error) => return Err(error),
            }
        }
        Err(EngineError::Internal(
            "analysis stream ended without a result".into(),
        ))
    }
}

impl Stream for AnalysisStream {
    type Item = AnalysisEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Producer vanished without a terminal event
                self.finished = true;
                Poll::Ready(Some(AnalysisEvent::Failed(EngineError::Internal(
                    "analysis stream ended without a result".into(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Combined engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub cache: CacheStats,
    pub controller: ControllerStats,
}

/// Request state once history is prepared and no cached result applies
enum Prepared {
    Ready {
        payload: Arc<AnalysisPayload>,
        result_key: Digest,
    },
    Cached(AnalysisResult),
    Insufficient(InsufficientData),
}

// ============================================================================
// ENGINE
// ============================================================================

/// Insight discovery engine
pub struct InsightEngine {
    config: EngineConfig,
    validator: Validator,
    cache: Arc<CacheManager>,
    controller: ConcurrencyController<Arc<AnalysisResult>>,
    orchestrator: Arc<Orchestrator>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<dyn MetricsSink>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InsightEngine {
    /// Create an engine reporting metrics through `tracing`
    pub fn new(
        config: EngineConfig,
        history: Arc<dyn HistoryStore>,
        inference: Arc<dyn InferenceService>,
    ) -> EngineResult<Self> {
        Self::with_metrics(config, history, inference, Arc::new(TracingMetrics))
    }

    /// Create an engine with an explicit metrics sink
    ///
    /// Spawns the cache sweeper when called inside a tokio runtime.
    pub fn with_metrics(
        config: EngineConfig,
        history: Arc<dyn HistoryStore>,
        inference: Arc<dyn InferenceService>,
        metrics: Arc<dyn MetricsSink>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let cache = Arc::new(CacheManager::new(&config.cache));
        let orchestrator = Arc::new(Orchestrator::new(
            inference,
            Arc::clone(&cache),
            Arc::clone(&metrics),
            config.orchestrator.clone(),
        ));

        let sweeper = match (config.cache.sweep_interval(), tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(cache.spawn_sweeper(interval)),
            (Some(_), Err(_)) => {
                tracing::warn!("No tokio runtime; cache sweeper disabled (lazy expiry only)");
                None
            }
            (None, _) => None,
        };

        tracing::info!(
            model = %orchestrator.model_id(),
            max_in_flight = config.concurrency.max_in_flight,
            max_queue = config.concurrency.max_queue,
            streaming = orchestrator.supports_streaming(),
            "Insight engine initialized"
        );

        Ok(Self {
            validator: Validator::new(config.validator.clone()),
            controller: ConcurrencyController::new(config.concurrency.clone()),
            config,
            cache,
            orchestrator,
            history,
            metrics,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.all_stats(),
            controller: self.controller.stats(),
        }
    }

    // ------------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------------

    /// Analyse a user's history
    pub async fn request_analysis(
        &self,
        user_id: &str,
        params: &AnalysisParameters,
    ) -> EngineResult<AnalysisOutcome> {
        let timer = RequestTimer::start();
        let outcome = self.analysis(user_id, params, timer).await;
        if let Err(e) = &outcome {
            self.fail(user_id, e);
        }
        outcome
    }

    async fn analysis(
        &self,
        user_id: &str,
        params: &AnalysisParameters,
        timer: RequestTimer,
    ) -> EngineResult<AnalysisOutcome> {
        let (payload, result_key) = match self.prepare(user_id, params, timer).await? {
            Prepared::Ready {
                payload,
                result_key,
            } => (payload, result_key),
            Prepared::Cached(result) => return Ok(AnalysisOutcome::Completed(result)),
            Prepared::Insufficient(data) => return Ok(AnalysisOutcome::InsufficientData(data)),
        };

        let work = self.computation(user_id, params, payload, result_key.clone(), timer, None);
        let submission = match self.controller.submit(result_key, work) {
            Ok(submission) => submission,
            Err(e) => return self.rejected(e).map(AnalysisOutcome::CapacityExceeded),
        };
        self.record_admission();

        if submission.role() == SubmissionRole::Follower {
            tracing::debug!(user_id, "Joined pending analysis");
        }

        let shared = submission.wait().await?;
        let result = self.complete(&shared, timer);
        Ok(AnalysisOutcome::Completed(result))
    }

    /// Analyse a user's history, delivering partial results as they are
    /// validated. Services without streaming support produce only the
    /// terminal event.
    pub async fn request_analysis_streaming(
        &self,
        user_id: &str,
        params: &AnalysisParameters,
    ) -> EngineResult<StreamingOutcome> {
        let timer = RequestTimer::start();

        let prepared = match self.prepare(user_id, params, timer).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail(user_id, &e);
                return Err(e);
            }
        };
        let (payload, result_key) = match prepared {
            Prepared::Ready {
                payload,
                result_key,
            } => (payload, result_key),
            Prepared::Cached(result) => {
                return Ok(StreamingOutcome::Streaming(AnalysisStream::completed(result)));
            }
            Prepared::Insufficient(data) => return Ok(StreamingOutcome::InsufficientData(data)),
        };

        // Partials belong to one caller: a unique key keeps admission
        // control without dedup
        let stream_key = Digest::of_parts([
            result_key.as_str(),
            uuid::Uuid::new_v4().to_string().as_str(),
        ]);

        let (tx, rx) = mpsc::unbounded_channel();
        let work = self.computation(user_id, params, payload, result_key, timer, Some(tx.clone()));
        let submission = match self.controller.submit(stream_key, work) {
            Ok(submission) => submission,
            Err(e) => {
                return self.rejected(e).map(StreamingOutcome::CapacityExceeded);
            }
        };
        self.record_admission();

        let metrics = Arc::clone(&self.metrics);
        let user = user_id.to_string();
        tokio::spawn(async move {
            let event = match submission.wait().await {
                Ok(shared) => {
                    let mut result = (*shared).clone();
                    result.metadata.duration_ms = timer.elapsed_ms();
                    record_completed(metrics.as_ref(), &result.metadata);
                    AnalysisEvent::Final(result)
                }
                Err(e) => {
                    tracing::warn!(user_id = %user, error = %e, "Streaming analysis failed");
                    metrics.record(MetricEvent::RequestFailed { code: e.code() });
                    AnalysisEvent::Failed(e)
                }
            };
            // Receiver may be gone; the computation already finished
            let _ = tx.send(event);
        });

        Ok(StreamingOutcome::Streaming(AnalysisStream::new(rx)))
    }

    /// Load history, prepare the payload and consult the result tier
    async fn prepare(
        &self,
        user_id: &str,
        params: &AnalysisParameters,
        timer: RequestTimer,
    ) -> EngineResult<Prepared> {
        if self.controller.is_closed() {
            return Err(EngineError::ShuttingDown);
        }

        let records = self.history.load_records(user_id).await.map_err(|e| {
            tracing::error!(user_id, error = %e, "Failed to load history");
            EngineError::data_unavailable(e)
        })?;

        let source_key = SourceKey {
            user_id: user_id.to_string(),
            raw_digest: raw_history_digest(user_id, &records),
        };
        let cached_payload = self.cache.get::<SourceTier>(&source_key);
        self.metrics.record(MetricEvent::CacheLookup {
            tier: TierKind::Source,
            hit: cached_payload.is_some(),
        });

        let payload = match cached_payload {
            Some(payload) => payload,
            None => match self.validator.prepare(&records) {
                Preparation::Ready(payload) => {
                    let payload = Arc::new(payload);
                    self.cache
                        .put::<SourceTier>(source_key, Arc::clone(&payload), None);
                    payload
                }
                Preparation::Insufficient(data) => {
                    tracing::info!(
                        user_id,
                        record_count = data.record_count,
                        total_chars = data.total_chars,
                        "Insufficient history for analysis"
                    );
                    self.metrics.record(MetricEvent::InsufficientData {
                        record_count: data.record_count,
                    });
                    return Ok(Prepared::Insufficient(data));
                }
            },
        };

        let result_key = self.result_key(&payload, params);

        if !params.force_refresh {
            let cached = self.cache.get::<ResultTier>(&result_key);
            self.metrics.record(MetricEvent::CacheLookup {
                tier: TierKind::Result,
                hit: cached.is_some(),
            });
            if let Some(result) = cached {
                let result = result.served_from_cache(CacheHitClass::ResultHit, timer.elapsed_ms());
                tracing::info!(user_id, key = %result_key.short(), "Serving cached analysis");
                record_completed(self.metrics.as_ref(), &result.metadata);
                return Ok(Prepared::Cached(result));
            }
        }

        Ok(Prepared::Ready {
            payload,
            result_key,
        })
    }

    /// Result tier key: payload content, parameters and model
    fn result_key(&self, payload: &AnalysisPayload, params: &AnalysisParameters) -> Digest {
        Digest::of_parts([
            payload.digest.as_str(),
            params.fingerprint().as_str(),
            self.orchestrator.model_id().as_str(),
        ])
    }

    /// The shared computation submitted to the controller
    fn computation(
        &self,
        user_id: &str,
        params: &AnalysisParameters,
        payload: Arc<AnalysisPayload>,
        result_key: Digest,
        timer: RequestTimer,
        partials: Option<mpsc::UnboundedSender<AnalysisEvent>>,
    ) -> BoxFuture<'static, EngineResult<Arc<AnalysisResult>>> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let cache = Arc::clone(&self.cache);
        let history = Arc::clone(&self.history);
        let params = params.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            tracing::info!(
                user_id = %user_id,
                entries = payload.entries.len(),
                chunks = payload.chunk_count(),
                key = %result_key.short(),
                "Starting analysis"
            );

            let insights = match partials {
                Some(tx) => {
                    orchestrator
                        .analyze_streaming(&payload, &params, |partial| {
                            let _ = tx.send(AnalysisEvent::Partial(partial));
                        })
                        .await?
                }
                None => orchestrator.analyze(&payload, &params).await?,
            };

            let metadata = timer.metadata(
                &orchestrator.model_id(),
                insights.cache_hit_class(),
                insights.retry_count,
                &payload,
                insights.degraded_chunks,
            );
            let degraded_chunks = insights.degraded_chunks;
            let result = Arc::new(build_result(insights, metadata));

            // Reduced results are served but never cached
            if degraded_chunks == 0 {
                cache.put::<ResultTier>(result_key, Arc::clone(&result), None);
            }

            let recorded = result.metadata.clone();
            tokio::spawn(async move {
                if let Err(e) = history.record_analysis_metadata(&user_id, &recorded).await {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to record analysis metadata");
                }
            });

            Ok(result)
        })
    }

    fn complete(&self, shared: &AnalysisResult, timer: RequestTimer) -> AnalysisResult {
        // Same content for every waiter; duration is per caller
        let mut result = shared.clone();
        result.metadata.duration_ms = timer.elapsed_ms();
        record_completed(self.metrics.as_ref(), &result.metadata);
        result
    }

    fn rejected(&self, error: SubmitError) -> EngineResult<CapacityExceeded> {
        match error {
            SubmitError::CapacityExceeded(rejection) => {
                self.metrics.record(MetricEvent::Rejected {
                    in_flight: rejection.in_flight,
                    queued: rejection.queued,
                });
                Ok(rejection)
            }
            SubmitError::ShuttingDown => Err(EngineError::ShuttingDown),
        }
    }

    fn record_admission(&self) {
        let stats = self.controller.stats();
        self.metrics.record(MetricEvent::QueueDepth {
            queued: stats.queued,
        });
        self.metrics.record(MetricEvent::InFlight {
            count: stats.in_flight,
        });
    }

    fn fail(&self, user_id: &str, error: &EngineError) {
        tracing::warn!(user_id, code = error.code(), error = %error, "Analysis request failed");
        self.metrics.record(MetricEvent::RequestFailed { code: error.code() });
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop admitting work, wait for running and queued computations, then
    /// release caches and the sweeper
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down insight engine");
        self.controller.close();
        self.controller.drain().await;

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        self.cache.clear();
        tracing::info!("Insight engine stopped");
    }
}

impl Drop for InsightEngine {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }
}

fn build_result(insights: OrchestratedInsights, metadata: Metadata) -> AnalysisResult {
    AnalysisResult {
        connections: insights.connections,
        meta_patterns: insights.meta_patterns,
        summary: insights.summary,
        recommendations: insights.recommendations,
        metadata,
    }
}

fn record_completed(metrics: &dyn MetricsSink, metadata: &Metadata) {
    metrics.record(MetricEvent::RequestCompleted {
        duration_ms: metadata.duration_ms,
        cache_hit: metadata.cache_hit,
        retry_count: metadata.retry_count,
        degraded: metadata.degraded,
    });
}
