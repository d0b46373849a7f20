//! Engine Factory
//!
//! Builds engines wired to test doubles with timings short enough for
//! paused-clock tests.

use reverie_core::{
    EngineConfig, HistoryRecord, HistoryStore, InMemoryHistoryStore, InMemoryMetrics,
    InsightEngine,
};
use std::sync::Arc;

use crate::mocks::ScriptedInference;

/// An engine plus handles to everything it talks to
pub struct TestEngine {
    pub engine: InsightEngine,
    pub history: Arc<InMemoryHistoryStore>,
    pub inference: Arc<ScriptedInference>,
    pub metrics: Arc<InMemoryMetrics>,
}

/// Builder for [`TestEngine`]
pub struct TestEngineBuilder {
    config: EngineConfig,
    history: Arc<InMemoryHistoryStore>,
    external_history: Option<Arc<dyn HistoryStore>>,
    inference: Arc<ScriptedInference>,
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Self::test_config(),
            history: Arc::new(InMemoryHistoryStore::new()),
            external_history: None,
            inference: Arc::new(ScriptedInference::new([])),
        }
    }

    /// Defaults with short timeouts and backoff, and no background sweeper
    pub fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.orchestrator.attempt_timeout_secs = 5;
        config.orchestrator.max_retries = 2;
        config.orchestrator.backoff_base_ms = 100;
        config.orchestrator.backoff_max_ms = 1_000;
        config.cache.sweep_interval_secs = 0;
        config
    }

    pub fn config(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn records(self, user_id: &str, records: Vec<HistoryRecord>) -> Self {
        self.history.set_records(user_id, records);
        self
    }

    /// Use another history store (e.g. SQLite) instead of the in-memory one
    pub fn history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.external_history = Some(store);
        self
    }

    pub fn inference(mut self, inference: ScriptedInference) -> Self {
        self.inference = Arc::new(inference);
        self
    }

    pub fn build(self) -> TestEngine {
        let metrics = Arc::new(InMemoryMetrics::new());
        let history: Arc<dyn HistoryStore> = match self.external_history {
            Some(store) => store,
            None => self.history.clone(),
        };
        let engine = InsightEngine::with_metrics(
            self.config,
            history,
            self.inference.clone(),
            metrics.clone(),
        )
        .expect("test config must be valid");

        TestEngine {
            engine,
            history: self.history,
            inference: self.inference,
            metrics,
        }
    }
}
