//! History store seam
//!
//! The engine only reads history. Records are immutable and owned by the
//! store; the engine never writes them back. The one outbound write is the
//! optional `record_analysis_metadata` hook, fired after fresh computations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::types::Metadata;

// ============================================================================
// RECORDS
// ============================================================================

/// One user-authored history entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Stable identifier, referenced by connections and patterns
    pub id: String,
    /// Raw content (may contain markup)
    pub content: String,
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl HistoryRecord {
    pub fn new(id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            timestamp,
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// History store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Store is unreachable
    #[error("History store unavailable: {0}")]
    Unavailable(String),
    /// Database error
    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// Stored data could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// History store result type
pub type HistoryResult<T> = std::result::Result<T, HistoryError>;

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Read access to a user's interaction history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load every record for a user
    async fn load_records(&self, user_id: &str) -> HistoryResult<Vec<HistoryRecord>>;

    /// Persist metadata for a completed analysis. Failures are logged by the
    /// engine and never affect the request.
    async fn record_analysis_metadata(
        &self,
        _user_id: &str,
        _metadata: &Metadata,
    ) -> HistoryResult<()> {
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Process-local history store
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<String, Vec<HistoryRecord>>>,
    analyses: RwLock<Vec<(String, Metadata)>>,
    unavailable: AtomicBool,
    loads: AtomicUsize,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a user's records
    pub fn set_records(&self, user_id: &str, records: Vec<HistoryRecord>) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        map.insert(user_id.to_string(), records);
    }

    /// Append records for a user
    pub fn append_records(&self, user_id: &str, records: impl IntoIterator<Item = HistoryRecord>) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        map.entry(user_id.to_string()).or_default().extend(records);
    }

    /// Make subsequent loads fail with `HistoryError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `load_records` calls served
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Metadata recorded through the write hook, oldest first
    pub fn recorded_analyses(&self) -> Vec<(String, Metadata)> {
        self.analyses.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load_records(&self, user_id: &str) -> HistoryResult<Vec<HistoryRecord>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HistoryError::Unavailable("store marked unavailable".to_string()));
        }
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(user_id).cloned().unwrap_or_default())
    }

    async fn record_analysis_metadata(
        &self,
        user_id: &str,
        metadata: &Metadata,
    ) -> HistoryResult<()> {
        let mut analyses = self.analyses.write().unwrap_or_else(|e| e.into_inner());
        analyses.push((user_id.to_string(), metadata.clone()));
        Ok(())
    }
}
