//! Test Database Manager
//!
//! Isolated SQLite history stores for journey tests. Each manager owns a
//! temporary directory that is removed when the manager is dropped.

use reverie_core::{HistoryRecord, SqliteHistoryStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Manager for test databases
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabaseManager::new_temp();
/// db.seed("u1", &TestDataFactory::journal(8));
/// let engine = TestEngineBuilder::new().history(db.store.clone()).build();
/// ```
pub struct TestDatabaseManager {
    /// The store, shareable with an engine
    pub store: Arc<SqliteHistoryStore>,
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestDatabaseManager {
    /// Create a store in a fresh temporary directory
    pub fn new_temp() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("reverie_test.db");
        let store = SqliteHistoryStore::new(Some(db_path.clone()))
            .expect("Failed to open test history store");

        Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
            db_path,
        }
    }

    /// Insert records for a user, returning how many were new
    pub fn seed(&self, user_id: &str, records: &[HistoryRecord]) -> usize {
        self.store
            .append_records(user_id, records)
            .expect("Failed to seed records")
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Open a second store on the same file
    pub fn reopen(&self) -> SqliteHistoryStore {
        SqliteHistoryStore::new(Some(self.db_path.clone())).expect("Failed to reopen store")
    }

    /// Poll until the run log holds `n` rows for `user_id`
    ///
    /// The metadata hook runs detached from the request, so tests wait for it.
    pub async fn wait_for_runs(&self, user_id: &str, n: usize) -> usize {
        for _ in 0..200 {
            let count = self
                .store
                .recent_runs(Some(user_id), 1_000)
                .map(|runs| runs.len())
                .unwrap_or(0);
            if count >= n {
                return count;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run log for {} never reached {} rows", user_id, n);
    }
}
