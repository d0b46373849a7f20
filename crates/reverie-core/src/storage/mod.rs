//! Storage Module
//!
//! SQLite-backed history store with:
//! - per-user immutable history records
//! - an analysis run log fed by the engine's metadata hook
//! - versioned schema migrations

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{AnalysisRun, SqliteHistoryStore};
