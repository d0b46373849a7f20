//! Test harness: isolated stores and preconfigured engines

mod db_manager;
mod engine_factory;

pub use db_manager::TestDatabaseManager;
pub use engine_factory::{TestEngine, TestEngineBuilder};
