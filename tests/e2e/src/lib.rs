//! End-to-end test support for Reverie
//!
//! - `mocks`: scripted inference service and fixture history
//! - `harness`: temporary SQLite stores and engine factories

pub mod harness;
pub mod mocks;
