//! Test doubles and fixture data

mod fixtures;
mod inference;

pub use fixtures::{ResponseBuilder, TestDataFactory};
pub use inference::{ScriptedInference, Step};
