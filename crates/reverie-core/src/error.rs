//! Engine error types
//!
//! Hard errors only. Expected, user-actionable outcomes (insufficient data,
//! capacity exceeded) are typed outcomes, and retryable inference failures
//! never leave the orchestrator.

use thiserror::Error;

/// Errors surfaced to the request gateway
///
/// `Clone` so a shared computation can hand the same error to every
/// follower waiting on it.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Non-retryable inference failure (auth, bad request, misconfiguration)
    #[error("Inference service unavailable: {message}")]
    UpstreamUnavailable { message: String },
    /// History store failure (not retried by the engine)
    #[error("History data unavailable: {message}")]
    DataUnavailable { message: String },
    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// The engine no longer accepts work
    #[error("Engine is shutting down")]
    ShuttingDown,
    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an upstream error from any displayable error
    pub fn upstream<E: std::fmt::Display>(e: E) -> Self {
        Self::UpstreamUnavailable {
            message: e.to_string(),
        }
    }

    /// Create a data-unavailable error from any displayable error
    pub fn data_unavailable<E: std::fmt::Display>(e: E) -> Self {
        Self::DataUnavailable {
            message: e.to_string(),
        }
    }

    /// Message safe to show end users. Full detail stays in `Display` for logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::UpstreamUnavailable { .. } => {
                "Insight analysis is temporarily unavailable. Please try again later."
            }
            EngineError::DataUnavailable { .. } => {
                "Your history could not be loaded right now. Please try again later."
            }
            EngineError::Config(_) => "Insight analysis is not configured correctly.",
            EngineError::ShuttingDown => "The service is restarting. Please try again shortly.",
            EngineError::Internal(_) => "Something went wrong while analysing your history.",
        }
    }

    /// Short machine-readable code for logs and metrics
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UpstreamUnavailable { .. } => "upstream_unavailable",
            EngineError::DataUnavailable { .. } => "data_unavailable",
            EngineError::Config(_) => "config",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Engine result type
pub type EngineResult<T> = std::result::Result<T, EngineError>;
