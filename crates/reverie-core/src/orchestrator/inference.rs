//! Inference service seam
//!
//! The engine talks to the external text-generation service only through
//! [`InferenceService`]. Implementations return raw text (or a stream of
//! text fragments); parsing and validation happen in the orchestrator.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;

/// One inference call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Failure of a single inference attempt
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    /// The attempt exceeded its timeout
    #[error("Inference attempt timed out after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(String),
    /// Rate limited by the service
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Service-side failure (5xx)
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Request rejected (non-retryable 4xx)
    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },
    /// Authentication or authorization failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Streaming connection broke mid-response
    #[error("Stream error: {0}")]
    Stream(String),
    /// Response text contained no usable structure
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Timeout(_)
            | InferenceError::Transport(_)
            | InferenceError::RateLimited { .. }
            | InferenceError::Server { .. }
            | InferenceError::Stream(_)
            | InferenceError::MalformedResponse(_) => true,
            InferenceError::Rejected { .. } | InferenceError::Unauthorized(_) => false,
        }
    }

    /// Server-provided minimum delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InferenceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => InferenceError::Unauthorized(message),
            429 => InferenceError::RateLimited { retry_after: None },
            408 => InferenceError::Timeout(Duration::ZERO),
            500..=599 => InferenceError::Server { status, message },
            _ => InferenceError::Rejected { status, message },
        }
    }
}

/// Stream of response text fragments
pub type FragmentStream = BoxStream<'static, Result<String, InferenceError>>;

/// External text-generation service
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Generate a complete response
    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError>;

    /// Generate a response as a stream of fragments.
    ///
    /// The default produces the complete response as a single fragment.
    async fn generate_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<FragmentStream, InferenceError> {
        let text = self.generate(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    /// Whether `generate_stream` delivers incremental fragments
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Model identifier reported in result metadata
    fn model_id(&self) -> String;
}
