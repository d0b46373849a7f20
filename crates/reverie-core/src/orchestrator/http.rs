//! OpenAI-compatible chat-completions client
//!
//! Each call is a single attempt; retries, timeouts and backoff belong to
//! the orchestrator. Streaming responses are Server-Sent Events whose
//! `data:` lines carry `choices[0].delta.content` fragments, terminated by
//! `data: [DONE]`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;

use super::inference::{FragmentStream, InferenceError, InferenceRequest, InferenceService};

/// Default API base when none is configured
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 200;

/// HTTP inference adapter
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    streaming: bool,
}

impl HttpInferenceClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.into(),
            streaming: true,
        })
    }

    /// Build from `REVERIE_API_BASE` and `REVERIE_API_KEY`
    pub fn from_env(model: impl Into<String>) -> Result<Self, InferenceError> {
        let base = std::env::var("REVERIE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        Self::new(base, std::env::var("REVERIE_API_KEY").ok(), model)
    }

    /// Disable SSE streaming (some compatible servers lack it)
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn body(&self, request: &InferenceRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            &self.model
        } else {
            &request.model
        };
        json!({
            "model": model,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.max_output_tokens,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    /// Send the request; non-success statuses become classified errors
    async fn send(
        &self,
        request: &InferenceRequest,
        stream: bool,
    ) -> Result<reqwest::Response, InferenceError> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .json(&self.body(request, stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(Duration::ZERO)
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Header before body: reading the body consumes the response
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = response.text().await.unwrap_or_default();
        let message: String = text.chars().take(ERROR_BODY_LIMIT).collect();

        tracing::warn!(status = status.as_u16(), body = %message, "Inference request failed");

        Err(match InferenceError::from_status(status.as_u16(), message) {
            InferenceError::RateLimited { .. } => InferenceError::RateLimited { retry_after },
            other => other,
        })
    }
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let response = self.send(request, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;
        parse_completion(&body)
    }

    async fn generate_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<FragmentStream, InferenceError> {
        let response = self.send(request, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let state = SseState {
            bytes,
            pending: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        };

        let fragments = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.ready.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend_from_slice(&chunk);
                        state.drain_lines();
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        state.ready.push_back(Err(InferenceError::Stream(e.to_string())));
                    }
                    None => {
                        state.pending.push(b'\n');
                        state.drain_lines();
                        state.done = true;
                    }
                }
            }
        });

        Ok(fragments.boxed())
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Seconds form of `Retry-After`
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Text of a non-streaming completion
pub fn parse_completion(body: &Value) -> Result<String, InferenceError> {
    if let Some(message) = body["error"]["message"].as_str() {
        return Err(InferenceError::Server {
            status: 200,
            message: message.to_string(),
        });
    }
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| InferenceError::MalformedResponse("completion has no content".into()))
}

/// One SSE line
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Fragment(String),
    Done,
    Error(String),
    /// Comments, keep-alives, role-only deltas
    Ignore,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return SseLine::Ignore;
    };
    if let Some(message) = event["error"]["message"].as_str() {
        return SseLine::Error(message.to_string());
    }
    match event["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Fragment(text.to_string()),
        _ => SseLine::Ignore,
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    /// Bytes after the last newline; may end mid UTF-8 sequence
    pending: Vec<u8>,
    ready: VecDeque<Result<String, InferenceError>>,
    done: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Fragment(text) => self.ready.push_back(Ok(text)),
                SseLine::Done => {
                    self.done = true;
                    self.pending.clear();
                    return;
                }
                SseLine::Error(message) => {
                    self.done = true;
                    self.pending.clear();
                    self.ready.push_back(Err(InferenceError::Stream(message)));
                    return;
                }
                SseLine::Ignore => {}
            }
        }
    }
}
