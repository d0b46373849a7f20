//! Scripted Inference Service
//!
//! Replays a fixed script of replies and failures. Once the script runs
//! out the last reply repeats, so tests only script what they care about.
//! Calls can be held at a gate to keep computations in flight.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reverie_core::orchestrator::FragmentStream;
use reverie_core::{InferenceError, InferenceRequest, InferenceService};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// One scripted response
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this text
    Reply(String),
    /// Fail the attempt
    Fail(InferenceError),
    /// Never answer; the attempt timeout must fire
    Hang,
}

/// Inference double driven by a script
pub struct ScriptedInference {
    steps: Mutex<VecDeque<Step>>,
    last_reply: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    call_started: Notify,
    gate: Option<Semaphore>,
    fragment_len: Option<usize>,
    model: String,
}

impl ScriptedInference {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            last_reply: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            call_started: Notify::new(),
            gate: None,
            fragment_len: None,
            model: "scripted-model".to_string(),
        }
    }

    /// Always reply with the same text
    pub fn replying(text: impl Into<String>) -> Self {
        Self::new([Step::Reply(text.into())])
    }

    /// Hold every call until [`release`](Self::release) lets it through
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Stream replies in fragments of `len` characters
    pub fn streaming(mut self, len: usize) -> Self {
        self.fragment_len = Some(len.max(1));
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Let `n` gated calls proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Wait until at least `n` calls have started
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            self.call_started.notified().await;
        }
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    async fn next_step(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| InferenceError::Transport("gate closed".into()))?
                .forget();
        }

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(text)) => {
                *self.last_reply.lock().unwrap() = Some(text.clone());
                Ok(text)
            }
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(InferenceError::Transport("hung call woke up".into()))
            }
            None => self
                .last_reply
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| InferenceError::Transport("script exhausted".into())),
        }
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.next_step(request).await
    }

    async fn generate_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<FragmentStream, InferenceError> {
        let text = self.next_step(request).await?;
        let len = self.fragment_len.unwrap_or(usize::MAX);
        let chars: Vec<char> = text.chars().collect();
        let fragments: Vec<Result<String, InferenceError>> = chars
            .chunks(len)
            .map(|chunk| Ok(chunk.iter().collect()))
            .collect();
        Ok(stream::iter(fragments).boxed())
    }

    fn supports_streaming(&self) -> bool {
        self.fragment_len.is_some()
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}
