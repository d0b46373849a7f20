//! Concurrency Controller
//!
//! Bounds the number of expensive computations running at once and
//! collapses identical concurrent requests onto one computation.
//!
//! - **Dedup**: a submission for a key that is already pending attaches as a
//!   follower. The work for a key runs at most once while it is pending and
//!   every waiter receives the same result or error.
//! - **Admission**: at most `max_in_flight` computations run; further ones
//!   queue FIFO up to `max_queue`; beyond that submission fails immediately
//!   with [`CapacityExceeded`].
//! - **Detachment**: computations run in their own task. Dropping a
//!   [`Submission`] never cancels the shared computation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, oneshot, watch};

use crate::config::ConcurrencyConfig;
use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};

// ============================================================================
// OUTCOMES
// ============================================================================

/// The controller is saturated; try again later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityExceeded {
    /// Guidance for the user
    pub message: String,
    /// Suggested wait before retrying
    pub retry_after_secs: u64,
    /// Computations running when the request was rejected
    pub in_flight: usize,
    /// Computations queued when the request was rejected
    pub queued: usize,
}

impl CapacityExceeded {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

/// Why a submission was not accepted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Capacity exceeded: {} in flight, {} queued", .0.in_flight, .0.queued)]
    CapacityExceeded(CapacityExceeded),
    #[error("Controller is shutting down")]
    ShuttingDown,
}

/// Whether a submission started a computation or joined one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionRole {
    Leader,
    Follower,
}

/// Snapshot of controller state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStats {
    pub in_flight: usize,
    pub queued: usize,
    pub pending_keys: usize,
    pub computations_started: u64,
    pub followers_attached: u64,
    pub rejected: u64,
}

// ============================================================================
// CONTROLLER
// ============================================================================

type Slot<T> = Option<EngineResult<T>>;

struct State<T> {
    pending: HashMap<Digest, watch::Receiver<Slot<T>>>,
    /// Waiting computations by ticket, oldest first
    queue: VecDeque<(u64, oneshot::Sender<()>)>,
    next_ticket: u64,
    in_flight: usize,
    closed: bool,
}

struct Inner<T> {
    config: ConcurrencyConfig,
    state: Mutex<State<T>>,
    idle: Notify,
    computations_started: AtomicU64,
    followers_attached: AtomicU64,
    rejected: AtomicU64,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Admission control and request dedup for expensive computations
pub struct ConcurrencyController<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ConcurrencyController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ConcurrencyController<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    queue: VecDeque::new(),
                    next_ticket: 0,
                    in_flight: 0,
                    closed: false,
                }),
                idle: Notify::new(),
                computations_started: AtomicU64::new(0),
                followers_attached: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Submit `work` under `key`
    ///
    /// Returns immediately. If `key` is pending the submission follows the
    /// existing computation and `work` is dropped unpolled.
    pub fn submit<F>(&self, key: Digest, work: F) -> Result<Submission<T>, SubmitError>
    where
        F: Future<Output = EngineResult<T>> + Send + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.lock();

        if state.closed {
            return Err(SubmitError::ShuttingDown);
        }

        if let Some(rx) = state.pending.get(&key) {
            inner.followers_attached.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key.short(), "Attached follower to pending computation");
            return Ok(Submission {
                rx: rx.clone(),
                role: SubmissionRole::Follower,
            });
        }

        let gate = if state.in_flight < inner.config.max_in_flight {
            state.in_flight += 1;
            None
        } else if state.queue.len() < inner.config.max_queue {
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back((ticket, tx));
            Some((ticket, rx))
        } else {
            inner.rejected.fetch_add(1, Ordering::Relaxed);
            let rejection = CapacityExceeded {
                message: "Insight analysis is busy right now. Please try again shortly."
                    .to_string(),
                retry_after_secs: inner.config.retry_after_secs,
                in_flight: state.in_flight,
                queued: state.queue.len(),
            };
            tracing::warn!(
                in_flight = rejection.in_flight,
                queued = rejection.queued,
                "Rejecting submission: capacity exceeded"
            );
            return Err(SubmitError::CapacityExceeded(rejection));
        };

        let (tx, rx) = watch::channel(None);
        state.pending.insert(key.clone(), rx.clone());
        let queued = gate.is_some();
        drop(state);

        if queued {
            tracing::debug!(key = %key.short(), "Computation queued");
        }

        let mut completion = Completion {
            inner: Arc::clone(inner),
            key,
            tx,
            admitted: !queued,
            ticket: gate.as_ref().map_or(0, |(ticket, _)| *ticket),
        };
        tokio::spawn(async move {
            if let Some((_, gate)) = gate {
                // Err: the queue entry went away without a slot
                if gate.await.is_err() {
                    return;
                }
                completion.admitted = true;
            }
            completion
                .inner
                .computations_started
                .fetch_add(1, Ordering::Relaxed);
            let result = work.await;
            completion.tx.send_replace(Some(result));
            // Dropping `completion` releases the slot and the pending key
        });

        Ok(Submission {
            rx,
            role: SubmissionRole::Leader,
        })
    }

    /// Stop accepting submissions. Running and queued work still completes.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait until no computation is running, queued or pending
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.lock();
                if state.in_flight == 0 && state.queue.is_empty() && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> ControllerStats {
        let state = self.inner.lock();
        ControllerStats {
            in_flight: state.in_flight,
            queued: state.queue.len(),
            pending_keys: state.pending.len(),
            computations_started: self.inner.computations_started.load(Ordering::Relaxed),
            followers_attached: self.inner.followers_attached.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Releases a computation's pending key when its task ends, including by
/// panic or by the task being dropped. Only an admitted computation owns a
/// slot to release; a queued one gives up its queue position.
struct Completion<T> {
    inner: Arc<Inner<T>>,
    key: Digest,
    tx: watch::Sender<Slot<T>>,
    admitted: bool,
    ticket: u64,
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.pending.remove(&self.key);

        if self.admitted {
            // Hand the slot to the oldest queued computation that is still alive
            let mut handed_over = false;
            while let Some((_, next)) = state.queue.pop_front() {
                if next.send(()).is_ok() {
                    handed_over = true;
                    break;
                }
            }
            if !handed_over {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
        } else {
            let ticket = self.ticket;
            state.queue.retain(|(queued, _)| *queued != ticket);
        }

        if state.in_flight == 0 && state.queue.is_empty() && state.pending.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

// ============================================================================
// SUBMISSION
// ============================================================================

/// Handle to a (possibly shared) computation
pub struct Submission<T> {
    rx: watch::Receiver<Slot<T>>,
    role: SubmissionRole,
}

impl<T: Clone> Submission<T> {
    pub fn role(&self) -> SubmissionRole {
        self.role
    }

    /// Wait for the shared result
    pub async fn wait(mut self) -> EngineResult<T> {
        // Err means the sender was dropped before a result was sent (panic)
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(EngineError::Internal(
                "computation ended without a result".into(),
            ))
        })
    }
}
