//! Retry policy and attempt state machine
//!
//! ```text
//! Attempting ──ok──────────────────────────▶ Succeeded
//!     │
//!     ├─retryable, budget left──▶ Backoff ──▶ Attempting
//!     ├─retryable, budget spent─▶ Degraded
//!     └─non-retryable───────────▶ Failed
//! ```
//!
//! Backoff is exponential from `backoff_base`, capped at `backoff_max`,
//! with ±25% jitter. A server `Retry-After` raises the delay but never
//! above 60s.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use super::inference::InferenceError;
use crate::config::OrchestratorConfig;

const JITTER: f64 = 0.25;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Jittered delay before retry number `retry`, honouring `Retry-After`
    pub fn delay_for(&self, retry: u32, error: &InferenceError) -> Duration {
        self.delay_with(retry, error, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(
        &self,
        retry: u32,
        error: &InferenceError,
        rng: &mut R,
    ) -> Duration {
        let base = self.base_delay(retry);
        let factor = 1.0 + rng.gen_range(-JITTER..=JITTER);
        let jittered = base.mul_f64(factor).min(self.backoff_max);
        match error.retry_after() {
            Some(server) => jittered.max(server.min(MAX_RETRY_AFTER)),
            None => jittered,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Current state of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// Attempt number `attempt` (0-based) is running
    Attempting { attempt: u32 },
    /// Waiting `delay` before the next attempt
    Backoff {
        attempt: u32,
        delay: Duration,
        error: InferenceError,
    },
    Succeeded { attempt: u32 },
    /// Non-retryable failure
    Failed(InferenceError),
    /// Retryable failures used up the retry budget
    Degraded { last_error: InferenceError },
}

/// Drives [`RetryState`] transitions for one operation
#[derive(Debug)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
    retries: u32,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 0 },
            retries: 0,
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Retries performed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn current_attempt(&self) -> u32 {
        match &self.state {
            RetryState::Attempting { attempt } | RetryState::Backoff { attempt, .. } => *attempt,
            RetryState::Succeeded { attempt } => *attempt,
            _ => self.retries,
        }
    }

    pub fn succeed(&mut self) {
        self.state = RetryState::Succeeded {
            attempt: self.current_attempt(),
        };
    }

    pub fn fail(&mut self, error: InferenceError) {
        let attempt = self.current_attempt();
        self.state = if !error.is_retryable() {
            RetryState::Failed(error)
        } else if self.retries < self.policy.max_retries {
            self.retries += 1;
            let delay = self.policy.delay_for(self.retries, &error);
            RetryState::Backoff {
                attempt,
                delay,
                error,
            }
        } else {
            RetryState::Degraded { last_error: error }
        };
    }

    /// Leave `Backoff` for the next attempt
    pub fn resume(&mut self) {
        if let RetryState::Backoff { attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Terminal outcome of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, retries: u32 },
    Failed { error: InferenceError, retries: u32 },
    Exhausted { last_error: InferenceError, retries: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { retries, .. }
            | RetryOutcome::Failed { retries, .. }
            | RetryOutcome::Exhausted { retries, .. } => *retries,
        }
    }
}

/// Run `op` until it succeeds, fails non-retryably, or the budget runs out.
///
/// `op` receives the 0-based attempt number. `on_retry` is called before
/// each backoff sleep with the retry number, the error and the delay.
pub async fn run_with_retry<T, F, Fut, R>(
    policy: RetryPolicy,
    mut op: F,
    mut on_retry: R,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
    R: FnMut(u32, &InferenceError, Duration),
{
    let mut machine = RetryMachine::new(policy);
    loop {
        match machine.state().clone() {
            RetryState::Attempting { attempt } => match op(attempt).await {
                Ok(value) => {
                    machine.succeed();
                    return RetryOutcome::Succeeded {
                        value,
                        retries: machine.retries(),
                    };
                }
                Err(error) => machine.fail(error),
            },
            RetryState::Backoff { delay, error, .. } => {
                on_retry(machine.retries(), &error, delay);
                tokio::time::sleep(delay).await;
                machine.resume();
            }
            RetryState::Failed(error) => {
                return RetryOutcome::Failed {
                    error,
                    retries: machine.retries(),
                };
            }
            RetryState::Degraded { last_error } => {
                return RetryOutcome::Exhausted {
                    last_error,
                    retries: machine.retries(),
                };
            }
            RetryState::Succeeded { .. } => unreachable!("success returns from the attempt arm"),
        }
    }
}
