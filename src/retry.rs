//! Retry with exponential backoff.
//!
//! Semantics:
//! - `max_retries` counts retries after the first attempt; at most `max_retries + 1` attempts.
//! - Only `AttemptError::Dependency` failures are eligible for retry, and only when the
//!   `should_retry` predicate accepts them (default: [`DependencyError::is_transient`], so
//!   connect errors and timeouts retry while remote and decode errors do not).
//! - A breaker refusal (`AttemptError::CircuitOpen`) ends the sequence at once.
//! - The wait before retry `n` is `backoff.delay(n)` with jitter applied. The wait is a plain
//!   tokio sleep, so dropping the future cancels it.

use crate::circuit_breaker::CircuitState;
use crate::error::{DependencyError, DependencyUnavailable};
use crate::{Backoff, Jitter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Why a single attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The dependency was called and failed.
    Dependency(DependencyError),
    /// The breaker refused the attempt; nothing was sent.
    CircuitOpen(CircuitState),
}

/// Result of a retry sequence plus the number of attempts that reached the dependency.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, DependencyUnavailable>,
    pub attempts: u32,
}

/// Retry policy combining backoff, jitter and a retry predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&DependencyError) -> bool + Send + Sync>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<T, Fut, Op>(&self, mut attempt: Op) -> Attempted<T>
    where
        Fut: Future<Output = Result<T, AttemptError>>,
        Op: FnMut() -> Fut,
    {
        let mut attempts: u32 = 0;
        let mut retry: u32 = 0;

        loop {
            match attempt().await {
                Ok(value) => return Attempted { result: Ok(value), attempts: attempts + 1 },
                Err(AttemptError::CircuitOpen(state)) => {
                    return Attempted {
                        result: Err(DependencyUnavailable::CircuitOpen { state, attempts }),
                        attempts,
                    };
                }
                Err(AttemptError::Dependency(error)) => {
                    attempts += 1;
                    if !(self.should_retry)(&error) {
                        return Attempted {
                            result: Err(DependencyUnavailable::Rejected { attempts, error }),
                            attempts,
                        };
                    }
                    if retry >= self.max_retries {
                        return Attempted {
                            result: Err(DependencyUnavailable::Exhausted { attempts, last: error }),
                            attempts,
                        };
                    }

                    let delay = self.jitter.apply(self.backoff.delay(retry));
                    tracing::debug!(attempt = attempts, ?delay, %error, "retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&DependencyError) -> bool + Send + Sync>,
}

impl RetryPolicyBuilder {
    /// Create a builder with sane defaults: 2 retries, 100ms doubling backoff, no jitter.
    pub fn new() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::None,
            should_retry: Arc::new(DependencyError::is_transient),
        }
    }

    /// Retries after the first attempt.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate to decide if a client error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DependencyError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
