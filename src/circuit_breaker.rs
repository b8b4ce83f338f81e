//! Per-dependency circuit breaker.
//!
//! `Closed` lets calls through and counts consecutive failures; reaching the threshold opens the
//! circuit. `Open` short-circuits every call until the cooldown elapses, after which the next
//! caller moves the breaker to `HalfOpen`. `HalfOpen` admits at most `half_open_trials` trial calls per
//! trial window: that many consecutive successes close the circuit, any failure reopens it.
//!
//! The [`CircuitBreakerRecord`] spans several fields that must change together, so it lives under
//! one mutex scoped to the single breaker; no await point is ever held inside it.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, Problem};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open-state duration elapses.
    Open,
    /// Probe mode allowing a bounded number of trial calls.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Validated breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    open_duration: Duration,
    half_open_trials: u32,
}

impl CircuitBreakerConfig {
    /// Errors if any threshold is zero.
    pub fn new(
        failure_threshold: u32,
        open_duration: Duration,
        half_open_trials: u32,
    ) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        if failure_threshold == 0 {
            problems.push(Problem::new("circuit_breaker", "failure_threshold must be > 0"));
        }
        if open_duration.is_zero() {
            problems.push(Problem::new("circuit_breaker", "open_state_duration must be > 0"));
        }
        if half_open_trials == 0 {
            problems.push(Problem::new("circuit_breaker", "half_open_trial_count must be > 0"));
        }
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(Self { failure_threshold, open_duration, half_open_trials })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Duration to stay Open before trial calls.
    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }

    /// Trial calls per half-open window, and successes needed to close.
    pub fn half_open_trials(&self) -> u32 {
        self.half_open_trials
    }
}

/// Health record of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Clock reading (ms) of the last transition to Open.
    pub opened_at: Option<u64>,
    pub half_open_successes: u32,
}

#[derive(Debug)]
struct Inner {
    record: CircuitBreakerRecord,
    trials_admitted: u32,
    /// Bumped on every entry into HalfOpen and on reset; trial permits from an older window no
    /// longer count.
    window: u64,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Circuit breaker guarding one dependency.
/// Clones share the same record, so every handle observes and affects the same lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial { window: u64 },
}

/// Admission to make one attempt. Report the attempt with [`CallPermit::succeed`] or
/// [`CallPermit::fail`]; a permit dropped unreported (a cancelled call) frees its trial slot.
#[derive(Debug)]
#[must_use = "report the attempt outcome through the permit"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl CallPermit {
    /// Whether this attempt is a half-open trial.
    pub fn is_trial(&self) -> bool {
        matches!(self.kind, PermitKind::Trial { .. })
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.kind);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.kind);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            if let PermitKind::Trial { window } = self.kind {
                self.breaker.release_trial(window);
            }
        }
    }
}

impl CircuitBreaker {
    /// Breaker named after its dependency, timed by the tokio clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    /// Breaker with an explicit clock (useful for deterministic tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Inner {
            record: CircuitBreakerRecord {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_successes: 0,
            },
            trials_admitted: 0,
            window: 0,
        };
        Self {
            shared: Arc::new(Shared { name: name.into(), config, clock, inner: Mutex::new(inner) }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Stored state; an expired Open only turns HalfOpen when the next caller arrives.
    pub fn state(&self) -> CircuitState {
        self.lock().record.state
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> CircuitBreakerRecord {
        self.lock().record
    }

    /// Gate one attempt. Returns the refusing state when the call must short-circuit.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitState> {
        let mut inner = self.lock();

        if inner.record.state == CircuitState::Open {
            let opened_at = inner.record.opened_at.unwrap_or(0);
            let elapsed = self.now_millis().saturating_sub(opened_at);
            if u128::from(elapsed) < self.shared.config.open_duration.as_millis() {
                return Err(CircuitState::Open);
            }
            inner.record.state = CircuitState::HalfOpen;
            inner.record.half_open_successes = 0;
            inner.trials_admitted = 0;
            inner.window += 1;
            tracing::info!(dependency = %self.shared.name, "circuit breaker → half-open");
        }

        let state = inner.record.state;
        let kind = match state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::HalfOpen => {
                if inner.trials_admitted >= self.shared.config.half_open_trials {
                    return Err(CircuitState::HalfOpen);
                }
                inner.trials_admitted += 1;
                tracing::debug!(
                    dependency = %self.shared.name,
                    admitted = inner.trials_admitted,
                    max = self.shared.config.half_open_trials,
                    "circuit breaker: half-open trial"
                );
                PermitKind::Trial { window: inner.window }
            }
            CircuitState::Open => return Err(CircuitState::Open),
        };
        drop(inner);

        Ok(CallPermit { breaker: self.clone(), kind, settled: false })
    }

    /// Count a call that was rejected before it could be attempted (bulkhead full) as a failure.
    pub fn record_rejection(&self) {
        let mut inner = self.lock();
        let state = inner.record.state;
        match state {
            CircuitState::Closed => self.count_closed_failure(&mut inner),
            CircuitState::HalfOpen => self.reopen(&mut inner),
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to Closed, clearing counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.record = CircuitBreakerRecord {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
        };
        inner.trials_admitted = 0;
        inner.window += 1;
        tracing::info!(dependency = %self.shared.name, "circuit breaker reset → closed");
    }

    /// Any success in Closed resets the failure streak, so only consecutive failures trip the
    /// breaker.
    fn on_success(&self, kind: PermitKind) {
        let mut inner = self.lock();
        match (inner.record.state, kind) {
            (CircuitState::Closed, PermitKind::Normal) => {
                inner.record.consecutive_failures = 0;
            }
            (CircuitState::HalfOpen, PermitKind::Trial { window }) if window == inner.window => {
                inner.record.half_open_successes += 1;
                if inner.record.half_open_successes >= self.shared.config.half_open_trials {
                    inner.record = CircuitBreakerRecord {
                        state: CircuitState::Closed,
                        consecutive_failures: 0,
                        opened_at: None,
                        half_open_successes: 0,
                    };
                    inner.trials_admitted = 0;
                    tracing::info!(dependency = %self.shared.name, "circuit breaker → closed");
                }
            }
            // Outcome of an attempt admitted in an earlier phase.
            _ => {}
        }
    }

    fn on_failure(&self, kind: PermitKind) {
        let mut inner = self.lock();
        match (inner.record.state, kind) {
            (CircuitState::Closed, PermitKind::Normal) => self.count_closed_failure(&mut inner),
            (CircuitState::HalfOpen, PermitKind::Trial { window }) if window == inner.window => {
                self.reopen(&mut inner);
            }
            _ => {}
        }
    }

    fn release_trial(&self, window: u64) {
        let mut inner = self.lock();
        if inner.record.state == CircuitState::HalfOpen && inner.window == window {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
        }
    }

    fn count_closed_failure(&self, inner: &mut Inner) {
        inner.record.consecutive_failures = inner.record.consecutive_failures.saturating_add(1);
        let failures = inner.record.consecutive_failures;
        if failures >= self.shared.config.failure_threshold {
            inner.record.state = CircuitState::Open;
            inner.record.opened_at = Some(self.now_millis());
            tracing::error!(
                dependency = %self.shared.name,
                failures,
                threshold = self.shared.config.failure_threshold,
                "circuit breaker → open"
            );
        }
    }

    fn reopen(&self, inner: &mut Inner) {
        inner.record.state = CircuitState::Open;
        inner.record.opened_at = Some(self.now_millis());
        inner.record.half_open_successes = 0;
        inner.trials_admitted = 0;
        tracing::warn!(dependency = %self.shared.name, "circuit breaker: trial failed → open");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the record consistent, so a poisoned lock is still usable.
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_millis(&self) -> u64 {
        self.shared.clock.now_millis()
    }
}
