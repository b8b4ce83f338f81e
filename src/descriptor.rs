//! Per-dependency resilience settings.
//!
//! A [`DependencyDescriptor`] is created once at startup and never changes. Building one
//! validates every field and reports all problems together:
//!
//! ```rust
//! use std::time::Duration;
//! use ninelives_gather::DependencyDescriptor;
//!
//! let details = DependencyDescriptor::builder("details")
//!     .max_retries(2)
//!     .backoff_base(Duration::from_millis(50))
//!     .request_timeout(Duration::from_millis(250))
//!     .bulkhead_capacity(8)
//!     .failure_threshold(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(details.name(), "details");
//!
//! let err = DependencyDescriptor::builder("comments")
//!     .bulkhead_capacity(0)
//!     .failure_threshold(0)
//!     .build()
//!     .unwrap_err();
//! assert_eq!(err.problems().len(), 2);
//! ```

use crate::bulkhead::MAX_CAPACITY;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, Problem};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use crate::{Backoff, Jitter};
use std::time::Duration;

/// Immutable resilience settings for one dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDescriptor {
    name: String,
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    request_timeout: Duration,
    bulkhead_capacity: usize,
    bulkhead_wait: Duration,
    breaker: CircuitBreakerConfig,
}

impl DependencyDescriptor {
    pub fn builder(name: impl Into<String>) -> DependencyDescriptorBuilder {
        DependencyDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn bulkhead_capacity(&self) -> usize {
        self.bulkhead_capacity
    }

    /// How long a call may wait for a bulkhead slot; zero fails immediately.
    pub fn bulkhead_wait(&self) -> Duration {
        self.bulkhead_wait
    }

    pub fn breaker_config(&self) -> &CircuitBreakerConfig {
        &self.breaker
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .backoff(self.backoff.clone())
            .with_jitter(self.jitter)
            .build()
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(self.request_timeout)
    }
}

/// Builder for [`DependencyDescriptor`].
#[derive(Debug, Clone)]
pub struct DependencyDescriptorBuilder {
    name: String,
    max_retries: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    backoff_max: Option<Duration>,
    jitter: Jitter,
    request_timeout: Duration,
    bulkhead_capacity: usize,
    bulkhead_wait: Duration,
    failure_threshold: u32,
    open_state_duration: Duration,
    half_open_trial_count: u32,
}

impl DependencyDescriptorBuilder {
    /// Defaults: 2 retries, 100ms doubling backoff, 1s timeout, 10 slots, threshold 5, 30s open,
    /// 1 trial.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            backoff_max: None,
            jitter: Jitter::None,
            request_timeout: Duration::from_secs(1),
            bulkhead_capacity: 10,
            bulkhead_wait: Duration::ZERO,
            failure_threshold: 5,
            open_state_duration: Duration::from_secs(30),
            half_open_trial_count: 1,
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = Some(max);
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn bulkhead_capacity(mut self, capacity: usize) -> Self {
        self.bulkhead_capacity = capacity;
        self
    }

    pub fn bulkhead_wait(mut self, wait: Duration) -> Self {
        self.bulkhead_wait = wait;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn open_state_duration(mut self, duration: Duration) -> Self {
        self.open_state_duration = duration;
        self
    }

    pub fn half_open_trial_count(mut self, count: u32) -> Self {
        self.half_open_trial_count = count;
        self
    }

    /// Validate every field; all problems are reported together.
    pub fn build(self) -> Result<DependencyDescriptor, ConfigError> {
        let subject = if self.name.trim().is_empty() { "<unnamed>" } else { self.name.as_str() };
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push(Problem::new(subject, "name must not be empty"));
        }
        if self.backoff_base.is_zero() {
            problems.push(Problem::new(subject, "backoff_base must be > 0"));
        }
        if self.request_timeout.is_zero() {
            problems.push(Problem::new(subject, "request_timeout must be > 0"));
        }
        if self.bulkhead_capacity == 0 {
            problems.push(Problem::new(subject, "bulkhead_capacity must be > 0"));
        }
        if self.bulkhead_capacity > MAX_CAPACITY {
            problems.push(Problem::new(
                subject,
                format!("bulkhead_capacity must be <= {MAX_CAPACITY}"),
            ));
        }

        let mut backoff = Backoff::exponential(self.backoff_base);
        match backoff.clone().with_multiplier(self.backoff_multiplier) {
            Ok(b) => backoff = b,
            Err(e) => problems.push(Problem::new(subject, format!("backoff_multiplier: {e}"))),
        }
        if let Some(max) = self.backoff_max {
            match backoff.clone().with_max(max) {
                Ok(b) => backoff = b,
                Err(e) => problems.push(Problem::new(subject, format!("backoff_max: {e}"))),
            }
        }

        let breaker = match CircuitBreakerConfig::new(
            self.failure_threshold,
            self.open_state_duration,
            self.half_open_trial_count,
        ) {
            Ok(config) => Some(config),
            Err(e) => {
                problems.extend(e.problems().iter().map(|p| Problem::new(subject, &p.reason)));
                None
            }
        };

        match breaker {
            Some(breaker) if problems.is_empty() => Ok(DependencyDescriptor {
                name: self.name,
                max_retries: self.max_retries,
                backoff,
                jitter: self.jitter,
                request_timeout: self.request_timeout,
                bulkhead_capacity: self.bulkhead_capacity,
                bulkhead_wait: self.bulkhead_wait,
                breaker,
            }),
            _ => Err(ConfigError::Invalid(problems)),
        }
    }
}
