//! Error taxonomy.
//!
//! Only [`AggregateError`] and [`ConfigError`] ever reach a caller as hard failures. Everything a
//! single dependency can go through ([`DependencyError`], [`DependencyUnavailable`]) is absorbed
//! into a [`CallOutcome`](crate::CallOutcome) together with the fallback value.
use crate::circuit_breaker::CircuitState;
use crate::client::Operation;
use std::fmt;
use std::time::Duration;

/// Failure of one call made by a dependency client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// The dependency could not be reached (resolution, connect, reset).
    #[error("could not reach dependency: {0}")]
    Connect(String),
    /// No response within the caller-supplied limit. Carries the limit only, so repeated
    /// timeouts compare equal.
    #[error("no response within {limit:?}")]
    Timeout { limit: Duration },
    /// The dependency answered with a failure status.
    #[error("dependency answered with status {status}: {message}")]
    Remote { status: u16, message: String },
    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl DependencyError {
    /// Transient failures are worth another attempt; remote and decode failures are not, they
    /// would fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout { .. })
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short machine-readable label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout { .. } => "timeout",
            Self::Remote { .. } => "remote",
            Self::Decode(_) => "decode",
        }
    }
}

/// Why a dependency was substituted by its fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyUnavailable {
    /// Every permitted attempt failed with a transient error.
    #[error("retry exhausted after {attempts} attempts; last error: {last}")]
    Exhausted { attempts: u32, last: DependencyError },
    /// A non-retryable failure ended the call.
    #[error("non-retryable failure after {attempts} attempts: {error}")]
    Rejected { attempts: u32, error: DependencyError },
    /// No bulkhead slot became free within the acquisition wait.
    #[error("bulkhead rejected request ({in_flight} in-flight, max {max})")]
    BulkheadFull { in_flight: usize, max: usize },
    /// The circuit breaker refused the attempt.
    #[error("circuit breaker {state} after {attempts} attempts")]
    CircuitOpen { state: CircuitState, attempts: u32 },
    /// The aggregation deadline expired before the call completed.
    #[error("aggregation deadline of {deadline:?} expired")]
    DeadlineExceeded { deadline: Duration },
}

impl DependencyUnavailable {
    /// Check if this is a bulkhead rejection.
    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    /// Check if the breaker short-circuited the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if the aggregation deadline cut the call short.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// The last client error seen, if the call reached the dependency at all.
    pub fn last_error(&self) -> Option<&DependencyError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Hard failures of an aggregator operation.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// The primary entity does not exist; there is nothing to aggregate.
    #[error("primary entity {key} not found")]
    PrimaryNotFound { key: u64 },
    /// The operation named a dependency that was never registered.
    #[error("dependency '{name}' is not registered")]
    UnknownDependency { name: String },
    /// The dependency's client does not offer the requested operation.
    #[error("dependency '{dependency}' does not support {operation}")]
    OperationUnsupported { dependency: String, operation: Operation },
    /// The primary store itself failed.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl AggregateError {
    /// Check if this is a not-found result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PrimaryNotFound { .. })
    }
}

/// One problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// Dependency (or config section) the problem belongs to.
    pub subject: String,
    pub reason: String,
}

impl Problem {
    pub(crate) fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { subject: subject.into(), reason: reason.into() }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}

/// Startup failures. The process must not run with any of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more descriptors or config sections are malformed.
    #[error("invalid configuration: {}", join_problems(.0))]
    Invalid(Vec<Problem>),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// All validation problems, empty for I/O and parse failures.
    pub fn problems(&self) -> &[Problem] {
        match self {
            Self::Invalid(problems) => problems,
            _ => &[],
        }
    }
}

fn join_problems(problems: &[Problem]) -> String {
    problems.iter().map(Problem::to_string).collect::<Vec<_>>().join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connect_and_timeout_are_transient() {
        assert!(DependencyError::Connect("refused".into()).is_transient());
        assert!(DependencyError::Timeout { limit: Duration::from_millis(100) }.is_transient());
        assert!(!DependencyError::Remote { status: 500, message: "boom".into() }.is_transient());
        assert!(!DependencyError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn exhausted_display_includes_last_error() {
        let err = DependencyUnavailable::Exhausted {
            attempts: 3,
            last: DependencyError::Connect("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.last_error().map(DependencyError::kind), Some("connect"));
    }

    #[test]
    fn unavailable_predicates() {
        let bulkhead = DependencyUnavailable::BulkheadFull { in_flight: 2, max: 2 };
        assert!(bulkhead.is_bulkhead());
        assert!(bulkhead.last_error().is_none());

        let open = DependencyUnavailable::CircuitOpen { state: CircuitState::Open, attempts: 0 };
        assert!(open.is_circuit_open());
        assert!(open.to_string().contains("open"));

        let late = DependencyUnavailable::DeadlineExceeded { deadline: Duration::from_secs(1) };
        assert!(late.is_deadline());
    }

    #[test]
    fn config_error_lists_every_problem() {
        let err = ConfigError::Invalid(vec![
            Problem::new("details", "bulkhead_capacity must be > 0"),
            Problem::new("comments", "failure_threshold must be > 0"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("details: bulkhead_capacity"));
        assert!(msg.contains("comments: failure_threshold"));
        assert_eq!(err.problems().len(), 2);
    }
}
