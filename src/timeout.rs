//! Per-attempt timeout enforcement.

use crate::error::DependencyError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Callers validate `duration > 0` (descriptor validation does).
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run one attempt. When the limit elapses the attempt's future is dropped, which cancels
    /// the in-flight call, and `DependencyError::Timeout` is reported.
    pub async fn execute<T, Fut>(&self, attempt: Fut) -> Result<T, DependencyError>
    where
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        match tokio::time::timeout(self.duration, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DependencyError::Timeout { limit: self.duration }),
        }
    }
}
