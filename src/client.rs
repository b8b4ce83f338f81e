//! Dependency clients: one network call each, no retry or breaker logic.
//!
//! Fetching and creating are separate capabilities. A dependency registers whichever clients it
//! offers; asking it for an operation it lacks is a caller error
//! ([`AggregateError::OperationUnsupported`](crate::AggregateError::OperationUnsupported)).

use crate::error::DependencyError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;

/// Operation a dependency client can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Fetch,
    Create,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Fetch => write!(f, "fetch"),
            Operation::Create => write!(f, "create"),
        }
    }
}

/// Reads the dependency's data for one primary key.
#[async_trait]
pub trait FetchClient<V>: Send + Sync {
    async fn fetch(&self, key: u64) -> Result<V, DependencyError>;
}

/// Performs the dependency's side of a create. Called once per attempt with the same payload.
#[async_trait]
pub trait CreateClient<V>: Send + Sync {
    async fn create(&self, payload: &V) -> Result<V, DependencyError>;
}

/// Client built from a closure. See [`fetch_fn`].
#[derive(Clone)]
pub struct FetchFn<F> {
    f: F,
}

impl<F> fmt::Debug for FetchFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchFn").finish_non_exhaustive()
    }
}

/// Wrap `Fn(key) -> Future<Result<V, DependencyError>>` as a [`FetchClient`].
pub fn fetch_fn<F>(f: F) -> FetchFn<F> {
    FetchFn { f }
}

#[async_trait]
impl<V, F, Fut> FetchClient<V> for FetchFn<F>
where
    V: Send + 'static,
    F: Fn(u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, DependencyError>> + Send,
{
    async fn fetch(&self, key: u64) -> Result<V, DependencyError> {
        (self.f)(key).await
    }
}

/// Client built from a closure. See [`create_fn`].
#[derive(Clone)]
pub struct CreateFn<F> {
    f: F,
}

impl<F> fmt::Debug for CreateFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateFn").finish_non_exhaustive()
    }
}

/// Wrap `Fn(payload) -> Future<Result<V, DependencyError>>` as a [`CreateClient`]. The closure
/// receives its own copy of the payload on every attempt.
pub fn create_fn<F>(f: F) -> CreateFn<F> {
    CreateFn { f }
}

#[async_trait]
impl<V, F, Fut> CreateClient<V> for CreateFn<F>
where
    V: Clone + Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, DependencyError>> + Send,
{
    async fn create(&self, payload: &V) -> Result<V, DependencyError> {
        (self.f)(payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fetch_fn_forwards_key() {
        let client = fetch_fn(|key: u64| async move { Ok(key * 10) });
        assert_eq!(client.fetch(4).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn clients_are_object_safe() {
        let fetch: Arc<dyn FetchClient<String>> =
            Arc::new(fetch_fn(|_| async { Err(DependencyError::Connect("refused".into())) }));
        let create: Arc<dyn CreateClient<String>> =
            Arc::new(create_fn(|payload: String| async move { Ok(payload.to_uppercase()) }));

        assert_eq!(fetch.fetch(1).await.unwrap_err().kind(), "connect");
        assert_eq!(create.create(&"hello".to_string()).await.unwrap(), "HELLO");
    }

    #[test]
    fn operation_display() {
        assert_eq!(Operation::Fetch.to_string(), "fetch");
        assert_eq!(Operation::Create.to_string(), "create");
    }
}
