#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Nine Lives: Gather 🐱
//!
//! Resilient fan-out aggregation: resolve a primary entity, query every dependency it needs
//! concurrently, and assemble whatever comes back, substituting a fallback for each dependency
//! that fails.
//!
//! ## Features
//!
//! - **Per-dependency policies**: timeout, retry with exponential backoff and jitter, circuit
//!   breaker with half-open trials, and a concurrency bulkhead
//! - **Never-failing guarded calls**: unavailability becomes a fallback value plus a reason
//! - **Deadline-bounded aggregation**: outstanding calls are cancelled and fall back
//! - **Best-effort or retry-later side effects** for create operations
//! - **Tower integration** via [`PolicyLayer`]
//! - **HTTP clients and an axum surface** behind the `http` and `server` features
//!
//! ## Quick Start
//!
//! ```rust
//! use ninelives_gather::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let comments = DependencyDescriptor::builder("comments")
//!         .max_retries(2)
//!         .request_timeout(Duration::from_millis(200))
//!         .failure_threshold(3)
//!         .build()
//!         .unwrap();
//!
//!     let aggregator = Aggregator::builder(Arc::new(InMemoryStore::<String>::new()))
//!         .dependency(
//!             Dependency::new(comments, Vec::<String>::new())
//!                 .with_fetch(fetch_fn(|_key: u64| async {
//!                     Err(DependencyError::Connect("connection refused".into()))
//!                 })),
//!         )
//!         .build()
//!         .unwrap();
//!
//!     let created = aggregator.create(|_| "first post".to_string(), None).await.unwrap();
//!     let composite = aggregator.aggregate_all(created.key).await.unwrap();
//!
//!     let comments = composite.part("comments").unwrap();
//!     assert!(comments.used_fallback);
//!     assert!(comments.value.is_empty());
//!     assert_eq!(comments.attempts, 3);
//! }
//! ```

pub mod aggregator;
pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod error;
#[cfg(feature = "http")]
pub mod http_client;
pub mod jitter;
pub mod outcome;
pub mod policy;
pub mod prelude;
pub mod retry;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod timeout;

// Re-exports
pub use aggregator::{Aggregator, AggregatorBuilder, CreateConsistency, Dependency, SideEffect};
pub use backoff::Backoff;
pub use bulkhead::{Bulkhead, BulkheadSlot};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRecord, CircuitState,
};
pub use client::{create_fn, fetch_fn, CreateClient, FetchClient, Operation};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DependencyConfig, GatherConfig};
pub use descriptor::{DependencyDescriptor, DependencyDescriptorBuilder};
pub use discovery::{Resolver, StaticResolver};
pub use error::{AggregateError, ConfigError, DependencyError, DependencyUnavailable, Problem};
#[cfg(feature = "http")]
pub use http_client::HttpClient;
pub use jitter::Jitter;
pub use outcome::{Assembler, CallOutcome, CompositeResult, CreateOutcome, JsonMerge};
pub use policy::{DependencyPolicy, PolicyLayer, PolicyService};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use store::{InMemoryStore, PrimaryStore, StoreError};
pub use timeout::TimeoutPolicy;
