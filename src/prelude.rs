//! Convenient re-exports for building an aggregator.
pub use crate::{
    aggregator::{Aggregator, CreateConsistency, Dependency, SideEffect},
    client::{create_fn, fetch_fn, CreateClient, FetchClient, Operation},
    descriptor::DependencyDescriptor,
    error::{AggregateError, ConfigError, DependencyError, DependencyUnavailable},
    outcome::{Assembler, CallOutcome, CompositeResult, JsonMerge},
    policy::{DependencyPolicy, PolicyLayer},
    store::{InMemoryStore, PrimaryStore},
    Backoff, Jitter,
};
