//! Fan-out aggregation over a primary store and guarded dependencies.
//!
//! An [`Aggregator`] owns the primary store and one [`DependencyPolicy`] per registered
//! dependency. Aggregating a key resolves the primary entity, then issues every required
//! dependency call at once and waits for all of them, bounded by a deadline. Dependencies that
//! fail contribute their fallback value; only a missing primary entity fails the request.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! use ninelives_gather::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::<String>::new());
//! let details = DependencyDescriptor::builder("details").build().unwrap();
//! let aggregator = Aggregator::builder(store)
//!     .dependency(
//!         Dependency::new(details, String::from("n/a"))
//!             .with_fetch(fetch_fn(|key: u64| async move { Ok(format!("details of {key}")) })),
//!     )
//!     .deadline(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//!
//! let (key, _) = aggregator.create(|_| "hello".to_string(), None).await.unwrap().into_parts();
//! let composite = aggregator.aggregate_all(key).await.unwrap();
//! assert_eq!(composite.value("details").unwrap(), "details of 1");
//! # }
//! ```

use crate::client::{CreateClient, FetchClient, Operation};
use crate::clock::Clock;
use crate::circuit_breaker::CircuitBreakerRecord;
use crate::descriptor::DependencyDescriptor;
use crate::error::{AggregateError, ConfigError, DependencyError, DependencyUnavailable, Problem};
use crate::outcome::{Assembler, CallOutcome, CompositeResult, CreateOutcome};
use crate::policy::DependencyPolicy;
use crate::store::PrimaryStore;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default bound on one aggregation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// What happens when the downstream side effect of a create fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateConsistency {
    /// Log the failure and keep the primary entity.
    #[default]
    BestEffort,
    /// Keep the primary entity and park the side effect for [`Aggregator::redeliver_pending`].
    RetryLater,
}

/// A dependency to register: its descriptor, fallback value and the clients it offers.
pub struct Dependency<V> {
    descriptor: DependencyDescriptor,
    fallback: V,
    fetch: Option<Arc<dyn FetchClient<V>>>,
    create: Option<Arc<dyn CreateClient<V>>>,
}

impl<V> Dependency<V> {
    pub fn new(descriptor: DependencyDescriptor, fallback: V) -> Self {
        Self { descriptor, fallback, fetch: None, create: None }
    }

    pub fn with_fetch<C: FetchClient<V> + 'static>(mut self, client: C) -> Self {
        self.fetch = Some(Arc::new(client));
        self
    }

    pub fn with_create<C: CreateClient<V> + 'static>(mut self, client: C) -> Self {
        self.create = Some(Arc::new(client));
        self
    }

    /// Register one client for both operations.
    pub fn with_client<C>(mut self, client: C) -> Self
    where
        C: FetchClient<V> + CreateClient<V> + 'static,
    {
        let client = Arc::new(client);
        self.fetch = Some(client.clone());
        self.create = Some(client);
        self
    }
}

impl<V> fmt::Debug for Dependency<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("descriptor", &self.descriptor)
            .field("fetch", &self.fetch.is_some())
            .field("create", &self.create.is_some())
            .finish_non_exhaustive()
    }
}

/// Downstream create issued after a primary entity is stored.
pub struct SideEffect<P, V> {
    dependency: String,
    payload: Box<dyn FnOnce(u64, &P) -> V + Send>,
}

impl<P, V> SideEffect<P, V> {
    /// `payload` builds the request from the new entity's key and value.
    pub fn new<F>(dependency: impl Into<String>, payload: F) -> Self
    where
        F: FnOnce(u64, &P) -> V + Send + 'static,
    {
        Self { dependency: dependency.into(), payload: Box::new(payload) }
    }
}

impl<P, V> fmt::Debug for SideEffect<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideEffect").field("dependency", &self.dependency).finish_non_exhaustive()
    }
}

struct Registered<V> {
    policy: DependencyPolicy,
    fallback: V,
    fetch: Option<Arc<dyn FetchClient<V>>>,
    create: Option<Arc<dyn CreateClient<V>>>,
}

#[derive(Debug, Clone)]
struct Parked<V> {
    key: u64,
    dependency: String,
    payload: V,
}

/// Resilient fan-out over a primary store and its dependencies.
pub struct Aggregator<P, V> {
    store: Arc<dyn PrimaryStore<P>>,
    dependencies: BTreeMap<String, Registered<V>>,
    deadline: Duration,
    consistency: CreateConsistency,
    outbox: Mutex<Vec<Parked<V>>>,
}

impl<P, V> fmt::Debug for Aggregator<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .field("deadline", &self.deadline)
            .field("consistency", &self.consistency)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Aggregator`].
pub struct AggregatorBuilder<P, V> {
    store: Arc<dyn PrimaryStore<P>>,
    dependencies: Vec<Dependency<V>>,
    deadline: Duration,
    consistency: CreateConsistency,
    clock: Option<Arc<dyn Clock>>,
}

impl<P, V> AggregatorBuilder<P, V> {
    pub fn dependency(mut self, dependency: Dependency<V>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Bound on one aggregation (default 5s).
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn consistency(mut self, consistency: CreateConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Clock for every breaker (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the registration and create one policy per dependency.
    pub fn build(self) -> Result<Aggregator<P, V>, ConfigError> {
        let mut problems = Vec::new();
        if self.deadline.is_zero() {
            problems.push(Problem::new("aggregator", "deadline must be > 0"));
        }

        let mut dependencies = BTreeMap::new();
        for dependency in self.dependencies {
            let name = dependency.descriptor.name().to_owned();
            if dependencies.contains_key(&name) {
                problems.push(Problem::new(&name, "duplicate dependency name"));
                continue;
            }
            if dependency.fetch.is_none() && dependency.create.is_none() {
                problems.push(Problem::new(&name, "no client registered"));
            }
            let policy = match &self.clock {
                Some(clock) => DependencyPolicy::with_clock(&dependency.descriptor, clock.clone()),
                None => DependencyPolicy::new(&dependency.descriptor),
            };
            dependencies.insert(
                name,
                Registered {
                    policy,
                    fallback: dependency.fallback,
                    fetch: dependency.fetch,
                    create: dependency.create,
                },
            );
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(Aggregator {
            store: self.store,
            dependencies,
            deadline: self.deadline,
            consistency: self.consistency,
            outbox: Mutex::new(Vec::new()),
        })
    }
}

impl<P, V> Aggregator<P, V>
where
    P: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder<S>(store: Arc<S>) -> AggregatorBuilder<P, V>
    where
        S: PrimaryStore<P> + 'static,
    {
        AggregatorBuilder {
            store,
            dependencies: Vec::new(),
            deadline: DEFAULT_DEADLINE,
            consistency: CreateConsistency::default(),
            clock: None,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn consistency(&self) -> CreateConsistency {
        self.consistency
    }

    /// Registered dependency names, sorted.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn policy(&self, dependency: &str) -> Option<&DependencyPolicy> {
        self.dependencies.get(dependency).map(|d| &d.policy)
    }

    /// Current breaker record of every dependency.
    pub fn breakers(&self) -> BTreeMap<String, CircuitBreakerRecord> {
        self.dependencies
            .iter()
            .map(|(name, d)| (name.clone(), d.policy.breaker().snapshot()))
            .collect()
    }

    /// Force one dependency's breaker back to closed.
    pub fn reset_breaker(&self, dependency: &str) -> Result<(), AggregateError> {
        self.registered(dependency)?.policy.breaker().reset();
        Ok(())
    }

    /// The primary entity alone.
    pub fn get(&self, key: u64) -> Result<P, AggregateError> {
        self.store.get(key)?.ok_or(AggregateError::PrimaryNotFound { key })
    }

    /// Every primary entity, ordered by key.
    pub fn list(&self) -> Result<Vec<(u64, P)>, AggregateError> {
        Ok(self.store.list()?)
    }

    /// Composite over every fetch-capable dependency.
    pub async fn aggregate_all(&self, key: u64) -> Result<CompositeResult<P, V>, AggregateError> {
        let names: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(_, d)| d.fetch.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        self.aggregate_with_deadline(key, names, self.deadline).await
    }

    /// Composite over the named dependencies, bounded by the default deadline.
    pub async fn aggregate<I>(&self, key: u64, names: I) -> Result<CompositeResult<P, V>, AggregateError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.aggregate_with_deadline(key, names, self.deadline).await
    }

    /// Composite over the named dependencies. Calls still running at `deadline` are cancelled
    /// and fall back with [`DependencyUnavailable::DeadlineExceeded`].
    pub async fn aggregate_with_deadline<I>(
        &self,
        key: u64,
        names: I,
        deadline: Duration,
    ) -> Result<CompositeResult<P, V>, AggregateError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut required = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let dependency = self.registered(name)?;
            let client = dependency.fetch.clone().ok_or_else(|| {
                AggregateError::OperationUnsupported {
                    dependency: name.to_owned(),
                    operation: Operation::Fetch,
                }
            })?;
            required.insert(name.to_owned(), (dependency, client));
        }

        let primary = self.get(key)?;

        let deadline_at = Instant::now() + deadline;
        let calls = required.iter().map(|(name, (dependency, client))| {
            self.guarded(name, dependency, Operation::Fetch, deadline_at, deadline, move || {
                client.fetch(key)
            })
        });
        let outcomes = futures::future::join_all(calls).await;

        let parts: BTreeMap<String, CallOutcome<V>> =
            outcomes.into_iter().map(|o| (o.dependency.clone(), o)).collect();
        let degraded = parts.values().filter(|o| o.used_fallback).count();
        tracing::debug!(key, dependencies = parts.len(), degraded, "aggregation complete");

        Ok(CompositeResult { primary, parts })
    }

    /// Aggregate, then map the composite through `assembler`.
    pub async fn assemble<I, A>(&self, key: u64, names: I, assembler: &A) -> Result<A::Output, AggregateError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        A: Assembler<P, V>,
    {
        let composite = self.aggregate(key, names).await?;
        Ok(assembler.assemble(composite))
    }

    /// Store a new primary entity, then run its optional downstream side effect.
    ///
    /// The side effect never fails or rolls back the creation. Under
    /// [`CreateConsistency::RetryLater`] a failed side effect is parked for redelivery.
    pub async fn create<B>(
        &self,
        build: B,
        side_effect: Option<SideEffect<P, V>>,
    ) -> Result<CreateOutcome<P, V>, AggregateError>
    where
        B: FnOnce(u64) -> P + Send,
    {
        let target = match &side_effect {
            Some(effect) => {
                let dependency = self.registered(&effect.dependency)?;
                let client = dependency.create.clone().ok_or_else(|| {
                    AggregateError::OperationUnsupported {
                        dependency: effect.dependency.clone(),
                        operation: Operation::Create,
                    }
                })?;
                Some((dependency, client))
            }
            None => None,
        };

        let (key, primary) = self.store.insert(Box::new(build))?;
        tracing::info!(key, "primary entity created");

        let (Some(effect), Some((dependency, client))) = (side_effect, target) else {
            return Ok(CreateOutcome { key, primary, side_effect: None, pending: false });
        };

        let payload = (effect.payload)(key, &primary);
        let outcome = self.deliver(&effect.dependency, dependency, &client, &payload).await;
        let pending = outcome.used_fallback && self.park(key, &effect.dependency, payload);
        Ok(CreateOutcome { key, primary, side_effect: Some(outcome), pending })
    }

    /// Remove a primary entity and any side effect parked for it.
    pub fn delete(&self, key: u64) -> Result<(), AggregateError> {
        if !self.store.delete(key)? {
            return Err(AggregateError::PrimaryNotFound { key });
        }
        self.outbox().retain(|p| p.key != key);
        tracing::info!(key, "primary entity deleted");
        Ok(())
    }

    /// Side effects waiting for redelivery.
    pub fn pending(&self) -> usize {
        self.outbox().len()
    }

    /// Re-issue every parked side effect. Entries whose primary entity is gone are dropped;
    /// entries that fail again stay parked. An entry is only removed from the outbox once it is
    /// settled, so a store error or a cancelled redelivery leaves the rest parked.
    pub async fn redeliver_pending(&self) -> Result<Vec<CallOutcome<V>>, AggregateError> {
        let mut sweep = Sweep::new(&self.outbox);
        let mut outcomes = Vec::with_capacity(sweep.unsettled.len());

        while let Some(entry) = sweep.unsettled.front().cloned() {
            if self.store.get(entry.key)?.is_none() {
                tracing::debug!(key = entry.key, dependency = %entry.dependency, "dropping side effect of deleted entity");
                sweep.unsettled.pop_front();
                continue;
            }
            let Some((dependency, client)) = self
                .dependencies
                .get(&entry.dependency)
                .and_then(|d| d.create.clone().map(|c| (d, c)))
            else {
                sweep.unsettled.pop_front();
                continue;
            };

            let outcome = self.deliver(&entry.dependency, dependency, &client, &entry.payload).await;
            sweep.unsettled.pop_front();
            if outcome.used_fallback {
                sweep.retained.push(entry);
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn deliver(
        &self,
        name: &str,
        dependency: &Registered<V>,
        client: &Arc<dyn CreateClient<V>>,
        payload: &V,
    ) -> CallOutcome<V> {
        let deadline_at = Instant::now() + self.deadline;
        let outcome = self
            .guarded(name, dependency, Operation::Create, deadline_at, self.deadline, || {
                client.create(payload)
            })
            .await;
        if outcome.used_fallback {
            tracing::warn!(dependency = %name, "side effect failed; primary entity kept");
        }
        outcome
    }

    /// Returns whether the entry was parked.
    fn park(&self, key: u64, dependency: &str, payload: V) -> bool {
        if self.consistency != CreateConsistency::RetryLater {
            return false;
        }
        self.outbox().push(Parked { key, dependency: dependency.to_owned(), payload });
        true
    }

    async fn guarded<F, Fut>(
        &self,
        name: &str,
        dependency: &Registered<V>,
        operation: Operation,
        deadline_at: Instant,
        deadline: Duration,
        mut call: F,
    ) -> CallOutcome<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, DependencyError>>,
    {
        let start = Instant::now();
        let attempts = AtomicU32::new(0);
        let counted = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            call()
        };
        let guarded = dependency.policy.call(operation, dependency.fallback.clone(), counted);

        match tokio::time::timeout_at(deadline_at, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let failure = DependencyUnavailable::DeadlineExceeded { deadline };
                tracing::warn!(dependency = %name, %operation, %failure, "using fallback");
                CallOutcome::fallback(
                    name,
                    dependency.fallback.clone(),
                    failure,
                    attempts.load(Ordering::Relaxed),
                    start.elapsed(),
                )
            }
        }
    }

    fn registered(&self, name: &str) -> Result<&Registered<V>, AggregateError> {
        self.dependencies
            .get(name)
            .ok_or_else(|| AggregateError::UnknownDependency { name: name.to_owned() })
    }

    fn outbox(&self) -> MutexGuard<'_, Vec<Parked<V>>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parked entries taken out for one redelivery pass. Whatever is still held on drop goes back to
/// the front of the outbox, ahead of entries parked meanwhile.
struct Sweep<'a, V> {
    outbox: &'a Mutex<Vec<Parked<V>>>,
    unsettled: VecDeque<Parked<V>>,
    retained: Vec<Parked<V>>,
}

impl<'a, V> Sweep<'a, V> {
    fn new(outbox: &'a Mutex<Vec<Parked<V>>>) -> Self {
        let taken = std::mem::take(&mut *outbox.lock().unwrap_or_else(PoisonError::into_inner));
        Self { outbox, unsettled: taken.into(), retained: Vec::new() }
    }
}

impl<V> Drop for Sweep<'_, V> {
    fn drop(&mut self) {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let back: Vec<_> = self.retained.drain(..).chain(self.unsettled.drain(..)).collect();
        outbox.splice(0..0, back);
    }
}

impl<P, V> CreateOutcome<P, V> {
    /// Key and entity of the created primary.
    pub fn into_parts(self) -> (u64, P) {
        (self.key, self.primary)
    }
}
