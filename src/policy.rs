//! Guarded dependency calls.
//!
//! [`DependencyPolicy`] composes the per-dependency policies in this order:
//!
//! ```text
//! bulkhead slot (once per call)
//!   └─ retry loop
//!        └─ breaker gate (every attempt)
//!             └─ timeout
//!                  └─ client call
//! ```
//!
//! Every attempt outcome feeds the breaker, a bulkhead rejection included. A guarded call never
//! fails: when the dependency is unavailable the caller gets the fallback value and the reason in
//! a [`CallOutcome`]. The breaker and bulkhead are shared by every operation of one dependency;
//! clones of a policy share them too.
//!
//! The same composition is available as a tower layer ([`PolicyLayer`]).

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::client::Operation;
use crate::clock::Clock;
use crate::descriptor::DependencyDescriptor;
use crate::error::{DependencyError, DependencyUnavailable};
use crate::outcome::CallOutcome;
use crate::retry::{AttemptError, Attempted, RetryPolicy};
use crate::timeout::TimeoutPolicy;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;
use tracing::Instrument;

/// Timeout, retry, circuit breaker and bulkhead for one dependency.
#[derive(Debug, Clone)]
pub struct DependencyPolicy {
    name: Arc<str>,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
    timeout: TimeoutPolicy,
    retry: RetryPolicy,
}

impl DependencyPolicy {
    pub fn new(descriptor: &DependencyDescriptor) -> Self {
        Self::from_parts(
            descriptor,
            CircuitBreaker::new(descriptor.name(), descriptor.breaker_config().clone()),
        )
    }

    /// Policy whose breaker reads time from `clock`.
    pub fn with_clock(descriptor: &DependencyDescriptor, clock: Arc<dyn Clock>) -> Self {
        Self::from_parts(
            descriptor,
            CircuitBreaker::with_clock(
                descriptor.name(),
                descriptor.breaker_config().clone(),
                clock,
            ),
        )
    }

    fn from_parts(descriptor: &DependencyDescriptor, breaker: CircuitBreaker) -> Self {
        Self {
            name: Arc::from(descriptor.name()),
            bulkhead: Bulkhead::new(descriptor.bulkhead_capacity(), descriptor.bulkhead_wait()),
            breaker,
            timeout: descriptor.timeout_policy(),
            retry: descriptor.retry_policy(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// Run `call` under every policy and report the raw result with the attempt count.
    pub async fn run<T, Fut, Op>(&self, operation: Operation, mut call: Op) -> Attempted<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let span = tracing::debug_span!("guarded_call", dependency = %self.name, %operation);
        async move {
            let _slot = match self.bulkhead.acquire().await {
                Ok(slot) => slot,
                Err(rejected) => {
                    self.breaker.record_rejection();
                    return Attempted { result: Err(rejected), attempts: 0 };
                }
            };

            self.retry
                .execute(|| {
                    let admitted = self.breaker.try_acquire().map(|permit| (permit, call()));
                    let timeout = &self.timeout;
                    async move {
                        let (permit, attempt) = match admitted {
                            Ok(admitted) => admitted,
                            Err(state) => return Err(AttemptError::CircuitOpen(state)),
                        };
                        match timeout.execute(attempt).await {
                            Ok(value) => {
                                permit.succeed();
                                Ok(value)
                            }
                            Err(error) => {
                                permit.fail();
                                Err(AttemptError::Dependency(error))
                            }
                        }
                    }
                })
                .await
        }
        .instrument(span)
        .await
    }

    /// Run `call` under every policy, substituting `fallback` when the dependency is
    /// unavailable.
    pub async fn call<T, Fut, Op>(&self, operation: Operation, fallback: T, call: Op) -> CallOutcome<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let start = Instant::now();
        let Attempted { result, attempts } = self.run(operation, call).await;
        let elapsed = start.elapsed();
        match result {
            Ok(value) => CallOutcome::success(&*self.name, value, attempts, elapsed),
            Err(failure) => {
                tracing::warn!(
                    dependency = %self.name,
                    %operation,
                    attempts,
                    reason = %failure,
                    "dependency unavailable, using fallback"
                );
                CallOutcome::fallback(&*self.name, fallback, failure, attempts, elapsed)
            }
        }
    }
}

/// Tower layer applying a [`DependencyPolicy`] to a service that fails with
/// [`DependencyError`].
#[derive(Debug, Clone)]
pub struct PolicyLayer {
    policy: DependencyPolicy,
    operation: Operation,
}

impl PolicyLayer {
    /// Guard fetch calls.
    pub fn new(policy: DependencyPolicy) -> Self {
        Self { policy, operation: Operation::Fetch }
    }

    /// Label guarded calls with `operation` instead of fetch.
    pub fn for_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }
}

impl<S> Layer<S> for PolicyLayer {
    type Service = PolicyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PolicyService { inner, policy: self.policy.clone(), operation: self.operation }
    }
}

/// Service produced by [`PolicyLayer`]. Each request is retried with a fresh clone of the inner
/// service, so requests must be `Clone`.
#[derive(Debug, Clone)]
pub struct PolicyService<S> {
    inner: S,
    policy: DependencyPolicy,
    operation: Operation,
}

impl<S, Req> Service<Req> for PolicyService<S>
where
    S: Service<Req, Error = DependencyError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = DependencyUnavailable;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Concurrency is bounded by the bulkhead; inner readiness is awaited per attempt.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        let operation = self.operation;

        Box::pin(async move {
            policy
                .run(operation, move || {
                    let svc = inner.clone();
                    let req = req.clone();
                    async move { svc.oneshot(req).await }
                })
                .await
                .result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn descriptor() -> crate::descriptor::DependencyDescriptorBuilder {
        DependencyDescriptor::builder("details")
            .max_retries(2)
            .backoff_base(Duration::from_millis(10))
            .request_timeout(Duration::from_millis(100))
            .bulkhead_capacity(2)
            .failure_threshold(3)
            .open_state_duration(Duration::from_secs(5))
            .half_open_trial_count(1)
    }

    fn refused() -> DependencyError {
        DependencyError::Connect("connection refused".into())
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_passed_through() {
        let policy = DependencyPolicy::new(&descriptor().build().unwrap());
        let outcome = policy.call(Operation::Fetch, 0, || async { Ok(7) }).await;
        assert!(outcome.succeeded);
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.value, 7);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failure, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_fall_back() {
        let policy = DependencyPolicy::new(&descriptor().failure_threshold(10).build().unwrap());
        let calls = AtomicU32::new(0);

        let outcome = policy
            .call(Operation::Fetch, Vec::<String>::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(vec!["never".to_string()])
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.used_fallback);
        assert!(outcome.value.is_empty());
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.failure.unwrap().last_error().unwrap().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opening_mid_sequence_stops_attempts() {
        // threshold 3 with maxRetries 5: the fourth attempt is refused by the breaker.
        let policy = DependencyPolicy::new(&descriptor().max_retries(5).build().unwrap());
        let calls = AtomicU32::new(0);

        let outcome = policy
            .call(Operation::Fetch, 0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome.failure,
            Some(DependencyUnavailable::CircuitOpen { state: CircuitState::Open, attempts: 3 })
        );
        assert_eq!(policy.breaker().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_calling() {
        let clock = ManualClock::new();
        let policy = DependencyPolicy::with_clock(
            &descriptor().max_retries(0).build().unwrap(),
            Arc::new(clock.clone()),
        );
        for _ in 0..3 {
            policy.call(Operation::Fetch, 0, || async { Err(refused()) }).await;
        }
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let outcome = policy
            .call(Operation::Fetch, 0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.failure.unwrap().is_circuit_open());

        clock.advance(5_000);
        let outcome = policy.call(Operation::Fetch, 0, || async { Ok(1) }).await;
        assert!(outcome.succeeded);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_errors_fall_back_without_retry() {
        let policy = DependencyPolicy::new(&descriptor().build().unwrap());
        let calls = AtomicU32::new(0);
        let outcome = policy
            .call(Operation::Create, "fallback", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DependencyError::Remote { status: 500, message: "boom".into() }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.value, "fallback");
        assert!(matches!(outcome.failure, Some(DependencyUnavailable::Rejected { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn bulkhead_rejection_counts_as_breaker_failure() {
        let policy = DependencyPolicy::new(&descriptor().bulkhead_capacity(1).build().unwrap());
        let _held = policy.bulkhead().acquire().await.unwrap();

        let outcome = policy.call(Operation::Fetch, 0, || async { Ok(1) }).await;
        assert!(outcome.failure.unwrap().is_bulkhead());
        assert_eq!(outcome.attempts, 0);
        assert_eq!(policy.breaker().snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_released_after_every_call() {
        let policy = DependencyPolicy::new(&descriptor().build().unwrap());
        policy.call(Operation::Fetch, 0, || async { Ok(1) }).await;
        policy.call(Operation::Fetch, 0, || async { Err(refused()) }).await;
        assert_eq!(policy.bulkhead().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tower_layer_guards_a_service() {
        let policy = DependencyPolicy::new(&descriptor().build().unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let svc = tower::service_fn(move |key: u64| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DependencyError::Connect("reset".into()))
                } else {
                    Ok(key * 2)
                }
            }
        });

        let guarded = PolicyLayer::new(policy).layer(svc);
        assert_eq!(guarded.oneshot(21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
