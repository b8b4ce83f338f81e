use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ninelives_gather::{
    CircuitBreaker, CircuitBreakerConfig, DependencyDescriptor, DependencyError, DependencyPolicy,
    Operation, PolicyLayer,
};

use futures::future::Ready;
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

// Answers immediately with its input.
#[derive(Clone)]
struct EchoService;

impl Service<u64> for EchoService {
    type Response = u64;
    type Error = DependencyError;
    type Future = Ready<Result<u64, DependencyError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: u64) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn breaker_gate(c: &mut Criterion) {
    let config = CircuitBreakerConfig::new(10, Duration::from_secs(30), 1).unwrap();
    let breaker = CircuitBreaker::new("bench", config);

    c.bench_function("breaker_acquire_succeed", |b| {
        b.iter(|| {
            if let Ok(permit) = black_box(&breaker).try_acquire() {
                permit.succeed();
            }
        });
    });
}

fn breaker_open_short_circuit(c: &mut Criterion) {
    let config = CircuitBreakerConfig::new(1, Duration::from_secs(3600), 1).unwrap();
    let breaker = CircuitBreaker::new("bench", config);
    if let Ok(permit) = breaker.try_acquire() {
        permit.fail();
    }

    c.bench_function("breaker_open_refusal", |b| {
        b.iter(|| black_box(breaker.try_acquire()).is_err());
    });
}

fn guarded_call_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let descriptor = DependencyDescriptor::builder("echo").bulkhead_capacity(1024).build().unwrap();
    let svc = PolicyLayer::new(DependencyPolicy::new(&descriptor))
        .for_operation(Operation::Fetch)
        .layer(EchoService);

    c.bench_function("guarded_call_success", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(svc.clone().oneshot(black_box(7)).await);
        });
    });
}

criterion_group!(benches, breaker_gate, breaker_open_short_circuit, guarded_call_success);
criterion_main!(benches);
