//! Circuit breaker and client hot-path benchmarks
//!
//! - Admission on a closed circuit: one map lookup plus one per-service lock
//! - Rejection on an open circuit: the fast-fail path
//! - A full guarded call through the in-process transport
//!
//! Run with: `cargo bench --bench breaker_admission`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use guarded_mesh_core::{Metadata, SystemClock};
use guarded_mesh_runtime::{
    CircuitBreaker, CircuitBreakerConfig, ClientConfig, InProcessTransport, ServiceClient,
    ServiceRegistry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(5)
            .reset_timeout(Duration::from_secs(3600))
            .build(),
        Arc::new(SystemClock),
    )
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("breaker_admission");
    group.throughput(Throughput::Elements(1));

    let closed = breaker();
    group.bench_function("closed_acquire_success", |b| {
        b.iter(|| {
            let permit = closed.acquire(black_box("pricing-service")).expect("closed");
            permit.success();
        });
    });

    let open = breaker();
    for _ in 0..5 {
        open.record_failure("pricing-service");
    }
    group.bench_function("open_rejection", |b| {
        b.iter(|| black_box(open.is_allowed(black_box("pricing-service"))));
    });

    let many = breaker();
    let names: Vec<String> = (0..1_000).map(|n| format!("service-{n}")).collect();
    for name in &names {
        many.record_success(name);
    }
    group.bench_function("closed_acquire_1000_services", |b| {
        let mut next = 0;
        b.iter(|| {
            let permit = many.acquire(&names[next % names.len()]).expect("closed");
            permit.success();
            next += 1;
        });
    });

    group.finish();
}

fn bench_guarded_call(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    let transport = InProcessTransport::new();
    transport.handle("pricing-service", "quote", |params| async move { Ok(params) });

    let clock = Arc::new(SystemClock);
    let registry = ServiceRegistry::new(clock.clone());
    runtime.block_on(registry.register("pricing-service", "in-process", Metadata::new()));

    let client = ServiceClient::new(
        registry,
        breaker(),
        Arc::new(transport),
        clock,
        ClientConfig::default(),
    );

    let mut group = c.benchmark_group("guarded_call");
    group.throughput(Throughput::Elements(1));
    group.bench_function("in_process_quote", |b| {
        b.to_async(&runtime).iter(|| async {
            client
                .call("pricing-service", "quote", json!({"sku": "A-1"}))
                .await
                .expect("quote")
        });
    });
    group.finish();
}

criterion_group!(benches, bench_admission, bench_guarded_call);
criterion_main!(benches);
