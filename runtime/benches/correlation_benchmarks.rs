//! Correlation Performance Benchmarks
//!
//! Measures the hot paths of an asynchronous exchange:
//! - Registry register/resolve per request
//! - Group collection and aggregation for N-way replies
//! - A full in-process request/reply round trip
//! - Dead letter queue pushes
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use correlator_core::{CorrelationId, Event, ExchangePattern, Message};
use correlator_runtime::aggregator::ResponseCorrelationAggregator;
use correlator_runtime::dlq::DeadLetterQueue;
use correlator_runtime::{
    AsyncRequestReplyRequester, CorrelationRegistry, EventCorrelator, GroupRegistry,
    RuntimeConfig, RuntimeContext,
};
use correlator_testing::mocks::EchoListener;
use correlator_testing::properties::group_events;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

/// Benchmark registering and resolving one pending request
fn benchmark_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_resolve", |b| {
        let registry = Arc::new(CorrelationRegistry::new());
        let request = Event::new(Message::text("request"));
        let reply = Event::new(Message::text("reply"));
        let mut counter = 0_u64;

        b.iter(|| {
            let id = CorrelationId::new(format!("bench-{counter}"));
            counter += 1;
            let pending = registry
                .register(id.clone(), request.clone())
                .expect("fresh id");
            black_box(registry.resolve(&id, Ok(reply.clone())));
            drop(pending);
        });
    });

    group.bench_function("resolve_unknown", |b| {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("nobody-waits");
        let reply = Event::new(Message::text("late"));

        b.iter(|| {
            black_box(registry.resolve(&id, Ok(reply.clone())));
        });
    });

    group.finish();
}

/// Benchmark collecting and aggregating groups of different sizes
fn benchmark_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for size in [1_usize, 5, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("collect", size), &size, |b, &size| {
            let correlator = EventCorrelator::new(
                Arc::new(ResponseCorrelationAggregator::new()),
                Arc::new(GroupRegistry::default()),
            );
            let mut counter = 0_u64;

            b.iter(|| {
                let id = CorrelationId::new(format!("group-{counter}"));
                counter += 1;
                let mut result = None;
                for event in group_events(&id, size) {
                    result = correlator.add_event(event).expect("aggregation succeeds");
                }
                black_box(result);
            });
        });
    }

    group.finish();
}

/// Benchmark a request answered inline by an in-process destination
fn benchmark_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let context = runtime
        .block_on(async { RuntimeContext::start(RuntimeConfig::default()) })
        .expect("context starts");
    let requester = AsyncRequestReplyRequester::builder(context)
        .listener(Arc::new(EchoListener::new()))
        .build();

    group.bench_function("single_reply", |b| {
        b.to_async(&runtime).iter(|| async {
            let request = Event::new(Message::text("ping"))
                .with_exchange_pattern(ExchangePattern::RequestResponse);
            black_box(requester.process(request).await.expect("reply"));
        });
    });

    group.finish();
}

/// Benchmark dead letter pushes at capacity
fn benchmark_dlq(c: &mut Criterion) {
    let mut group = c.benchmark_group("dlq");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_evicting", |b| {
        let dlq = DeadLetterQueue::new(100);
        let event = Event::new(Message::text("failed"));
        for _ in 0..100 {
            dlq.push(event.clone(), "error", 1);
        }

        b.iter(|| {
            dlq.push(black_box(event.clone()), "error", 3);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_registry,
    benchmark_aggregation,
    benchmark_round_trip,
    benchmark_dlq
);
criterion_main!(benches);
