//! Ingress and aggregation throughput benchmarks
//!
//! - bench_grouped_count: punctuated ingress into a keyed running count
//! - bench_execution_modes: row vs columnar evaluation of a filter chain
//! - bench_union: time merge of two inputs
//!
//! Run with: cargo bench --bench aggregate_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempo_core::container::QueryContainer;
use tempo_core::egress::ReshapingPolicy;
use tempo_core::event::StreamEvent;
use tempo_core::ingress::{IngressConfig, PunctuationPolicy};
use tempo_core::operator::{CountAggregate, GroupAggregate, Select, Where};
use tempo_core::{EngineConfig, ExecutionMode};

const EVENTS: i64 = 10_000;

fn intervals(count: i64) -> Vec<StreamEvent<i64>> {
    (0..count)
        .map(|t| StreamEvent::interval(t, t + 50, t).unwrap())
        .collect()
}

/// Keyed running count over `EVENTS` intervals, varying the key cardinality
fn bench_grouped_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_count");
    group.throughput(Throughput::Elements(EVENTS as u64));

    for keys in [1i64, 16, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            let events = intervals(EVENTS);
            b.iter(|| {
                let container = QueryContainer::default();
                let config = IngressConfig::default()
                    .with_punctuation(PunctuationPolicy::Time { period: 100 });
                let (input, stream) = container.ingress::<i64>("bench", config).unwrap();
                let output = stream
                    .apply(GroupAggregate::grouped(
                        move |v: &i64| v % keys,
                        CountAggregate::new(),
                    ))
                    .egress(ReshapingPolicy::None);
                input.push_all(events.iter().cloned()).unwrap();
                input.complete().unwrap();
                black_box(output.delivered())
            });
        });
    }

    group.finish();
}

/// Stateless chain under both execution strategies
fn bench_execution_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_mode");
    group.throughput(Throughput::Elements(EVENTS as u64));

    for mode in [ExecutionMode::Row, ExecutionMode::Columnar] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{mode:?}")),
            &mode,
            |b, &mode| {
                let events = intervals(EVENTS);
                b.iter(|| {
                    let container =
                        QueryContainer::new(EngineConfig::builder().execution_mode(mode).build());
                    let (input, stream) = container
                        .ingress::<i64>("bench", IngressConfig::default())
                        .unwrap();
                    let output = stream
                        .apply(Where::new(|v: &i64| v % 3 != 0))
                        .apply(Select::new(|v: &i64| v * 2))
                        .egress(ReshapingPolicy::None);
                    input.push_all(events.iter().cloned()).unwrap();
                    input.complete().unwrap();
                    black_box(output.delivered())
                });
            },
        );
    }

    group.finish();
}

/// Two interleaved inputs merged by time
fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("union");
    group.throughput(Throughput::Elements(2 * EVENTS as u64));

    group.bench_function("interleaved", |b| {
        let events = intervals(EVENTS);
        b.iter(|| {
            let container = QueryContainer::default();
            let config =
                IngressConfig::default().with_punctuation(PunctuationPolicy::Count { events: 256 });
            let (left, left_stream) = container.ingress::<i64>("left", config).unwrap();
            let (right, right_stream) = container.ingress::<i64>("right", config).unwrap();
            let output = left_stream
                .union(right_stream)
                .egress(ReshapingPolicy::None);
            for chunk in events.chunks(512) {
                left.push_all(chunk.iter().cloned()).unwrap();
                right.push_all(chunk.iter().cloned()).unwrap();
            }
            left.complete().unwrap();
            right.complete().unwrap();
            black_box(output.delivered())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_grouped_count,
    bench_execution_modes,
    bench_union
);
criterion_main!(benches);
