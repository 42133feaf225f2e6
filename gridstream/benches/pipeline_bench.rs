//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gridstream::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn chain(rt: &tokio::runtime::Runtime, stages: usize, at_least_once: bool) -> Arc<Pipeline> {
    let _guard = rt.enter();
    let mut builder = PipelineBuilder::new("bench")
        .window(UnboundedWindow::new("w"))
        .at_least_once(at_least_once);
    for i in 0..stages.saturating_sub(1) {
        builder = builder.stage(ForwardStage::new(format!("s{i}")));
    }
    builder
        .stage(NoOpStage::new("sink"))
        .build()
        .expect("bench pipeline")
}

fn execution_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("local_execution");

    for stages in [1usize, 4, 16] {
        let pipeline = chain(&rt, stages, false);
        group.bench_with_input(BenchmarkId::new("chain", stages), &pipeline, |b, pipeline| {
            b.iter(|| {
                rt.block_on(async {
                    let handle = pipeline.add_event(json!(1)).await.expect("submit");
                    black_box(handle.wait().await).expect("execution");
                });
            });
        });
    }

    let strict = chain(&rt, 4, true);
    group.bench_function("chain_at_least_once/4", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handle = strict.add_event(json!(1)).await.expect("submit");
                black_box(handle.wait().await).expect("execution");
            });
        });
    });
    group.finish();
}

fn batch_size_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let pipeline = chain(&rt, 4, false);
    let mut group = c.benchmark_group("batch_size");

    for size in [1usize, 64, 1024] {
        let events: Vec<Event> = (0..size).map(|i| json!({ "id": i })).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| {
                rt.block_on(async {
                    let handle = pipeline.add_events(events.clone()).await.expect("submit");
                    handle.wait().await.expect("execution");
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, execution_benchmark, batch_size_benchmark);
criterion_main!(benches);
