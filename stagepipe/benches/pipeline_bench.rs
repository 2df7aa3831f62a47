//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagepipe::prelude::*;

fn pipeline_benchmark(c: &mut Criterion) {
    let source = from_iterable(0..1_000_u64).with_capacity(64).build();

    let threads = map(|x: u64| Ok(black_box(x * x)), &source)
        .with_workers(4)
        .with_capacity(64)
        .build()
        .expect("valid stage");
    c.bench_function("map_1000_threads", |b| {
        b.iter(|| black_box(threads.to_vec().expect("run succeeds").len()))
    });

    let tasks = map(|x: u64| Ok(black_box(x * x)), &source)
        .with_workers(4)
        .with_capacity(64)
        .with_substrate(Substrate::Task)
        .build()
        .expect("valid stage");
    c.bench_function("map_1000_tasks", |b| {
        b.iter(|| black_box(tasks.to_vec().expect("run succeeds").len()))
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
