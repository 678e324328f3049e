//! Query pipeline benchmarks.
//!
//! Compares single-query and split-query collection loading.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relshape_bench::{blog_store, blogs_with_posts, compiler, Scale};
use relshape_core::{QueryContext, QueryOptions, QueryTrackingBehavior};

fn options(split: bool) -> QueryOptions {
    let options = QueryOptions::default().tracking(QueryTrackingBehavior::NoTracking);
    if split {
        options.split_query()
    } else {
        options
    }
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let store = blog_store(Scale::Tiny).unwrap();

    for split in [false, true] {
        let compiler = compiler(&store, options(split));
        group.bench_with_input(BenchmarkId::new("split", split), &split, |b, _| {
            b.iter(|| black_box(compiler.compile(blogs_with_posts()).unwrap()));
        });
    }

    group.finish();
}

fn bench_enumerate(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumerate");

    for scale in [Scale::Tiny, Scale::Small] {
        let store = blog_store(scale).unwrap();
        for split in [false, true] {
            let compiled = compiler(&store, options(split)).compile(blogs_with_posts()).unwrap();
            let id = format!("{scale:?}/split={split}");
            group.bench_function(BenchmarkId::new("blocking", &id), |b| {
                b.iter(|| black_box(compiled.to_list(QueryContext::new("Bench")).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_enumerate_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumerate_async");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = blog_store(Scale::Small).unwrap();

    for split in [false, true] {
        let compiled = compiler(&store, options(split)).compile(blogs_with_posts()).unwrap();
        group.bench_with_input(BenchmarkId::new("split", split), &split, |b, _| {
            b.to_async(&runtime).iter(|| {
                let compiled = compiled.clone();
                async move {
                    black_box(compiled.to_list_async(QueryContext::new("Bench")).await.unwrap())
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_enumerate, bench_enumerate_async);
criterion_main!(benches);
