//! Bucketing and assignment benchmarks
//!
//! Benchmarks for the hot path consumers hit on every render:
//! - Raw hash + bucket point
//! - Variant selection across variant counts
//! - Cached `get_variant` through the service
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trueno_ab::bucketing::{assign, bucket_point};
use trueno_ab::experiment::{Experiment, Variant};
use trueno_ab::ExperimentService;

#[allow(clippy::cast_precision_loss)]
fn experiment(variants: usize) -> Experiment {
    let weight = 1.0 / variants as f64;
    (0..variants)
        .fold(Experiment::builder("checkout-cta", "Checkout CTA"), |b, i| {
            b.variant(Variant::new(format!("v{i}"), format!("V{i}"), weight))
        })
        .build()
        .unwrap()
}

fn bench_bucket_point(c: &mut Criterion) {
    c.bench_function("bucket_point", |b| {
        b.iter(|| bucket_point(black_box("lq3k2x9a-4f8h2k1zq"), black_box("checkout-cta")));
    });
}

fn bench_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign");
    for variants in [2, 4, 16] {
        let exp = experiment(variants);
        group.bench_with_input(BenchmarkId::from_parameter(variants), &exp, |b, exp| {
            b.iter(|| assign(black_box("lq3k2x9a-4f8h2k1zq"), exp).unwrap());
        });
    }
    group.finish();
}

fn bench_cached_get_variant(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let service = ExperimentService::builder()
        .baseline(vec![experiment(2)])
        .build()
        .unwrap();
    runtime.block_on(service.init());
    runtime.block_on(service.get_variant("checkout-cta"));

    c.bench_function("get_variant_cached", |b| {
        b.iter(|| runtime.block_on(service.get_variant(black_box("checkout-cta"))));
    });
}

criterion_group!(benches, bench_bucket_point, bench_assign, bench_cached_get_variant);
criterion_main!(benches);
