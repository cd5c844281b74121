//! Performance benchmarks for mask generation and dispatch.
//!
//! Mask generation runs once per training batch, so it has to stay small
//! next to the classifier's forward pass.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mezclar::config::{build_dispatcher, from_yaml_str};
use mezclar::mask::{
    cutmix, fmix, puzzle, saliency, BoxPlacement, FMixParams, PuzzleMixParams, RatioSampler,
};
use mezclar::{ImageBatch, Labels};
use ndarray::{Array2, Array3, Array4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn ratio() -> RatioSampler {
    RatioSampler::symmetric(1.0).expect("valid alpha")
}

fn smooth_image(size: usize, phase: f32) -> Array3<f32> {
    Array3::from_shape_fn((3, size, size), |(c, y, x)| {
        let u = (x as f32 + 0.5 * y as f32) / size as f32;
        0.5 + 0.5 * (u * std::f32::consts::TAU + phase + c as f32).sin()
    })
}

/// Benchmark box masks across image sizes
fn bench_cutmix(c: &mut Criterion) {
    let mut group = c.benchmark_group("CutMix");

    for size in [32, 64, 224].iter() {
        group.throughput(Throughput::Elements((*size * *size) as u64));
        group.bench_with_input(BenchmarkId::new("mask", size), size, |b, &size| {
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            b.iter(|| {
                black_box(cutmix::cutmix_mask(size, size, 0.6, BoxPlacement::Inside, &mut rng))
            });
        });
    }
    group.finish();
}

/// Benchmark Fourier masks (FFT plus threshold search)
fn bench_fmix(c: &mut Criterion) {
    let mut group = c.benchmark_group("FMix");
    let params = FMixParams {
        ratio: ratio(),
        decay_power: 3.0,
        max_soft: 0.0,
        reformulate: false,
        threshold_iters: 32,
    };

    for size in [32, 64, 128].iter() {
        group.throughput(Throughput::Elements((*size * *size) as u64));
        group.bench_with_input(BenchmarkId::new("mask", size), size, |b, &size| {
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            b.iter(|| black_box(fmix::fmix_mask(size, size, 0.5, &params, &mut rng)));
        });
    }
    group.finish();
}

/// Benchmark saliency maps and the graph-cut PuzzleMix labeling
fn bench_puzzle(c: &mut Criterion) {
    let mut group = c.benchmark_group("PuzzleMix");
    let params = PuzzleMixParams {
        ratio: ratio(),
        grid: 4,
        beta: 1.2,
        max_flow_augmentations: 10_000,
        max_bisection_iters: 16,
    };

    for size in [32, 64].iter() {
        let a = smooth_image(*size, 0.0);
        let b = smooth_image(*size, 1.7);
        group.bench_with_input(BenchmarkId::new("saliency", size), size, |bench, _| {
            bench.iter(|| black_box(saliency::saliency_map(a.view())));
        });

        let sal_a: Array2<f32> = saliency::saliency_map(a.view());
        let sal_b: Array2<f32> = saliency::saliency_map(b.view());
        group.bench_with_input(BenchmarkId::new("mask", size), size, |bench, _| {
            bench.iter(|| {
                black_box(puzzle::puzzle_mask(sal_a.view(), sal_b.view(), 0.5, &params))
            });
        });
    }
    group.finish();
}

/// Benchmark a full dispatch: selection, masks, image and label mixing
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Dispatch");
    let batch_size = 32;
    let images = Array4::from_shape_fn((batch_size, 3, 32, 32), |(i, c, y, x)| {
        ((i * 31 + c * 7 + y * 32 + x) % 101) as f32 / 101.0
    });
    let labels = Labels::indices((0..batch_size).map(|i| i % 10).collect(), 10).expect("labels");
    let batch = ImageBatch::new(images, labels).expect("batch");

    for name in ["mixup", "cutmix", "fmix", "resizemix"] {
        let yaml = format!("seed: 7\npolicies:\n  {name}: {{}}\n");
        let spec = from_yaml_str(&yaml).expect("valid config");
        let mut dispatcher = build_dispatcher(&spec).expect("dispatcher");
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(BenchmarkId::new("next", name), |b| {
            b.iter(|| black_box(dispatcher.next(&batch).expect("dispatch")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cutmix, bench_fmix, bench_puzzle, bench_dispatch);
criterion_main!(benches);
