//! Benchmarks for max compositing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use demflow::merge::MaxAccumulator;
use ndarray::Array3;

fn tile(size: usize, value: f32) -> Array3<f32> {
    let mut data = Array3::from_elem((1, size, size), value);
    // Sprinkle nodata so the validity check is exercised.
    for i in (0..size).step_by(7) {
        data[[0, i, i]] = -9999.0;
    }
    data
}

fn compositing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("max_compositing");
    for size in [256usize, 1024] {
        let tiles: Vec<_> = (0..4u8).map(|i| tile(size, 100.0 + f32::from(i) * 25.0)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut acc = MaxAccumulator::new(1, size + size / 2, size + size / 2);
                for (i, t) in tiles.iter().enumerate() {
                    let offset = (i % 2) * size / 2;
                    acc.add(t.view(), Some(-9999.0), offset, (i / 2) * size / 2);
                }
                black_box(acc.finish(-9999.0))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, compositing_benchmark);
criterion_main!(benches);
