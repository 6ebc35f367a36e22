//! Benchmarks for NDWI and mask algebra

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lakemap_algorithms::imagery::{lake_mask, ndwi, threshold_above};
use lakemap_core::{GeoTransform, Raster};

/// Synthetic B03/B08 pair with round "lakes" where green beats NIR
fn create_bands(size: usize) -> (Raster<u16>, Raster<u16>) {
    let mut green = Raster::new(size, size);
    let mut nir = Raster::new(size, size);
    let t = GeoTransform::new(499_980.0, 7_700_040.0, 10.0, -10.0);
    green.set_transform(t);
    nir.set_transform(t);
    for row in 0..size {
        for col in 0..size {
            let lake = ((row / 32) + (col / 32)) % 3 == 0;
            let noise = ((row * 7 + col * 13) % 17) as u16;
            green.set(row, col, 1500 + noise).unwrap();
            let base = if lake { 400 } else { 2600 };
            nir.set(row, col, base + noise).unwrap();
        }
    }
    (green, nir)
}

fn bench_ndwi(c: &mut Criterion) {
    let mut group = c.benchmark_group("imagery/ndwi");
    for size in [512, 1024, 2048] {
        let (green, nir) = create_bands(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| ndwi(black_box(&green), black_box(&nir)).unwrap())
        });
    }
    group.finish();
}

fn bench_lake_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("imagery/lake_mask");
    for size in [512, 1024, 2048] {
        let (green, nir) = create_bands(size);
        let index = ndwi(&green, &nir).unwrap();
        let dem: Raster<f32> = index.map(|v| if v.is_nan() { f32::NAN } else { 800.0 });
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let water = threshold_above(black_box(&index), 0.25);
                lake_mask(&water, black_box(&dem), 0.0).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ndwi, bench_lake_mask);
criterion_main!(benches);
