#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use pyro_wire::utils::compression::{compress, decompress, maybe_compress};

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("zlib_compress_{}b", size), |b| {
            b.iter_batched(
                || data.clone(),
                |d| {
                    let _ = compress(&d).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("zlib_decompress_{}b", size), |b| {
            let compressed = compress(&data).unwrap();
            b.iter(|| {
                let out = decompress(&compressed).unwrap();
                assert_eq!(out.len(), data.len());
            })
        });
        group.bench_function(format!("maybe_compress_{}b", size), |b| {
            b.iter(|| {
                let _ = maybe_compress(&data, 512).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
