// ABOUTME: Benchmark suite for the P3 frame codec hot path
// ABOUTME: Measures CRC computation, frame parsing, and frame construction across payload sizes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dialtone::crc;
use dialtone::frame::{self, build_data_frame};
use std::time::Duration;

fn sample_frame(payload_len: usize) -> Vec<u8> {
    let payload = vec![b'x'; payload_len];
    build_data_frame(0x10, 0x10, b'D', "Dd", &payload)
}

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc_checksum");
    group.measurement_time(Duration::from_secs(10));

    for &size in &[8usize, 64, 256, 1024] {
        let data = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::new("checksum", size), &data, |b, data| {
            b.iter(|| crc::checksum(black_box(data)))
        });
    }

    group.finish();
}

fn bench_frame_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_len");
    group.measurement_time(Duration::from_secs(10));

    let small = sample_frame(16);
    group.bench_function("small", |b| {
        b.iter(|| frame::frame_len(black_box(&small)).unwrap())
    });

    let large = sample_frame(512);
    group.bench_function("large", |b| {
        b.iter(|| frame::frame_len(black_box(&large)).unwrap())
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parse");
    group.measurement_time(Duration::from_secs(10));

    for &size in &[16usize, 128, 512] {
        let raw = sample_frame(size);
        group.bench_with_input(BenchmarkId::new("parse", size), &raw, |b, raw| {
            b.iter(|| frame::parse(black_box(raw)).unwrap())
        });
    }

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_build");
    group.measurement_time(Duration::from_secs(10));

    let payload = vec![b'x'; 256];
    group.bench_function("build_data_frame", |b| {
        b.iter(|| build_data_frame(0x10, 0x10, b'D', "Dd", black_box(&payload)))
    });

    group.finish();
}

criterion_group!(benches, bench_crc, bench_frame_len, bench_parse, bench_build);
criterion_main!(benches);
