/*
Measures the cost of framing a sample batch for the wire and parsing it back, for a small
batch (one sensor) and a wide one (64 sensors). Both paths run on the transport threads, never
on the tick loop.
*/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use ncs_emulation::net::protocol::{Batch, BatchKind, SequenceFilter};
use ncs_emulation::plant::variable::{Value, ValueMap};

fn batch_with(sensors: usize) -> Batch {
    let values: ValueMap = (0..sensors)
        .map(|i| (format!("sensor_{:02}", i), Value::Float(i as f64 * 0.5)))
        .collect();
    Batch::new(BatchKind::Sample, 42, values)
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_codec");

    for sensors in [1usize, 64] {
        let batch = batch_with(sensors);
        let bytes = batch.encode().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", sensors), &batch, |b, batch| {
            b.iter(|| black_box(batch.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", sensors), &bytes, |b, bytes| {
            b.iter(|| black_box(Batch::decode(black_box(bytes)).unwrap()));
        });
    }

    group.finish();
}

fn bench_sequence_filter(c: &mut Criterion) {
    c.bench_function("sequence_filter_accept", |b| {
        let mut filter = SequenceFilter::new();
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            // Every fourth batch arrives late.
            let offered = if seq % 4 == 0 { seq - 2 } else { seq };
            black_box(filter.accept(black_box(offered)).is_ok());
        });
    });
}

criterion_group!(benches, bench_codec, bench_sequence_filter);
criterion_main!(benches);
