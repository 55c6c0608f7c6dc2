//! Benchmarks for the frame codec and masking.
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sockline::ws::frame::{encode_frame, FrameEvent, FrameParser, OpCode};
use sockline::ws::mask::apply_mask;

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            let mask = [0x37, 0xfa, 0x21, 0x3d];
            b.iter(|| apply_mask(black_box(&mut data), black_box(mask)));
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("unmasked", size), &size, |b, &size| {
            let payload = vec![0x42u8; size];
            let mut out = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                out.clear();
                encode_frame(
                    black_box(&mut out),
                    OpCode::Binary,
                    black_box(&payload),
                    true,
                    false,
                    None,
                );
            });
        });
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for size in [64, 1024, 16384, 65536] {
        let mut wire = BytesMut::new();
        let payload = vec![0x42u8; size];
        encode_frame(
            &mut wire,
            OpCode::Binary,
            &payload,
            true,
            false,
            Some([0x37, 0xfa, 0x21, 0x3d]),
        );
        let wire = wire.freeze();

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("masked", size), &wire, |b, wire| {
            b.iter(|| {
                let mut parser = FrameParser::new(1 << 20, true);
                let mut buf = BytesMut::from(wire.as_ref());
                let mut frames = 0u32;
                parser
                    .feed(&mut buf, &mut |ev| {
                        if matches!(ev, FrameEvent::Complete) {
                            frames += 1;
                        }
                        Ok(())
                    })
                    .unwrap();
                black_box(frames)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mask, bench_encode, bench_parse);
criterion_main!(benches);
