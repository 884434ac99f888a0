//! Benchmarks for TCP length-prefix framing, the hot path on every
//! connection's read side.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnsreplay::replay::tcp::{frame, Framer};

fn whole_messages_buffer(payload_len: usize, count: usize) -> Vec<u8> {
    let payload = vec![0xABu8; payload_len];
    let framed = frame(&payload);
    let mut buf = Vec::with_capacity(framed.len() * count);
    for _ in 0..count {
        buf.extend_from_slice(&framed);
    }
    buf
}

fn bench_feed_whole_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("Framer::feed whole messages");

    for &payload_len in &[12usize, 64, 512, 4096] {
        let buf = whole_messages_buffer(payload_len, 64);
        group.throughput(Throughput::Bytes(buf.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            &buf,
            |b, buf| {
                b.iter(|| {
                    let mut framer = Framer::new();
                    let out = framer.feed(black_box(buf));
                    black_box(out)
                });
            },
        );
    }

    group.finish();
}

fn bench_feed_byte_at_a_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Framer::feed one byte at a time");

    let buf = whole_messages_buffer(64, 8);
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("64B payloads x8", |b| {
        b.iter(|| {
            let mut framer = Framer::new();
            let mut out = Vec::new();
            for byte in &buf {
                out.extend(framer.feed(black_box(std::slice::from_ref(byte))));
            }
            black_box(out)
        });
    });

    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    for &payload_len in &[12usize, 64, 512, 4096] {
        let payload = vec![0xCDu8; payload_len];
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            &payload,
            |b, payload| {
                b.iter(|| black_box(frame(black_box(payload))));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_feed_whole_messages,
    bench_feed_byte_at_a_time,
    bench_frame
);
criterion_main!(benches);
