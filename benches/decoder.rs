//! Criterion benchmarks for the hot path: frame decoding, queue handoff and
//! store absorption.
//!
//! Run with: cargo bench --bench decoder

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pulse_link::acquisition::{IngestionQueue, Sample};
use pulse_link::protocol::{encode_frame, FrameDecoder, LineDecoder, SampleDecoder};
use pulse_link::sim::generate_records;
use pulse_link::storage::SessionStore;

const FRAME_COUNTS: &[usize] = &[64, 1024, 16384];

fn frame_stream(count: usize) -> Vec<u8> {
    (0..count as u32)
        .flat_map(|i| encode_frame(i.wrapping_mul(2_654_435_761)))
        .collect()
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("FrameDecoder");

    for &count in FRAME_COUNTS {
        let stream = frame_stream(count);
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole", count), &stream, |b, stream| {
            let mut decoder = FrameDecoder::new();
            b.iter(|| {
                let mut buf = BytesMut::from(&stream[..]);
                black_box(decoder.decode(&mut buf));
            });
        });

        // Serial reads rarely line up with frames
        group.bench_with_input(BenchmarkId::new("chunked_61", count), &stream, |b, stream| {
            let mut decoder = FrameDecoder::new();
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(128);
                let mut total = 0;
                for chunk in stream.chunks(61) {
                    buf.extend_from_slice(chunk);
                    total += decoder.decode(&mut buf).len();
                }
                black_box(total);
            });
        });
    }

    group.finish();
}

fn bench_lines(c: &mut Criterion) {
    let text: String = generate_records(1024, 1)
        .iter()
        .map(|r| format!("{}\n", r.to_line()))
        .collect();

    let mut group = c.benchmark_group("LineDecoder");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("1024_lines", |b| {
        b.iter(|| {
            let mut decoder = LineDecoder::new();
            let mut buf = BytesMut::from(text.as_bytes());
            black_box(decoder.decode_values(&mut buf));
        });
    });
    group.finish();
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("Handoff");

    for &count in FRAME_COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_drain_absorb", count), &count, |b, &count| {
            let queue = IngestionQueue::unbounded(usize::MAX);
            b.iter(|| {
                let mut store = SessionStore::new(1000);
                for i in 0..count as u64 {
                    queue.enqueue(Sample::new(i, i as f64));
                }
                black_box(store.absorb(queue.drain_all()));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frames, bench_lines, bench_handoff);
criterion_main!(benches);
