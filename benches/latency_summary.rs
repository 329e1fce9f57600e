use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pubsub_perftest::message::TestMessage;
use pubsub_perftest::metrics::LatencyStats;

fn summarize(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency_summary");
    for samples in [1_000usize, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(samples), &samples, |b, &samples| {
            b.iter(|| {
                let mut stats = LatencyStats::with_capacity(samples).unwrap();
                // Pseudo-random spread so the sort has work to do.
                for i in 0..samples as u64 {
                    stats.record((i * 7919) % 1_000 + 20).unwrap();
                }
                black_box(stats.summarize(72, None))
            })
        });
    }
    group.finish();
}

fn codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");
    for size in [32i32, 1024, 63_000] {
        let message = TestMessage::with_payload(0, size);
        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| black_box(message.to_bytes().unwrap()))
        });
        let bytes = message.to_bytes().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(TestMessage::from_bytes(bytes).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, summarize, codec);
criterion_main!(benches);
