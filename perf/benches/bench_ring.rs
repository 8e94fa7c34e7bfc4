use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dermis_icc::{RingReader, RingWriter};
use dermis_perf::make_ring;
use dermis_rt::now_ns;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_millis(10);

fn bench_fill_and_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for sensors in [64usize, 1024, 8192] {
        let ring = make_ring(3, sensors, 1000).expect("failed to create ring");
        let period = ring.period();
        let mut writer = RingWriter::new(ring, WAIT).expect("failed to lock first slot");
        let values: Vec<u16> = (0..sensors as u16).collect();

        group.throughput(Throughput::Elements(sensors as u64));
        group.bench_with_input(BenchmarkId::new("fill_and_swap", sensors), &sensors, |b, _| {
            b.iter(|| {
                writer.slot().write_all(black_box(&values));
                writer.swap(now_ns() + 1_000_000, period)
            });
        });
    }
    group.finish();
}

fn bench_read_fresh_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for buffers in [2usize, 3, 8] {
        let ring = make_ring(buffers, 256, 1000).expect("failed to create ring");
        let period = ring.period();
        let mut writer = RingWriter::new(Arc::clone(&ring), WAIT).expect("failed to lock first slot");
        let mut reader = RingReader::new(ring);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("read_fresh", buffers), &buffers, |b, _| {
            // Only the read is timed; the writer publishes a new frame before each.
            b.iter_custom(|iters| {
                let mut spent = Duration::ZERO;
                for i in 0..iters {
                    writer.slot().set(0, i as u16);
                    writer.swap(now_ns() + 1_000_000, period);
                    let start = Instant::now();
                    let status = reader.read(WAIT, || true, || {}, |f| {
                        black_box(f.get(0));
                    });
                    spent += start.elapsed();
                    let _ = black_box(status);
                }
                spent
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fill_and_swap, bench_read_fresh_frame);
criterion_main!(benches);
