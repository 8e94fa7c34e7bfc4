use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dermis_rt::{Semaphore, TimedRwLock, now_ns};
use std::time::{Duration, Instant};

fn bench_clock(c: &mut Criterion) {
    c.bench_function("now_ns", |b| {
        b.iter(|| black_box(now_ns()));
    });
    c.bench_function("Instant::now", |b| {
        b.iter(|| black_box(Instant::now()));
    });
}

fn bench_rwlock(c: &mut Criterion) {
    let lock = TimedRwLock::new("bench");
    c.bench_function("rwlock try_read + release", |b| {
        b.iter(|| black_box(lock.try_read().is_ok()));
    });
    c.bench_function("rwlock write_for + release (uncontended)", |b| {
        b.iter(|| black_box(lock.write_for(Duration::from_millis(1)).is_ok()));
    });
}

fn bench_semaphore(c: &mut Criterion) {
    let sem = Semaphore::new("bench", 0);
    c.bench_function("semaphore post + try_wait", |b| {
        b.iter(|| {
            sem.post();
            black_box(sem.try_wait().is_ok())
        });
    });
}

criterion_group!(benches, bench_clock, bench_rwlock, bench_semaphore);
criterion_main!(benches);
