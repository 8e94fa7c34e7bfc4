use std::hint::black_box;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use dermis_icc::{LayerRing, ReadStatus, RingReader, RingWriter};
use dermis_perf::{Measurement, Percentiles, RingCounters, make_ring, section, time_per_call};
use dermis_rt::{PeriodicTimer, Semaphore, TimedRwLock, now_ns};
use serde::Serialize;

const WAIT: Duration = Duration::from_millis(10);
const DELIVERY_SAMPLES: usize = 2_000;

#[derive(Debug, Default, Serialize)]
struct Report {
    measurements: Vec<Measurement>,
    /// Writer swap skips per sensor count of the single-thread hot path.
    fill_and_swap_skips: Vec<(usize, u64)>,
    delivery: Option<Percentiles>,
    delivery_counters: RingCounters,
}

impl Report {
    fn push(&mut self, m: Option<Measurement>) {
        if let Some(m) = m {
            m.print();
            self.measurements.push(m);
        }
    }
}

fn main() {
    println!("dermis perf report");
    let mut report = Report::default();
    primitives(&mut report);
    ring_hot_path(&mut report);
    delivery(&mut report);
    save(&report);
}

fn primitives(report: &mut Report) {
    section("sync primitives");
    report.push(time_per_call("now_ns", 1_000, 1_000, || {
        black_box(now_ns());
    }));

    let lock = TimedRwLock::new("report");
    report.push(time_per_call("rwlock try_read + release", 1_000, 1_000, || {
        black_box(lock.try_read().is_ok());
    }));

    let sem = Semaphore::new("report", 0);
    report.push(time_per_call("semaphore post + try_wait", 1_000, 1_000, || {
        sem.post();
        black_box(sem.try_wait().is_ok());
    }));
}

fn ring_hot_path(report: &mut Report) {
    section("fill and swap, single thread");
    for sensors in [64usize, 1024, 8192] {
        let Some(ring) = ring_or_report(3, sensors, 1000) else {
            continue;
        };
        let period = ring.period();
        let Ok(mut writer) = RingWriter::new(ring, WAIT) else {
            println!("  could not lock the first slot; skipped");
            continue;
        };
        let values: Vec<u16> = (0..sensors).map(|i| i as u16).collect();
        report.push(time_per_call(&format!("fill_and_swap/{sensors}"), 500, 100, || {
            writer.slot().write_all(&values);
            black_box(writer.swap(now_ns() + 1_000_000, period));
        }));
        report.fill_and_swap_skips.push((sensors, writer.swap_skips()));
    }
}

fn delivery(report: &mut Report) {
    section("writer at 1 kHz, one reader, 3 slots, 256 sensors");
    let Some(ring) = ring_or_report(3, 256, 1000) else {
        return;
    };
    let stop = Arc::new(AtomicBool::new(false));
    let writer = spawn_writer(Arc::clone(&ring), Arc::clone(&stop));

    let mut counters = RingCounters::default();
    let mut reader = RingReader::new(ring);
    let mut ages = Vec::with_capacity(DELIVERY_SAMPLES);
    let mut last = 0;
    while ages.len() < DELIVERY_SAMPLES {
        let mut ts = 0;
        let status = reader.read(WAIT, || false, || counters.retries += 1, |f| ts = f.timestamp_ns());
        match status {
            Ok(ReadStatus::Delivered) if ts > last => {
                ages.push(now_ns().saturating_sub(ts));
                last = ts;
            }
            Ok(ReadStatus::Stale) => counters.stale += 1,
            Ok(_) => {}
            Err(e) => {
                println!("  reader failed: {e}");
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
    counters.swap_skips = writer.join().unwrap_or(0);
    counters.protection_ns = reader.protection_ns();

    report.delivery = Percentiles::of(&mut ages);
    if let Some(stats) = report.delivery {
        Measurement {
            name: "frame age at delivery".into(),
            unit: "ns",
            stats,
        }
        .print();
    }
    counters.print();
    report.delivery_counters = counters;
}

fn ring_or_report(buffers: usize, sensors: usize, rate: u32) -> Option<Arc<LayerRing>> {
    make_ring(buffers, sensors, rate)
        .inspect_err(|e| println!("  ring creation failed: {e}"))
        .ok()
}

/// Periodic writer stamping the frame number into every sensor until `stop`.
/// Returns the writer's swap skips.
fn spawn_writer(ring: Arc<LayerRing>, stop: Arc<AtomicBool>) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let period = ring.period();
        let Ok(mut w) = RingWriter::new(Arc::clone(&ring), period) else {
            return 0;
        };
        let mut timer = PeriodicTimer::new(period);
        let mut frame: u16 = 0;
        while !stop.load(Ordering::Relaxed) {
            w.last_chance_swap();
            let t0 = now_ns();
            frame = frame.wrapping_add(1);
            for i in 0..ring.sensor_count() {
                w.slot().set(i, frame);
            }
            w.record_fill(Duration::from_nanos(now_ns() - t0));
            w.swap(timer.next_release_ns(), period);
            timer.wait_period();
        }
        w.swap_skips()
    })
}

fn save(report: &Report) {
    let out = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("target")
        .join("perf_report.json");
    let written = serde_json::to_vec_pretty(report)
        .map_err(std::io::Error::other)
        .and_then(|bytes| std::fs::write(&out, bytes));
    match written {
        Ok(()) => println!("\nresults written to {}", out.display()),
        Err(e) => println!("\ncould not write {}: {e}", out.display()),
    }
}
