//! Helpers shared by the perf report binary and the criterion benches.

use dermis_icc::{LayerRing, ProcessRegistry, RegistryError, ResourceRegistry, RingConfig};
use dermis_types::LayerId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Nearest-rank percentiles of a sample set, in the samples' unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    pub count: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}

impl Percentiles {
    /// `None` for an empty set. Sorts `samples` in place.
    pub fn of(samples: &mut [u64]) -> Option<Self> {
        samples.sort_unstable();
        let (&min, &max) = (samples.first()?, samples.last()?);
        let at = |pct: usize| samples[(samples.len() - 1) * pct / 100];
        let total: u128 = samples.iter().map(|&s| u128::from(s)).sum();
        Some(Self {
            count: samples.len(),
            min,
            p50: at(50),
            p90: at(90),
            p99: at(99),
            max,
            mean: total as f64 / samples.len() as f64,
        })
    }
}

/// One named row of the report.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub name: String,
    pub unit: &'static str,
    pub stats: Percentiles,
}

impl Measurement {
    pub fn print(&self) {
        let s = &self.stats;
        println!(
            "  {:<32} p50 {:>8}  p90 {:>8}  p99 {:>8}  max {:>9}  {}",
            self.name, s.p50, s.p90, s.p99, s.max, self.unit
        );
    }
}

/// Time `rounds` rounds of `calls` calls to `f`; one extra round warms up.
/// Each sample is the mean ns per call of its round.
pub fn time_per_call(name: &str, rounds: usize, calls: usize, mut f: impl FnMut()) -> Option<Measurement> {
    let calls = calls.max(1);
    let mut samples = Vec::with_capacity(rounds);
    for round in 0..=rounds {
        let t0 = Instant::now();
        (0..calls).for_each(|_| f());
        if round > 0 {
            samples.push((t0.elapsed().as_nanos() / calls as u128) as u64);
        }
    }
    Some(Measurement {
        name: name.to_owned(),
        unit: "ns/call",
        stats: Percentiles::of(&mut samples)?,
    })
}

/// Contention counters of one writer/reader pair on a ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingCounters {
    /// Swaps the writer could not make in time.
    pub swap_skips: u64,
    /// Non-blocking reader locks lost to a concurrent swap.
    pub retries: u64,
    /// Reads that found only an older frame.
    pub stale: u64,
    /// Reader swap-protection estimate at the end of the run.
    pub protection_ns: u64,
}

impl RingCounters {
    pub fn print(&self) {
        println!(
            "  swap skips {}   retries {}   stale {}   protection {} ns",
            self.swap_skips, self.retries, self.stale, self.protection_ns
        );
    }
}

/// A fresh in-process ring for layer 0, not paused.
pub fn make_ring(buffers: usize, sensors: usize, rate_hz: u32) -> Result<Arc<LayerRing>, RegistryError> {
    let registry: Arc<dyn ResourceRegistry> = ProcessRegistry::new();
    let ring = LayerRing::create(&registry, LayerId(0), RingConfig::new(buffers, sensors, rate_hz))?;
    ring.set_paused(false);
    Ok(Arc::new(ring))
}

pub fn section(title: &str) {
    println!("\n== {title}");
}
