//! Monotonic nanosecond clock shared by writers and readers.
//!
//! Write timestamps and predicted swap times are stored in shared memory as
//! raw `u64` nanoseconds, so every participant must read the same clock.
//! `CLOCK_MONOTONIC` is system wide, which keeps the values comparable across
//! processes too.

use std::time::Duration;

/// Nanoseconds on the system monotonic clock.
#[cfg(unix)]
#[inline(always)]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; CLOCK_MONOTONIC is always supported.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
#[inline(always)]
pub fn now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[inline]
pub fn as_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

/// Running execution-time statistics of one task.
///
/// `best` starts at `u64::MAX` so the first sample always replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeStats {
    pub count: u64,
    pub worst_ns: u64,
    pub best_ns: u64,
    pub accumulated_ns: u64,
}

impl Default for TimeStats {
    fn default() -> Self {
        Self {
            count: 0,
            worst_ns: 0,
            best_ns: u64::MAX,
            accumulated_ns: 0,
        }
    }
}

impl TimeStats {
    #[inline]
    pub fn record(&mut self, sample_ns: u64) {
        self.count += 1;
        self.worst_ns = self.worst_ns.max(sample_ns);
        self.best_ns = self.best_ns.min(sample_ns);
        self.accumulated_ns = self.accumulated_ns.saturating_add(sample_ns);
    }

    pub fn average_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.accumulated_ns / self.count
        }
    }
}
