use crate::time::{as_ns, now_ns};
use std::time::Duration;

/// Release clock of a periodic task.
///
/// Release points are kept on the absolute monotonic timeline so a cycle that
/// runs long eats into its own slack instead of shifting every later release.
/// When a task falls more than one whole period behind, the missed releases
/// are skipped rather than replayed back to back.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    period_ns: u64,
    next_ns: u64,
}

impl PeriodicTimer {
    /// First release one period from now.
    pub fn new(period: Duration) -> Self {
        let period_ns = as_ns(period).max(1);
        Self {
            period_ns,
            next_ns: now_ns() + period_ns,
        }
    }

    /// First release on a period boundary at least two periods ahead,
    /// shifted by `offset`.
    ///
    /// Staggering the writers of different layers by a fraction of their
    /// period keeps them from all waking in the same instant.
    pub fn aligned(period: Duration, offset: Duration) -> Self {
        let period_ns = as_ns(period).max(1);
        let start = now_ns() + 2 * period_ns;
        Self {
            period_ns,
            next_ns: start - start % period_ns + as_ns(offset) % period_ns,
        }
    }

    #[inline]
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }

    /// Absolute monotonic time of the next release, in nanoseconds.
    #[inline]
    pub fn next_release_ns(&self) -> u64 {
        self.next_ns
    }

    #[inline]
    pub fn time_left(&self) -> Duration {
        Duration::from_nanos(self.next_ns.saturating_sub(now_ns()))
    }

    /// Sleep until the next release and advance by one period.
    pub fn wait_period(&mut self) {
        let now = now_ns();
        if now < self.next_ns {
            std::thread::sleep(Duration::from_nanos(self.next_ns - now));
        }
        self.advance(now_ns());
    }

    fn advance(&mut self, now: u64) {
        self.next_ns += self.period_ns;
        if now >= self.next_ns + self.period_ns {
            let behind = (now - self.next_ns) / self.period_ns;
            self.next_ns += behind * self.period_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_start_lands_on_boundary_plus_offset() {
        let period = Duration::from_millis(10);
        let t = PeriodicTimer::aligned(period, Duration::from_millis(3));
        assert_eq!(t.next_release_ns() % 10_000_000, 3_000_000);
        assert!(t.next_release_ns() > now_ns());
    }

    #[test]
    fn waits_roughly_one_period() {
        let mut t = PeriodicTimer::new(Duration::from_millis(5));
        let start = now_ns();
        t.wait_period();
        t.wait_period();
        let elapsed = now_ns() - start;
        assert!(elapsed >= 10_000_000, "elapsed {elapsed}");
    }

    #[test]
    fn skips_missed_releases() {
        let mut t = PeriodicTimer::new(Duration::from_millis(1));
        let first = t.next_release_ns();
        t.advance(first + 10_500_000);
        assert!(t.next_release_ns() + 1_000_000 > first + 10_500_000);
        assert!(t.next_release_ns() <= first + 10_500_000);
        assert_eq!((t.next_release_ns() - first) % 1_000_000, 0);
    }
}
