use std::time::Duration;

/// Writer-side seed: large, so readers are conservative until real fill
/// times come in.
pub const WRITE_ESTIMATE_SEED: Duration = Duration::from_secs(2);

/// Reader-side seed for the swap-protection time.
pub const PROTECTION_SEED: Duration = Duration::from_micros(1);

/// Exponentially weighted duration estimate, `e = (7e + sample) / 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapPredictor {
    estimate_ns: u64,
}

impl SwapPredictor {
    pub fn new(seed: Duration) -> Self {
        Self {
            estimate_ns: dermis_rt::as_ns(seed),
        }
    }

    pub fn for_writer() -> Self {
        Self::new(WRITE_ESTIMATE_SEED)
    }

    pub fn for_reader() -> Self {
        Self::new(PROTECTION_SEED)
    }

    #[inline]
    pub fn estimate_ns(&self) -> u64 {
        self.estimate_ns
    }

    #[inline]
    pub fn update(&mut self, sample_ns: u64) {
        self.estimate_ns = ((self.estimate_ns as u128 * 7 + sample_ns as u128) >> 3) as u64;
    }

    /// Feed only samples above the current estimate, so it can only grow.
    #[inline]
    pub fn update_if_larger(&mut self, sample_ns: u64) {
        if sample_ns > self.estimate_ns {
            self.update(sample_ns);
        }
    }
}
