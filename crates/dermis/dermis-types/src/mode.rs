use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling discipline of a reader (delivery task) or a service task.
///
/// Writers are always periodic at their layer's acquisition rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Wake every `period`. Never faster than the layer's own rate.
    Periodic {
        #[serde(with = "millis")]
        period: Duration,
    },
    /// Run once per request posted on the task's request/response gate.
    Sporadic,
    /// Periodic at the layer's native period.
    Asap,
}

impl AcquisitionMode {
    pub fn is_sporadic(&self) -> bool {
        matches!(self, AcquisitionMode::Sporadic)
    }

    /// Period the task actually runs with, given the layer's native period.
    ///
    /// Sporadic tasks still get the native period: it bounds how long they
    /// wait for the slot being written.
    pub fn effective_period(&self, native: Duration) -> Duration {
        match *self {
            AcquisitionMode::Periodic { period } => period.max(native),
            AcquisitionMode::Sporadic | AcquisitionMode::Asap => native,
        }
    }
}

/// Native period of a layer acquiring at `rate_hz`.
#[inline]
pub fn period_of(rate_hz: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(rate_hz.max(1)))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
