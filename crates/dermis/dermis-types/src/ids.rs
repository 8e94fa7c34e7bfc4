#![forbid(unsafe_code)]

// Ids are plain indices into fixed-capacity arenas. They stay valid for the
// whole life of the engine: a paused or revived device keeps the ids it was
// handed at registration, so callers may cache them indefinitely.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a sensor layer (one data source with its own buffer ring).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LayerId(pub u16);

/// Index of a registered device (backend). A device owns one or more layers.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

/// Index of a service slot.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ServiceId(pub u16);

/// Index of a sensor inside its layer.
pub type SensorId = u16;

/// Raw reading of one sensor.
pub type SensorResponse = u16;

/// Largest reading a sensor can report.
pub const SENSOR_RESPONSE_MAX: SensorResponse = u16::MAX;

/// Largest number of buffers a layer may rotate through.
pub const MAX_BUFFERS: usize = 8;

/// Id spaces are `u16`; the last value is reserved as "invalid".
pub const ID_SPACE: u64 = u16::MAX as u64;

macro_rules! impl_index {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

impl_index!(LayerId, "layer#");
impl_index!(DeviceId, "device#");
impl_index!(ServiceId, "service#");
