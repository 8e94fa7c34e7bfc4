//! Shared memory layout of one layer's buffer ring.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        LayerHeader                             │
//! │  magic, version, buffer_count, sensor_count, acquisition_rate  │
//! │  last_written, being_written, paused (atomic u32)              │
//! │  next_predicted_swap (atomic u64)                              │
//! │  write_time[MAX_BUFFERS] (atomic u64)                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │  slot 0: sensor_count × AtomicU16                              │
//! ├────────────────────────────────────────────────────────────────┤
//! │  slot 1                                                        │
//! ├────────────────────────────────────────────────────────────────┤
//! │                          ...                                   │
//! ├────────────────────────────────────────────────────────────────┤
//! │  slot buffer_count-1                                           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Responses are stored as atomics so that single-buffer layers, which are
//! read without any lock, never race at the language level; a reader there
//! may still observe a frame that is only partly written.

use dermis_types::MAX_BUFFERS;
use std::mem::size_of;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

/// ASCII "DERMISLY".
pub const LAYER_MAGIC: u64 = 0x4445_524D_4953_4C59;

/// Bumped on incompatible layout changes; attach rejects a mismatch.
pub const LAYER_VERSION: u64 = 1;

#[repr(C)]
pub struct LayerHeader {
    pub magic: u64,
    pub version: u64,
    pub buffer_count: u32,
    pub sensor_count: u32,
    pub acquisition_rate: u32,

    /// Slot the writer most recently published.
    pub last_written: AtomicU32,
    /// Slot the writer currently holds.
    pub being_written: AtomicU32,
    /// Nonzero while the layer's writer is paused.
    pub paused: AtomicU32,

    /// Monotonic ns at which the writer is next expected to swap.
    pub next_predicted_swap: AtomicU64,

    /// Monotonic ns at which each slot was last published; 0 means never.
    pub write_time: [AtomicU64; MAX_BUFFERS],
}

impl LayerHeader {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != LAYER_MAGIC {
            return Err("Bad magic");
        }
        if self.version != LAYER_VERSION {
            return Err("Wrong version");
        }
        if self.buffer_count == 0 || self.buffer_count as usize > MAX_BUFFERS {
            return Err("Buffer count out of range");
        }
        if self.sensor_count == 0 {
            return Err("Layer has no sensors");
        }
        Ok(())
    }

    #[inline]
    pub fn last_written(&self) -> usize {
        self.last_written.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn being_written(&self) -> usize {
        self.being_written.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn write_time(&self, slot: usize) -> u64 {
        self.write_time[slot].load(Ordering::Acquire)
    }

    #[inline]
    pub fn next_predicted_swap(&self) -> u64 {
        self.next_predicted_swap.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) != 0
    }
}

/// Total bytes of a layer region.
pub fn bytes_for_layer(buffer_count: usize, sensor_count: usize) -> usize {
    size_of::<LayerHeader>() + buffer_count * sensor_count * size_of::<AtomicU16>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_an_aligned_header() {
        assert_eq!(size_of::<LayerHeader>() % 8, 0);
        assert_eq!(
            bytes_for_layer(3, 10),
            size_of::<LayerHeader>() + 3 * 10 * 2
        );
    }

    #[test]
    fn magic_spells_the_tag() {
        assert_eq!(&LAYER_MAGIC.to_be_bytes(), b"DERMISLY");
    }
}
