//! Per-layer buffer ring: B slots of sensor responses in one shared region,
//! each guarded by its own named rw-lock.

use crate::registry::{RegistryError, ResourceRegistry};
use crate::shm_layout::{LAYER_MAGIC, LAYER_VERSION, LayerHeader, bytes_for_layer};
use dermis_mmap::SharedMap;
use dermis_rt::TimedRwLock;
use dermis_types::{LayerId, MAX_BUFFERS, SensorResponse};
use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Shape of one layer's ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub buffer_count: usize,
    pub sensor_count: usize,
    /// Hz; the writer's period is derived from it.
    pub acquisition_rate: u32,
}

impl RingConfig {
    /// # Panics
    /// Panics if `buffer_count` is outside `1..=MAX_BUFFERS`, or if there are
    /// no sensors or the rate is zero. Callers clamp these beforehand.
    pub fn new(buffer_count: usize, sensor_count: usize, acquisition_rate: u32) -> Self {
        assert!(
            (1..=MAX_BUFFERS).contains(&buffer_count),
            "buffer count must be in 1..=MAX_BUFFERS"
        );
        assert!(sensor_count > 0, "layer must have sensors");
        assert!(acquisition_rate > 0, "acquisition rate must be positive");
        Self {
            buffer_count,
            sensor_count,
            acquisition_rate,
        }
    }

    #[inline]
    pub fn period(&self) -> Duration {
        dermis_types::period_of(self.acquisition_rate)
    }
}

const NAME_CHARS: &[u8; 38] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_$";

/// Character for a small index: digits, then `A..Z`, then `_` and `$`.
#[inline]
pub fn name_char(i: usize) -> char {
    NAME_CHARS[i % NAME_CHARS.len()] as char
}

fn encode_index(mut n: usize, out: &mut String) {
    let mut digits = Vec::new();
    loop {
        digits.push(name_char(n));
        n /= NAME_CHARS.len();
        if n == 0 {
            break;
        }
    }
    out.extend(digits.into_iter().rev());
}

/// Prefix of every name the engine reserves in the registry.
pub const NAME_PREFIX: &str = "SKN";

/// Name of the shared region of `layer`.
pub fn layer_region_name(layer: LayerId) -> String {
    let mut s = String::from("SKND");
    encode_index(layer.index(), &mut s);
    s
}

/// Name of the rw-lock of `slot` in `layer`: `SKNL<layer><slot>`.
pub fn slot_lock_name(layer: LayerId, slot: usize) -> String {
    let mut s = String::from("SKNL");
    encode_index(layer.index(), &mut s);
    s.push(name_char(slot));
    s
}

/// One layer's ring as seen by any participant.
///
/// Each handle holds one registry reference to the region and to every slot
/// lock, released on drop; whichever handle drops last tears the ring down.
pub struct LayerRing {
    layer: LayerId,
    registry: Arc<dyn ResourceRegistry>,
    region: Arc<SharedMap>,
    region_name: String,
    locks: Vec<Arc<TimedRwLock>>,
    lock_names: Vec<String>,
    buffer_count: usize,
    sensor_count: usize,
}

impl LayerRing {
    /// Allocate the region and slot locks of `layer` and initialize the header.
    ///
    /// Single-buffer layers get no locks. On failure everything allocated so
    /// far is freed again.
    pub fn create(
        registry: &Arc<dyn ResourceRegistry>,
        layer: LayerId,
        cfg: RingConfig,
    ) -> Result<Self, RegistryError> {
        let region_name = layer_region_name(layer);
        let region = registry.alloc(
            &region_name,
            bytes_for_layer(cfg.buffer_count, cfg.sensor_count),
        )?;

        // SAFETY: the region was just allocated for us and is large enough for
        // the header; nobody else can have attached yet.
        unsafe {
            ptr::write(
                region.as_ptr() as *mut LayerHeader,
                LayerHeader {
                    magic: LAYER_MAGIC,
                    version: LAYER_VERSION,
                    buffer_count: cfg.buffer_count as u32,
                    sensor_count: cfg.sensor_count as u32,
                    acquisition_rate: cfg.acquisition_rate,
                    last_written: AtomicU32::new(0),
                    being_written: AtomicU32::new(0),
                    paused: AtomicU32::new(1),
                    next_predicted_swap: AtomicU64::new(0),
                    write_time: std::array::from_fn(|_| AtomicU64::new(0)),
                },
            );
        }

        let mut ring = Self {
            layer,
            registry: Arc::clone(registry),
            region,
            region_name,
            locks: Vec::new(),
            lock_names: Vec::new(),
            buffer_count: cfg.buffer_count,
            sensor_count: cfg.sensor_count,
        };
        if cfg.buffer_count > 1 {
            for slot in 0..cfg.buffer_count {
                let name = slot_lock_name(layer, slot);
                // On error `ring` drops and frees what was allocated.
                let lock = registry.alloc_rwlock(&name)?;
                ring.locks.push(lock);
                ring.lock_names.push(name);
            }
        }
        Ok(ring)
    }

    /// Attach to a ring created elsewhere, validating its header.
    pub fn attach(registry: &Arc<dyn ResourceRegistry>, layer: LayerId) -> Result<Self, RegistryError> {
        let region_name = layer_region_name(layer);
        let region = registry.attach(&region_name)?;
        let mut ring = Self {
            layer,
            registry: Arc::clone(registry),
            region,
            region_name,
            locks: Vec::new(),
            lock_names: Vec::new(),
            buffer_count: 0,
            sensor_count: 0,
        };

        let h = ring.header();
        h.validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let (buffer_count, sensor_count) = (h.buffer_count as usize, h.sensor_count as usize);
        if ring.region.len() < bytes_for_layer(buffer_count, sensor_count) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Region too small").into());
        }
        ring.buffer_count = buffer_count;
        ring.sensor_count = sensor_count;

        if buffer_count > 1 {
            for slot in 0..buffer_count {
                let name = slot_lock_name(layer, slot);
                let lock = registry.attach_rwlock(&name)?;
                ring.locks.push(lock);
                ring.lock_names.push(name);
            }
        }
        Ok(ring)
    }

    #[inline]
    pub fn layer(&self) -> LayerId {
        self.layer
    }

    #[inline(always)]
    pub fn header(&self) -> &LayerHeader {
        // SAFETY: the region starts with a header initialized by `create` and
        // lives as long as `self`. All mutable fields are atomics.
        unsafe { &*(self.region.as_ptr() as *const LayerHeader) }
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[inline]
    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    #[inline]
    pub fn is_single_buffer(&self) -> bool {
        self.buffer_count == 1
    }

    pub fn period(&self) -> Duration {
        dermis_types::period_of(self.header().acquisition_rate)
    }

    /// Lock of `slot`; `None` for single-buffer layers.
    #[inline]
    pub fn lock(&self, slot: usize) -> Option<&Arc<TimedRwLock>> {
        self.locks.get(slot)
    }

    /// Responses of `slot`.
    ///
    /// # Panics
    /// Panics if `slot >= buffer_count`.
    #[inline(always)]
    pub fn slot(&self, slot: usize) -> &[AtomicU16] {
        assert!(slot < self.buffer_count, "slot index out of range");
        // SAFETY: `attach`/`create` checked that the region holds
        // `buffer_count * sensor_count` responses after the header; AtomicU16
        // has the alignment of u16 and the header size is a multiple of 8.
        unsafe {
            let base = self.region.as_ptr().add(size_of::<LayerHeader>()) as *const AtomicU16;
            std::slice::from_raw_parts(base.add(slot * self.sensor_count), self.sensor_count)
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.header()
            .paused
            .store(paused as u32, Ordering::Release);
    }

    /// Copy of a slot's responses.
    pub fn snapshot(&self, slot: usize) -> Vec<SensorResponse> {
        self.slot(slot)
            .iter()
            .map(|r| r.load(Ordering::Relaxed))
            .collect()
    }
}

impl Drop for LayerRing {
    fn drop(&mut self) {
        for name in &self.lock_names {
            self.registry.free(name);
        }
        self.registry.free(&self.region_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcessRegistry;

    fn registry() -> Arc<dyn ResourceRegistry> {
        ProcessRegistry::new()
    }

    #[test]
    fn names_follow_the_slot_scheme() {
        assert_eq!(slot_lock_name(LayerId(0), 0), "SKNL00");
        assert_eq!(slot_lock_name(LayerId(11), 2), "SKNLB2");
        assert_eq!(slot_lock_name(LayerId(37), 7), "SKNL$7");
        assert_eq!(slot_lock_name(LayerId(38), 1), "SKNL101");
        assert_eq!(layer_region_name(LayerId(40)), "SKND12");
    }

    #[test]
    #[should_panic]
    fn config_rejects_zero_buffers() {
        RingConfig::new(0, 1, 1);
    }

    #[test]
    fn create_then_attach_sees_same_slots() {
        let reg = registry();
        let ring = LayerRing::create(&reg, LayerId(2), RingConfig::new(3, 4, 100)).unwrap();
        assert!(ring.header().is_paused());
        ring.slot(1)[3].store(77, Ordering::Relaxed);

        let other = LayerRing::attach(&reg, LayerId(2)).unwrap();
        assert_eq!(other.buffer_count(), 3);
        assert_eq!(other.sensor_count(), 4);
        assert_eq!(other.snapshot(1), vec![0, 0, 0, 77]);
        assert_eq!(other.period(), Duration::from_millis(10));
        assert!(Arc::ptr_eq(ring.lock(0).unwrap(), other.lock(0).unwrap()));
    }

    #[test]
    fn single_buffer_rings_have_no_locks() {
        let reg = registry();
        let ring = LayerRing::create(&reg, LayerId(0), RingConfig::new(1, 2, 10)).unwrap();
        assert!(ring.is_single_buffer());
        assert!(ring.lock(0).is_none());
        assert!(reg.name_available(&slot_lock_name(LayerId(0), 0)));
    }

    #[test]
    fn last_handle_releases_every_name() {
        let reg = registry();
        let ring = LayerRing::create(&reg, LayerId(5), RingConfig::new(2, 1, 10)).unwrap();
        let attached = LayerRing::attach(&reg, LayerId(5)).unwrap();
        drop(ring);
        assert!(!reg.name_available(&layer_region_name(LayerId(5))));
        drop(attached);
        assert!(reg.names_with_prefix(NAME_PREFIX).is_empty());
    }

    #[test]
    fn failed_create_rolls_back() {
        let reg = registry();
        let _squatter = reg.alloc_rwlock(&slot_lock_name(LayerId(1), 1)).unwrap();
        let err = LayerRing::create(&reg, LayerId(1), RingConfig::new(3, 1, 10));
        assert!(matches!(err, Err(RegistryError::Busy(_))));
        assert!(reg.name_available(&layer_region_name(LayerId(1))));
        assert!(reg.name_available(&slot_lock_name(LayerId(1), 0)));
    }

    #[test]
    fn attach_to_missing_layer_fails() {
        let reg = registry();
        assert!(matches!(
            LayerRing::attach(&reg, LayerId(9)),
            Err(RegistryError::Absent(_))
        ));
    }
}
