//! Device drivers and the bookkeeping the engine keeps per device.

use dermis_icc::SlotWriter;
use dermis_types::{DeviceId, Result, SensorId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// What a driver reports about one of its layers while structures are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDetails {
    pub name: String,
    pub sensor_count: u32,
    pub module_count: u32,
    pub patch_count: u32,
    /// Hz. 0 is replaced by 1.
    pub acquisition_rate: u32,
    /// 0 picks the configured default; values above `MAX_BUFFERS` are capped.
    pub buffer_count: usize,
}

/// Acquisition of one layer, called once per writer cycle.
pub trait Fill: Send {
    /// Write the current frame into `slot`.
    ///
    /// `sensor_map[j]` is the driver's raw sensor index whose reading belongs
    /// at position `j`. The map changes when the sensors are regionalized.
    fn fill(&mut self, slot: &SlotWriter<'_>, sensor_map: &[SensorId]) -> Result<()>;
}

impl<F> Fill for F
where
    F: FnMut(&SlotWriter<'_>, &[SensorId]) -> Result<()> + Send,
{
    fn fill(&mut self, slot: &SlotWriter<'_>, sensor_map: &[SensorId]) -> Result<()> {
        self(slot, sensor_map)
    }
}

/// A hardware (or virtual) backend owning one or more layers.
pub trait DeviceDriver: Send + Sync {
    /// Details of the device's `layer`-th layer.
    fn details(&self, layer: usize) -> LayerDetails;

    /// Told `true` when the engine starts relying on the driver and `false`
    /// once it no longer does; a driver must not go away while busy.
    fn busy(&self, _busy: bool) {}

    /// A fresh acquisition callback for the device's `layer`-th layer.
    fn filler(&self, layer: usize) -> Box<dyn Fill>;
}

/// Registration request of a device.
///
/// The counts are totals over all layers of the device; a revival must
/// declare exactly the same ones.
#[derive(Clone)]
pub struct DeviceRegistration {
    pub name: String,
    pub layer_count: u32,
    pub sensor_count: u32,
    pub module_count: u32,
    pub patch_count: u32,
    pub driver: Arc<dyn DeviceDriver>,
}

impl DeviceRegistration {
    pub(crate) fn shape(&self) -> Shape {
        Shape {
            layers: self.layer_count,
            sensors: self.sensor_count,
            modules: self.module_count,
            patches: self.patch_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct Shape {
    pub layers: u32,
    pub sensors: u32,
    pub modules: u32,
    pub patches: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Registered, structures not built yet.
    Initializing,
    /// Structures built, writers created but never resumed.
    Initialized,
    Working,
    Paused,
    /// Rejected while building structures; never acquires.
    Bad,
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    pub id: DeviceId,
    /// A paused device came back under its old identity.
    pub revived: bool,
}

/// Per-device state shared with its writer tasks.
pub(crate) struct DeviceCell {
    pub id: DeviceId,
    pub name: String,
    /// The device mutex. Writers hold it while filling; revival swaps the
    /// driver under it.
    pub driver: Mutex<Arc<dyn DeviceDriver>>,
    busy: Mutex<u32>,
    bad_mark: AtomicBool,
}

impl DeviceCell {
    pub fn new(id: DeviceId, name: String, driver: Arc<dyn DeviceDriver>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            driver: Mutex::new(driver),
            busy: Mutex::new(0),
            bad_mark: AtomicBool::new(false),
        })
    }

    pub fn is_marked_bad(&self) -> bool {
        self.bad_mark.load(Ordering::Acquire)
    }

    pub fn set_bad_mark(&self, bad: bool) {
        self.bad_mark.store(bad, Ordering::Release);
    }

    pub fn busy_count(&self) -> u32 {
        *self.busy.lock()
    }
}

/// One in-flight use of a driver.
///
/// The first guard of a device calls `busy(true)`; dropping the last one
/// calls `busy(false)` on the same driver.
pub(crate) struct BusyGuard {
    cell: Arc<DeviceCell>,
    driver: Arc<dyn DeviceDriver>,
}

impl BusyGuard {
    pub fn new(cell: &Arc<DeviceCell>, driver: &Arc<dyn DeviceDriver>) -> Self {
        let mut busy = cell.busy.lock();
        *busy += 1;
        if *busy == 1 {
            driver.busy(true);
            debug!(device = %cell.name, "device busy");
        }
        drop(busy);
        Self {
            cell: Arc::clone(cell),
            driver: Arc::clone(driver),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self.cell.busy.lock();
        *busy -= 1;
        if *busy == 0 {
            self.driver.busy(false);
            debug!(device = %self.cell.name, "device idle");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Driver with identical layers whose frames count cycles.
    pub struct CountingDriver {
        pub layers: u32,
        pub sensors: u32,
        pub rate: u32,
        pub buffers: usize,
        pub details_calls: AtomicU32,
        pub busy_calls: Mutex<Vec<bool>>,
        pub fail_fill: Arc<AtomicBool>,
    }

    impl CountingDriver {
        pub fn new(layers: u32, sensors: u32, rate: u32) -> Arc<Self> {
            Arc::new(Self {
                layers,
                sensors,
                rate,
                buffers: 3,
                details_calls: AtomicU32::new(0),
                busy_calls: Mutex::new(Vec::new()),
                fail_fill: Arc::new(AtomicBool::new(false)),
            })
        }

        pub fn registration(self: &Arc<Self>, name: &str) -> DeviceRegistration {
            DeviceRegistration {
                name: name.into(),
                layer_count: self.layers,
                sensor_count: self.layers * self.sensors,
                module_count: self.layers,
                patch_count: self.layers,
                driver: Arc::clone(self) as Arc<dyn DeviceDriver>,
            }
        }
    }

    impl DeviceDriver for CountingDriver {
        fn details(&self, layer: usize) -> LayerDetails {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            LayerDetails {
                name: format!("layer-{layer}"),
                sensor_count: self.sensors,
                module_count: 1,
                patch_count: 1,
                acquisition_rate: self.rate,
                buffer_count: self.buffers,
            }
        }

        fn busy(&self, busy: bool) {
            self.busy_calls.lock().push(busy);
        }

        fn filler(&self, _layer: usize) -> Box<dyn Fill> {
            let fail = Arc::clone(&self.fail_fill);
            let mut frame: u16 = 0;
            Box::new(move |slot: &SlotWriter<'_>, map: &[SensorId]| {
                if fail.load(Ordering::SeqCst) {
                    return Err(dermis_types::Error::Fail);
                }
                frame = frame.wrapping_add(1);
                for (pos, raw) in map.iter().enumerate() {
                    slot.set(pos, frame.wrapping_add(*raw));
                }
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingDriver;
    use super::*;

    #[test]
    fn busy_guard_reports_edges_only() {
        let driver = CountingDriver::new(1, 1, 10);
        let dyn_driver: Arc<dyn DeviceDriver> = driver.clone();
        let cell = DeviceCell::new(DeviceId(0), "d".into(), Arc::clone(&dyn_driver));

        let a = BusyGuard::new(&cell, &dyn_driver);
        let b = BusyGuard::new(&cell, &dyn_driver);
        assert_eq!(cell.busy_count(), 2);
        drop(a);
        assert_eq!(*driver.busy_calls.lock(), vec![true]);
        drop(b);
        assert_eq!(*driver.busy_calls.lock(), vec![true, false]);
        assert_eq!(cell.busy_count(), 0);
    }

    #[test]
    fn registration_totals_form_the_shape() {
        let driver = CountingDriver::new(2, 5, 10);
        let shape = driver.registration("x").shape();
        assert_eq!(
            shape,
            Shape {
                layers: 2,
                sensors: 10,
                modules: 2,
                patches: 2
            }
        );
    }
}
