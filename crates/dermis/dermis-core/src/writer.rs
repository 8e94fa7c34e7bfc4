//! Acquisition tasks: one periodic writer thread per layer.

use crate::device::{BusyGuard, DeviceCell, Fill};
use crate::layout::LayerInfo;
use crate::lifecycle::Lifecycle;
use dermis_icc::{LayerRing, RingWriter};
use dermis_rt::{PeriodicTimer, TaskFlags, TaskHandle, TimeStats, now_ns};
use dermis_types::SensorId;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Counters of one writer, shown on the status surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub frames: u64,
    pub swap_skips: u64,
    /// Cycles skipped because the device mutex was not obtained in time.
    pub busy_skips: u64,
    pub exec: TimeStats,
}

/// A layer with its ring and everything its writer shares with the engine.
pub(crate) struct LayerCell {
    pub info: LayerInfo,
    pub ring: Arc<LayerRing>,
    /// `sensor_map[j]` is the raw sensor index stored at position `j`.
    pub sensor_map: RwLock<Arc<[SensorId]>>,
    pub stats: Mutex<WriterStats>,
}

impl LayerCell {
    pub fn new(info: LayerInfo, ring: Arc<LayerRing>) -> Arc<Self> {
        let identity: Arc<[SensorId]> = (0..info.sensor_count as SensorId).collect();
        Arc::new(Self {
            info,
            ring,
            sensor_map: RwLock::new(identity),
            stats: Mutex::new(WriterStats::default()),
        })
    }
}

pub(crate) struct WriterTask {
    pub layer: Arc<LayerCell>,
    pub device: Arc<DeviceCell>,
    pub filler: Box<dyn Fill>,
    pub lifecycle: Arc<Lifecycle>,
    /// Start offset inside the period, staggering writers of one device.
    pub offset: Duration,
}

impl WriterTask {
    /// Spawn the writer; it starts paused until `flags` says otherwise.
    pub fn spawn(self, flags: Arc<TaskFlags>) -> io::Result<TaskHandle> {
        let name = format!("dermis-w{}", self.layer.info.id.0);
        TaskHandle::spawn(name, flags, move |flags| self.run(flags))
    }

    fn run(mut self, flags: &TaskFlags) {
        let layer = Arc::clone(&self.layer);
        let period = layer.info.period();
        let mut writer = match RingWriter::new(Arc::clone(&layer.ring), period) {
            Ok(w) => w,
            Err(e) => {
                error!(layer = %layer.info.id, error = %e, "writer could not take its first slot");
                return;
            }
        };
        let mut timer = PeriodicTimer::aligned(period, self.offset);
        info!(layer = %layer.info.id, name = %layer.info.name, ?period, "writer started");

        loop {
            timer.wait_period();
            if flags.must_stop() || self.lifecycle.is_terminal() {
                break;
            }
            let started = now_ns();
            writer.last_chance_swap();

            // The owed swap above still happened; only this cycle's fill is lost.
            let Some(driver) = self.device.driver.try_lock_for(period / 4) else {
                let mut stats = layer.stats.lock();
                stats.busy_skips += 1;
                stats.swap_skips = writer.swap_skips();
                continue;
            };
            if flags.must_pause() {
                layer.ring.set_paused(true);
                flags.set_paused(true);
                continue;
            }
            flags.set_paused(false);
            layer.ring.set_paused(false);

            let busy = BusyGuard::new(&self.device, &driver);
            let map = Arc::clone(&*layer.sensor_map.read());
            let fill_started = now_ns();
            let filled = self.filler.fill(&writer.slot(), &map);
            writer.record_fill(Duration::from_nanos(now_ns() - fill_started));
            drop(busy);
            drop(driver);

            if let Err(e) = filled {
                warn!(layer = %layer.info.id, device = %self.device.name, error = %e, "fill failed; pausing device");
                self.device.set_bad_mark(true);
                flags.set_must_pause(true);
                continue;
            }

            writer.swap(timer.next_release_ns(), period);

            let mut stats = layer.stats.lock();
            stats.frames += 1;
            stats.swap_skips = writer.swap_skips();
            stats.exec.record(now_ns() - started);
        }

        layer.ring.set_paused(true);
        info!(layer = %layer.info.id, "writer stopped");
    }
}
