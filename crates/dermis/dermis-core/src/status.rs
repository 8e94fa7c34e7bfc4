//! Read-only status surface.

use crate::device::DeviceState;
use crate::lifecycle::SystemState;
use crate::writer::WriterStats;
use dermis_types::{DeviceId, LayerId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub name: String,
    pub state: DeviceState,
    /// A fill failed since the device was last resumed.
    pub marked_bad: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerStatus {
    pub id: LayerId,
    pub name: String,
    pub device: DeviceId,
    pub paused: bool,
    pub frames: u64,
    pub swap_skips: u64,
    /// Cycles lost because the device mutex stayed held.
    pub busy_skips: u64,
    pub worst_write_ns: u64,
    /// 0 until the first frame.
    pub best_write_ns: u64,
    pub accumulated_write_ns: u64,
}

impl LayerStatus {
    pub(crate) fn new(id: LayerId, name: String, device: DeviceId, paused: bool, stats: WriterStats) -> Self {
        Self {
            id,
            name,
            device,
            paused,
            frames: stats.frames,
            swap_skips: stats.swap_skips,
            busy_skips: stats.busy_skips,
            worst_write_ns: stats.exec.worst_ns,
            best_write_ns: if stats.exec.count == 0 {
                0
            } else {
                stats.exec.best_ns
            },
            accumulated_write_ns: stats.exec.accumulated_ns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Short phase name: init, devs, nodevs, built, clbr, rgn, preop, op, exit or fail.
    pub phase: &'static str,
    pub state: SystemState,
    pub uptime_ms: u64,
    pub devices: Vec<DeviceStatus>,
    pub layers: Vec<LayerStatus>,
    pub services: usize,
}

impl StatusSnapshot {
    pub fn bad_devices(&self) -> impl Iterator<Item = &DeviceStatus> {
        self.devices
            .iter()
            .filter(|d| d.marked_bad || d.state == DeviceState::Bad)
    }
}
