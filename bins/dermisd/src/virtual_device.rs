//! A device without hardware: a pressure blob sweeping over every layer.

use dermis_config::{DeviceConfig, LayerConfig};
use dermis_core::{
    DeviceDriver, DeviceRegistration, Fill, LayerDetails, SENSOR_RESPONSE_MAX, SensorId,
    SensorResponse, SlotWriter,
};
use std::sync::Arc;

pub struct VirtualDevice {
    layers: Vec<LayerConfig>,
}

impl VirtualDevice {
    pub fn registration(cfg: &DeviceConfig) -> DeviceRegistration {
        let (sensors, modules, patches) = cfg.layers.iter().fold((0u32, 0u32, 0u32), |(s, m, p), l| {
            (s + l.sensors, m + l.modules, p + l.patches)
        });
        DeviceRegistration {
            name: cfg.name.clone(),
            layer_count: cfg.layers.len() as u32,
            sensor_count: sensors,
            module_count: modules,
            patch_count: patches,
            driver: Arc::new(VirtualDevice {
                layers: cfg.layers.clone(),
            }),
        }
    }

    /// Used when the configuration names no device.
    pub fn fallback() -> DeviceConfig {
        DeviceConfig {
            name: "virtual".into(),
            layers: vec![LayerConfig {
                name: "virtual-0".into(),
                sensors: 64,
                modules: 4,
                patches: 1,
                rate_hz: 50,
                buffer_count: 0,
            }],
        }
    }
}

impl DeviceDriver for VirtualDevice {
    fn details(&self, layer: usize) -> LayerDetails {
        match self.layers.get(layer) {
            Some(l) => LayerDetails {
                name: l.name.clone(),
                sensor_count: l.sensors,
                module_count: l.modules,
                patch_count: l.patches,
                acquisition_rate: l.rate_hz,
                buffer_count: l.buffer_count,
            },
            // Zero sensors marks the device bad.
            None => LayerDetails {
                name: format!("missing-{layer}"),
                sensor_count: 0,
                module_count: 0,
                patch_count: 0,
                acquisition_rate: 0,
                buffer_count: 0,
            },
        }
    }

    fn filler(&self, _layer: usize) -> Box<dyn Fill> {
        Box::new(Sweep::default())
    }
}

#[derive(Default)]
struct Sweep {
    frame: u64,
}

impl Sweep {
    fn response(&self, raw: SensorId, sensors: usize) -> SensorResponse {
        let center = (self.frame % sensors as u64) as usize;
        let raw = usize::from(raw);
        let d = raw.abs_diff(center).min(sensors - raw.abs_diff(center));
        SENSOR_RESPONSE_MAX.checked_shr(4 * d as u32).unwrap_or(0)
    }
}

impl Fill for Sweep {
    fn fill(&mut self, slot: &SlotWriter<'_>, sensor_map: &[SensorId]) -> dermis_core::Result<()> {
        self.frame += 1;
        for (pos, raw) in sensor_map.iter().enumerate() {
            slot.set(pos, self.response(*raw, sensor_map.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_sums_layer_shapes() {
        let mut cfg = VirtualDevice::fallback();
        cfg.layers.push(LayerConfig {
            name: "virtual-1".into(),
            sensors: 8,
            modules: 2,
            patches: 1,
            rate_hz: 10,
            buffer_count: 2,
        });
        let reg = VirtualDevice::registration(&cfg);
        assert_eq!(reg.layer_count, 2);
        assert_eq!(reg.sensor_count, 72);
        assert_eq!(reg.module_count, 6);
        assert_eq!(reg.patch_count, 2);
        assert_eq!(reg.driver.details(1).buffer_count, 2);
        assert_eq!(reg.driver.details(5).sensor_count, 0);
    }

    #[test]
    fn blob_peaks_under_the_sweep_and_wraps() {
        let sweep = Sweep { frame: 3 };
        assert_eq!(sweep.response(3, 16), SENSOR_RESPONSE_MAX);
        assert_eq!(sweep.response(4, 16), SENSOR_RESPONSE_MAX >> 4);
        assert_eq!(sweep.response(10, 16), 0);
        let wrapped = Sweep { frame: 15 };
        assert_eq!(wrapped.response(0, 16), SENSOR_RESPONSE_MAX >> 4);
    }
}
