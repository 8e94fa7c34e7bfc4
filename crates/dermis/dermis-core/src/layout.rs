//! Data structures describing how the sensors are laid out.
//!
//! Positions, neighbors and region membership are computed by external tools
//! during the calibration and regionalization phases; the engine only stores
//! what they submit and applies the sensor reordering to its writers.

use dermis_types::{DeviceId, Error, LayerId, Result, SensorId, period_of};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything known about a layer once structures are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    pub id: LayerId,
    pub device: DeviceId,
    /// Index of the layer inside its device.
    pub index_in_device: usize,
    pub name: String,
    pub sensor_count: usize,
    pub module_count: u32,
    pub patch_count: u32,
    pub acquisition_rate: u32,
    pub buffer_count: usize,
}

impl LayerInfo {
    #[inline]
    pub fn period(&self) -> Duration {
        period_of(self.acquisition_rate)
    }
}

/// Sensors `start..end` of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRange {
    pub layer: LayerId,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubRegion {
    pub ranges: Vec<SensorRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    /// Indices into [`RegionTable::sub_regions`].
    pub sub_regions: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionTable {
    pub sub_regions: Vec<SubRegion>,
    pub regions: Vec<Region>,
}

impl RegionTable {
    /// One region made of one sub-region that covers every sensor.
    pub fn single(layers: &[LayerInfo]) -> Self {
        let ranges = layers
            .iter()
            .filter(|l| l.sensor_count > 0)
            .map(|l| SensorRange {
                layer: l.id,
                start: 0,
                end: l.sensor_count as u32,
            })
            .collect();
        Self {
            sub_regions: vec![SubRegion { ranges }],
            regions: vec![Region {
                sub_regions: vec![0],
            }],
        }
    }

    pub fn validate(&self, layers: &[LayerInfo]) -> Result<()> {
        for range in self.sub_regions.iter().flat_map(|s| &s.ranges) {
            let layer = layers.get(range.layer.index()).ok_or(Error::BadData)?;
            if range.start > range.end || range.end as usize > layer.sensor_count {
                return Err(Error::BadData);
            }
        }
        let n = self.sub_regions.len() as u32;
        if self.regions.iter().flat_map(|r| &r.sub_regions).any(|&s| s >= n) {
            return Err(Error::BadData);
        }
        Ok(())
    }
}

/// New sensor order of one layer: `order[j]` is the raw sensor index that
/// moves to position `j`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorOrder {
    pub layer: LayerId,
    pub order: Vec<SensorId>,
}

impl SensorOrder {
    /// The order must be a permutation of the layer's sensors.
    pub fn validate(&self, sensor_count: usize) -> Result<()> {
        if self.order.len() != sensor_count {
            return Err(Error::BadData);
        }
        let mut seen = vec![false; sensor_count];
        for &raw in &self.order {
            let slot = seen.get_mut(raw as usize).ok_or(Error::BadData)?;
            if std::mem::replace(slot, true) {
                return Err(Error::BadData);
            }
        }
        Ok(())
    }
}

/// What the regionalization tool submits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Regionalization {
    pub table: RegionTable,
    /// Layers not listed keep their current order.
    pub orders: Vec<SensorOrder>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorCalibration {
    pub position: [f32; 3],
    pub neighbors: Vec<SensorId>,
}

/// Per-layer calibration results, in raw sensor order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    pub layers: Vec<(LayerId, Vec<SensorCalibration>)>,
}

impl CalibrationData {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn validate(&self, layers: &[LayerInfo]) -> Result<()> {
        for (id, sensors) in &self.layers {
            let layer = layers.get(id.index()).ok_or(Error::BadData)?;
            if sensors.len() != layer.sensor_count {
                return Err(Error::BadData);
            }
            let n = layer.sensor_count;
            if sensors
                .iter()
                .flat_map(|s| &s.neighbors)
                .any(|&nb| nb as usize >= n)
            {
                return Err(Error::BadData);
            }
        }
        Ok(())
    }
}

/// Snapshot of the data structures handed to layout consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layout {
    pub layers: Vec<LayerInfo>,
    pub regions: RegionTable,
    pub calibration: CalibrationData,
}

#[cfg(test)]
pub(crate) fn layer(id: u16, sensors: usize) -> LayerInfo {
    LayerInfo {
        id: LayerId(id),
        device: DeviceId(0),
        index_in_device: id as usize,
        name: format!("l{id}"),
        sensor_count: sensors,
        module_count: 1,
        patch_count: 1,
        acquisition_rate: 100,
        buffer_count: 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_region_covers_everything() {
        let layers = [layer(0, 4), layer(1, 0), layer(2, 7)];
        let t = RegionTable::single(&layers);
        assert_eq!(t.regions.len(), 1);
        assert_eq!(t.sub_regions[0].ranges.len(), 2);
        assert_eq!(t.sub_regions[0].ranges[1].end, 7);
        assert!(t.validate(&layers).is_ok());
    }

    #[test]
    fn table_out_of_bounds_is_rejected() {
        let layers = [layer(0, 4)];
        let mut t = RegionTable::single(&layers);
        t.sub_regions[0].ranges[0].end = 5;
        assert_eq!(t.validate(&layers), Err(Error::BadData));

        let mut t = RegionTable::single(&layers);
        t.regions[0].sub_regions.push(3);
        assert_eq!(t.validate(&layers), Err(Error::BadData));
    }

    #[test]
    fn order_must_be_a_permutation() {
        let ok = SensorOrder {
            layer: LayerId(0),
            order: vec![2, 0, 1],
        };
        assert!(ok.validate(3).is_ok());
        assert_eq!(ok.validate(4), Err(Error::BadData));

        let dup = SensorOrder {
            layer: LayerId(0),
            order: vec![0, 0, 1],
        };
        assert_eq!(dup.validate(3), Err(Error::BadData));
    }

    #[test]
    fn calibration_checks_sizes_and_neighbors() {
        let layers = [layer(0, 2)];
        let mut c = CalibrationData {
            layers: vec![(
                LayerId(0),
                vec![
                    SensorCalibration {
                        position: [0.0; 3],
                        neighbors: vec![1],
                    },
                    SensorCalibration {
                        position: [1.0, 0.0, 0.0],
                        neighbors: vec![0],
                    },
                ],
            )],
        };
        assert!(c.validate(&layers).is_ok());
        c.layers[0].1[0].neighbors.push(9);
        assert_eq!(c.validate(&layers), Err(Error::BadData));
    }
}
