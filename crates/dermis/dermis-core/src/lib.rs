//! Acquisition and distribution engine.
//!
//! Devices register drivers, the [`Kernel`] builds one buffer ring per layer
//! and runs a periodic writer for each. Readers attach as delivery tasks,
//! alone or inside services. Everything is gated by the [`Lifecycle`].

pub mod command;
mod connector;
mod delivery;
mod device;
mod gate;
mod kernel;
mod layout;
mod lifecycle;
mod service;
mod status;
mod writer;

pub use connector::{Connector, ServiceView};
pub use delivery::{Consume, DeliveryHandle, ReaderStats};
pub use device::{DeviceDriver, DeviceRegistration, DeviceState, Fill, LayerDetails, Registered};
pub use gate::Gate;
pub use kernel::Kernel;
pub use layout::{
    CalibrationData, LayerInfo, Layout, Region, RegionTable, Regionalization, SensorCalibration,
    SensorOrder, SensorRange, SubRegion,
};
pub use lifecycle::{Lifecycle, SystemState};
pub use service::{
    LayerSelect, MODE_PERIODIC, MODE_SPORADIC, PAYLOAD_OFFSET, STATUS_ALIVE, STATUS_DEAD,
    ServiceFn, ServiceHeader, ServiceOutput, sporadic_lock_name,
};
pub use status::{DeviceStatus, LayerStatus, StatusSnapshot};
pub use writer::WriterStats;

pub use dermis_icc::{FrameView, SlotWriter};
pub use dermis_types::{
    AcquisitionMode, DeviceId, Error, LayerId, Outcome, Result, SENSOR_RESPONSE_MAX, SensorId,
    SensorResponse, ServiceId,
};
