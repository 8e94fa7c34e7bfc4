pub mod error;
pub mod ids;
pub mod mode;

pub use error::{Error, Outcome, Result};
pub use ids::{
    DeviceId, ID_SPACE, LayerId, MAX_BUFFERS, SENSOR_RESPONSE_MAX, SensorId, SensorResponse,
    ServiceId,
};
pub use mode::{AcquisitionMode, period_of};
