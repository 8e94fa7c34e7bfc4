use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DermisConfig {
    /// Slots per layer when a device asks for 0.
    #[serde(default = "defaults::buffer_count")]
    pub buffer_count: usize,
    /// Upper bound of every single blocking wait inside the engine.
    #[serde(default = "defaults::max_thread_delay_ms")]
    pub max_thread_delay_ms: u64,
    /// Added to a task's period when waiting for it to stop.
    #[serde(default = "defaults::stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "defaults::max_devices")]
    pub max_devices: usize,
    #[serde(default = "defaults::max_services")]
    pub max_services: usize,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Where the daemon writes its status snapshot, if anywhere.
    #[serde(default)]
    pub status_path: Option<String>,
    #[serde(default)]
    pub skip_calibration: bool,
    #[serde(default)]
    pub skip_regionalization: bool,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// A simulated device for the example daemon.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub name: String,
    pub sensors: u32,
    #[serde(default = "defaults::one")]
    pub modules: u32,
    #[serde(default = "defaults::one")]
    pub patches: u32,
    #[serde(default = "defaults::rate_hz")]
    pub rate_hz: u32,
    /// 0 picks the engine default.
    #[serde(default)]
    pub buffer_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn buffer_count() -> usize {
        3
    }

    pub fn max_thread_delay_ms() -> u64 {
        50
    }

    pub fn stop_grace_ms() -> u64 {
        1500
    }

    pub fn max_devices() -> usize {
        32
    }

    pub fn max_services() -> usize {
        32
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn one() -> u32 {
        1
    }

    pub fn rate_hz() -> u32 {
        100
    }
}

impl Default for DermisConfig {
    fn default() -> Self {
        Self {
            buffer_count: defaults::buffer_count(),
            max_thread_delay_ms: defaults::max_thread_delay_ms(),
            stop_grace_ms: defaults::stop_grace_ms(),
            max_devices: defaults::max_devices(),
            max_services: defaults::max_services(),
            log_level: defaults::log_level(),
            status_path: None,
            skip_calibration: false,
            skip_regionalization: false,
            devices: Vec::new(),
        }
    }
}

impl DermisConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&toml_to_str)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn max_thread_delay(&self) -> Duration {
        Duration::from_millis(self.max_thread_delay_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
