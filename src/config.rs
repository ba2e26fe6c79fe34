//! config.rs
//! Run configuration for both ends of the link.
//!
//! Built once (defaults or a YAML file), validated before the first tick and injected; there is
//! no global configuration.
//!
//! ```yaml
//! tick_rate_hz: 200
//! duration_secs: 30.0
//! bind_addr: 0.0.0.0:50001
//! controller_addr: 127.0.0.1:50000
//! sensor_rates:
//!   speed: 100
//! ```

use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::plant::sensor::ticks_per_sample;

pub const DEFAULT_CONTROLLER_PORT: u16 = 50_000;
pub const DEFAULT_PLANT_PORT: u16 = 50_001;

fn default_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    pub tick_rate_hz: u32,
    /// Seconds to run; `None` runs until stopped.
    pub duration_secs: Option<f64>,
    pub bind_addr: SocketAddr,
    pub controller_addr: SocketAddr,
    /// Sampling frequency per sensor variable, overriding the model's defaults.
    pub sensor_rates: BTreeMap<String, u32>,
    /// Directory for CSV output; `None` disables recording.
    pub output_dir: Option<PathBuf>,
    /// Capacity of the outbound sample queue between the tick loop and the sender thread.
    pub channel_capacity: usize,
    pub recv_buffer_bytes: Option<usize>,
    pub pin_core: Option<usize>,
    pub poll_interval_ms: u64,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 100,
            duration_secs: None,
            bind_addr: default_addr(DEFAULT_PLANT_PORT),
            controller_addr: default_addr(DEFAULT_CONTROLLER_PORT),
            sensor_rates: BTreeMap::new(),
            output_dir: None,
            channel_capacity: 64,
            recv_buffer_bytes: None,
            pin_core: None,
            poll_interval_ms: 50,
        }
    }
}

impl PlantConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::InvalidTickRate);
        }
        if let Some(secs) = self.duration_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::InvalidDuration(secs));
            }
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("channel_capacity"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroCapacity("poll_interval_ms"));
        }
        for (variable, hz) in &self.sensor_rates {
            ticks_per_sample(variable, *hz, self.tick_rate_hz)?;
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs_f64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured rate for `variable`, or `default_hz` when none is set.
    pub fn sensor_rate(&self, variable: &str, default_hz: u32) -> u32 {
        self.sensor_rates.get(variable).copied().unwrap_or(default_hz)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub bind_addr: SocketAddr,
    /// Actuator names the controller may command. Empty forwards everything.
    pub actuators: Vec<String>,
    /// Numeric parameters handed to the control law on construction.
    pub parameters: BTreeMap<String, f64>,
    pub output_dir: Option<PathBuf>,
    pub recv_buffer_bytes: Option<usize>,
    pub poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_addr(DEFAULT_CONTROLLER_PORT),
            actuators: Vec::new(),
            parameters: BTreeMap::new(),
            output_dir: None,
            recv_buffer_bytes: None,
            poll_interval_ms: 50,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroCapacity("poll_interval_ms"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PlantConfig::default().validate().unwrap();
        ControllerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: PlantConfig = serde_yaml::from_str("tick_rate_hz: 200\nsensor_rates:\n  speed: 50\n").unwrap();
        assert_eq!(cfg.tick_rate_hz, 200);
        assert_eq!(cfg.sensor_rate("speed", 100), 50);
        assert_eq!(cfg.sensor_rate("angle", 100), 100);
        assert_eq!(cfg.channel_capacity, PlantConfig::default().channel_capacity);
        cfg.validate().unwrap();
    }

    #[test]
    fn invalid_rates_are_rejected() {
        let mut cfg = PlantConfig {
            tick_rate_hz: 0,
            ..PlantConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTickRate)));

        cfg.tick_rate_hz = 200;
        cfg.sensor_rates.insert("speed".into(), 300);
        assert!(matches!(cfg.validate(), Err(ConfigError::SensorTooFast { .. })));

        cfg.sensor_rates.insert("speed".into(), 30);
        assert!(matches!(cfg.validate(), Err(ConfigError::SensorNotSubMultiple { .. })));

        cfg.sensor_rates.insert("speed".into(), 0);
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroSensorFrequency { .. })));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let cfg = PlantConfig {
            duration_secs: Some(-1.0),
            ..PlantConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn bad_types_fail_to_parse() {
        assert!(serde_yaml::from_str::<PlantConfig>("tick_rate_hz: fast\n").is_err());
    }
}
