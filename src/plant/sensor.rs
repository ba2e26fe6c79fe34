//! sensor.rs
//! Sensors attached to the plant and their sampling schedule.
//!
//! - A sensor is bound to one sensor variable and samples it at its own frequency,
//!   a divisor of the plant tick rate (checked when the plant is built).
//! - Scheduling counts elapsed nominal ticks: the sensor fires once its threshold is
//!   reached and the counter resets. Missed periods after an overrun are skipped, never burst.

use rand::random_range;

use crate::error::ConfigError;
use crate::plant::variable::{SensorVariable, Value};

/// User-supplied sensor logic: turns the current value of a variable into a sample.
pub trait Sensor: Send {
    /// May keep state between calls (filters, drift, quantisation).
    fn process_sample(&mut self, value: Value) -> anyhow::Result<Value>;

    /// Called exactly once when the plant shuts down.
    fn shutdown(&mut self) {}
}

/// Reports the measured value as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleSensor;

impl Sensor for SimpleSensor {
    fn process_sample(&mut self, value: Value) -> anyhow::Result<Value> {
        Ok(value)
    }
}

/// Adds uniform noise in `[lo, hi)` to numeric samples.
#[derive(Debug, Clone, Copy)]
pub struct NoisySensor {
    lo: f64,
    hi: f64,
}

impl NoisySensor {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }
}

impl Sensor for NoisySensor {
    fn process_sample(&mut self, value: Value) -> anyhow::Result<Value> {
        let reading = value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("cannot add noise to a {} sample", value.type_name()))?;
        if self.hi <= self.lo {
            return Ok(Value::Float(reading));
        }
        Ok(Value::Float(reading + random_range(self.lo..self.hi)))
    }
}

/// A sensor together with its variable and countdown.
pub(crate) struct ScheduledSensor {
    variable: SensorVariable,
    frequency_hz: u32,
    ticks_per_sample: u64,
    elapsed_ticks: u64,
    sensor: Box<dyn Sensor>,
    fired: u64,
}

/// One sample produced by a sensor on a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub variable: String,
    pub raw: Value,
    pub processed: Value,
}

impl ScheduledSensor {
    pub(crate) fn new(
        variable: SensorVariable,
        frequency_hz: u32,
        tick_rate_hz: u32,
        sensor: Box<dyn Sensor>,
    ) -> Result<Self, ConfigError> {
        let ticks_per_sample = ticks_per_sample(variable.name(), frequency_hz, tick_rate_hz)?;
        Ok(Self {
            variable,
            frequency_hz,
            ticks_per_sample,
            // Primed so the first tick produces an initial sample.
            elapsed_ticks: ticks_per_sample,
            sensor,
            fired: 0,
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.variable.name()
    }

    pub(crate) fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    pub(crate) fn fired(&self) -> u64 {
        self.fired
    }

    /// Advances the countdown by `elapsed` nominal ticks and reports whether the sensor is due.
    /// A due sensor resets to zero, so periods lost to an overrun are dropped.
    pub(crate) fn advance(&mut self, elapsed: u64) -> bool {
        self.elapsed_ticks = self.elapsed_ticks.saturating_add(elapsed);
        if self.elapsed_ticks >= self.ticks_per_sample {
            self.elapsed_ticks = 0;
            true
        } else {
            false
        }
    }

    pub(crate) fn sample(&mut self) -> anyhow::Result<Sample> {
        let raw = self.variable.get();
        let processed = self.sensor.process_sample(raw.clone())?;
        self.fired += 1;
        Ok(Sample {
            variable: self.variable.name().to_string(),
            raw,
            processed,
        })
    }

    pub(crate) fn shutdown(&mut self) {
        self.sensor.shutdown();
    }
}

/// Validates a sensor frequency against the plant rate and returns the sampling period in ticks.
pub fn ticks_per_sample(variable: &str, sensor_hz: u32, tick_hz: u32) -> Result<u64, ConfigError> {
    if tick_hz == 0 {
        return Err(ConfigError::InvalidTickRate);
    }
    if sensor_hz == 0 {
        return Err(ConfigError::ZeroSensorFrequency {
            variable: variable.to_string(),
        });
    }
    if sensor_hz > tick_hz {
        return Err(ConfigError::SensorTooFast {
            variable: variable.to_string(),
            sensor_hz,
            tick_hz,
        });
    }
    if tick_hz % sensor_hz != 0 {
        return Err(ConfigError::SensorNotSubMultiple {
            variable: variable.to_string(),
            sensor_hz,
            tick_hz,
        });
    }
    Ok(u64::from(tick_hz / sensor_hz))
}
