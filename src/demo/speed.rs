//! speed.rs
//! One-dimensional speed model and its PID controller.
//!
//! - Plant: sensor variable `speed`, actuator variable `accel`, `speed += dt * accel`.
//!   `|speed|` above the limit fails the validity check and halts the plant.
//! - Controller: PID on `speed` towards a setpoint, commanding `accel`.

use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use log::debug;
use pid::Pid;

use crate::config::PlantConfig;
use crate::controller::Controller;
use crate::error::ConfigError;
use crate::plant::{
    actuator::ConstantActuator,
    sensor::SimpleSensor,
    variable::{ActuatorVariable, SensorVariable, Value, ValueMap, VariableStore, VariableStoreBuilder},
    Plant, State,
};
use crate::utils::metrics::RecorderHandle;

pub const SPEED: &str = "speed";
pub const ACCEL: &str = "accel";
pub const DEFAULT_SPEED_HZ: u32 = 100;
pub const DEFAULT_SPEED_LIMIT: f64 = 50.0;

pub struct SpeedState {
    speed: SensorVariable,
    accel: ActuatorVariable,
}

impl SpeedState {
    /// Registers `speed` and `accel` and a validity check `|speed| <= speed_limit`.
    pub fn register(vars: &mut VariableStoreBuilder, speed_limit: f64) -> Self {
        let speed = vars.sensor(SPEED, 0.0);
        let accel = vars.actuator(ACCEL, 0.0);
        vars.check(SPEED, move |v| v.as_f64().is_some_and(|s| s.abs() <= speed_limit));
        vars.parameter("speed_limit", speed_limit);
        Self { speed, accel }
    }
}

impl State for SpeedState {
    fn advance(&mut self, dt: Duration) -> anyhow::Result<()> {
        let speed = self.speed.f64() + dt.as_secs_f64() * self.accel.f64();
        self.speed.set(speed);
        Ok(())
    }

    fn shutdown(&mut self) {
        debug!("[Speed] final speed {:.4}", self.speed.f64());
    }
}

/// Builds the speed plant: identity sensor on `speed`, constant-hold actuator on `accel`.
pub fn speed_plant(config: &PlantConfig, speed_limit: f64, recorder: RecorderHandle) -> Result<Plant, ConfigError> {
    let mut vars = VariableStore::builder();
    let state = SpeedState::register(&mut vars, speed_limit);
    let store = vars.build()?;

    Plant::builder(store, Box::new(state))
        .configure(config)
        .sensor(SPEED, config.sensor_rate(SPEED, DEFAULT_SPEED_HZ), Box::new(SimpleSensor))
        .actuator(ACCEL, Box::new(ConstantActuator::new(0.0)))
        .recorder(recorder)
        .build()
}

pub struct SpeedController {
    pid: Pid<f64>,
    setpoint: f64,
}

impl SpeedController {
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64, limit: f64) -> Self {
        let mut pid = Pid::new(setpoint, limit);
        pid.p(kp, limit);
        pid.i(ki, limit);
        pid.d(kd, limit);
        Self { pid, setpoint }
    }

    /// Reads `setpoint`, `kp`, `ki`, `kd` and `limit`, falling back to defaults for missing keys.
    pub fn from_parameters(params: &BTreeMap<String, f64>) -> Self {
        let get = |key: &str, default: f64| params.get(key).copied().unwrap_or(default);
        Self::new(
            get("setpoint", 1.0),
            get("kp", 2.0),
            get("ki", 0.1),
            get("kd", 0.0),
            get("limit", 10.0),
        )
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }
}

impl Controller for SpeedController {
    fn process(&mut self, samples: &ValueMap) -> anyhow::Result<ValueMap> {
        let speed = samples
            .get(SPEED)
            .and_then(Value::as_f64)
            .context("sample batch carries no numeric 'speed'")?;
        let accel = self.pid.next_control_output(speed).output;

        let mut out = ValueMap::new();
        out.insert(ACCEL.to_string(), Value::Float(accel));
        Ok(out)
    }
}
