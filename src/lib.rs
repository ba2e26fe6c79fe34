//! # Networked Control System emulator
//!
//! A plant (physical model, sensors, actuators) runs on a fixed-rate tick loop and exchanges
//! sample and actuation batches with a controller over UDP.
//!
//! ## Layout
//! - `plant`: variables, sensors, actuators, tick loop and the plant end of the link
//! - `controller`: control-law contract, latest-wins dispatch and the controller service
//! - `net`: batch framing and socket setup
//! - `utils`: event recording and the stop signal
//! - `config`: YAML run configuration
//! - `demo`: speed model and PID controller

pub mod config;
pub mod controller;
pub mod demo;
pub mod error;
pub mod net;
pub mod plant;
pub mod utils;

pub use config::{ControllerConfig, PlantConfig};
pub use controller::{service::ControllerService, Controller};
pub use error::{ConfigError, EmulationError, HaltCause, ProtocolError};
pub use plant::{
    actuator::Actuator,
    link::PlantLink,
    sensor::Sensor,
    variable::{Value, ValueMap, VariableStore},
    Plant, PlantReport, State,
};
