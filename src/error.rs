//! Error taxonomy for the emulation core.
//!
//! - `ConfigError`: rejected before the first tick runs.
//! - `ProtocolError`: a datagram that could not be framed or parsed; always dropped, never fatal.
//! - `EmulationError`: anything that ends a Plant or Controller run.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::plant::variable::{Value, VariableKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tick rate must be greater than 0 Hz")]
    InvalidTickRate,

    #[error("sensor for '{variable}' has a sampling frequency of 0 Hz")]
    ZeroSensorFrequency { variable: String },

    #[error("sensor for '{variable}' samples at {sensor_hz} Hz, faster than the {tick_hz} Hz plant")]
    SensorTooFast {
        variable: String,
        sensor_hz: u32,
        tick_hz: u32,
    },

    #[error("sensor for '{variable}' samples at {sensor_hz} Hz, which does not divide the {tick_hz} Hz plant rate")]
    SensorNotSubMultiple {
        variable: String,
        sensor_hz: u32,
        tick_hz: u32,
    },

    #[error("no variable named '{0}' is registered in the state")]
    UnknownVariable(String),

    #[error("variable '{name}' is a {actual} variable, expected {expected}")]
    WrongKind {
        name: String,
        expected: VariableKind,
        actual: VariableKind,
    },

    #[error("variable '{0}' is registered twice")]
    DuplicateVariable(String),

    #[error("more than one {kind} is bound to '{variable}'")]
    DuplicateBinding {
        kind: &'static str,
        variable: String,
    },

    #[error("actuator variable '{0}' has no actuator bound to it")]
    MissingActuator(String),

    #[error("emulation duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),

    #[error("{0} must be greater than 0")]
    ZeroCapacity(&'static str),

    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),

    #[error("bad magic bytes {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("encoded batch is {0} bytes, larger than a single datagram")]
    TooLarge(usize),

    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("expected a {expected} batch, got a {actual} batch")]
    UnexpectedKind {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Reason a run ended before its configured duration.
#[derive(Debug, Clone, PartialEq)]
pub enum HaltCause {
    /// A validity predicate rejected the value of `variable`.
    InvalidVariable { variable: String, value: Value },
    /// User-supplied logic returned an error.
    UserLogic { component: String, message: String },
    /// External stop request (signal, caller).
    Stopped,
}

impl std::fmt::Display for HaltCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltCause::InvalidVariable { variable, value } => {
                write!(f, "variable '{}' failed its validity check (value {:?})", variable, value)
            }
            HaltCause::UserLogic { component, message } => {
                write!(f, "{} failed: {}", component, message)
            }
            HaltCause::Stopped => write!(f, "stop requested"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("variable '{variable}' failed its validity check at tick {tick} (value {value:?})")]
    InvalidVariable {
        variable: String,
        value: Value,
        tick: u64,
    },

    #[error("{component} failed ({context})")]
    UserLogic {
        component: String,
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0}")]
    Halted(HaltCause),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EmulationError {
    /// Wraps an error raised by user-supplied logic with the component and tick/batch it came from.
    pub fn user_logic(component: impl Into<String>, context: impl Into<String>, source: anyhow::Error) -> Self {
        EmulationError::UserLogic {
            component: component.into(),
            context: context.into(),
            source,
        }
    }
}
