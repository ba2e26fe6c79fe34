//! actuator.rs
//! Actuators and the bank that routes incoming commands to them.
//!
//! Two independent callers touch every actuator:
//! - the transport receive path calls `set_value` whenever an accepted actuation batch names it,
//! - the tick loop calls `get_actuation` once per tick and writes the result into the variable.
//!
//! Each actuator sits behind its own lock, so any interleaving of writes and reads is safe and
//! the implementation alone decides what "latest" means (hold, impulse, noisy hold).

use std::{collections::BTreeMap, sync::Arc};

use log::warn;
use parking_lot::Mutex;
use rand::random_range;

use crate::error::ConfigError;
use crate::net::protocol::{Batch, SequenceFilter};
use crate::plant::variable::{ActuatorVariable, Value};

/// User-supplied actuator logic.
pub trait Actuator: Send {
    /// Write path: a new command arrived from the controller.
    fn set_value(&mut self, value: Value) -> anyhow::Result<()>;

    /// Read path: value to apply to the actuator variable on this tick.
    fn get_actuation(&mut self) -> anyhow::Result<Value>;

    /// Called exactly once when the plant shuts down.
    fn shutdown(&mut self) {}
}

/// Holds the last commanded value until a new one arrives.
#[derive(Debug, Clone)]
pub struct ConstantActuator {
    value: Value,
}

impl ConstantActuator {
    pub fn new(initial: impl Into<Value>) -> Self {
        Self {
            value: initial.into(),
        }
    }
}

impl Actuator for ConstantActuator {
    fn set_value(&mut self, value: Value) -> anyhow::Result<()> {
        self.value = value;
        Ok(())
    }

    fn get_actuation(&mut self) -> anyhow::Result<Value> {
        Ok(self.value.clone())
    }
}

/// Applies a commanded value for exactly one tick, then falls back to the default.
#[derive(Debug, Clone)]
pub struct ImpulseActuator {
    default: Value,
    value: Value,
}

impl ImpulseActuator {
    pub fn new(default: impl Into<Value>) -> Self {
        let default = default.into();
        Self {
            value: default.clone(),
            default,
        }
    }
}

impl Actuator for ImpulseActuator {
    fn set_value(&mut self, value: Value) -> anyhow::Result<()> {
        self.value = value;
        Ok(())
    }

    fn get_actuation(&mut self) -> anyhow::Result<Value> {
        Ok(std::mem::replace(&mut self.value, self.default.clone()))
    }
}

/// Constant-hold actuator whose commands are perturbed by uniform noise in `[lo, hi)`.
#[derive(Debug, Clone)]
pub struct NoisyConstantActuator {
    inner: ConstantActuator,
    lo: f64,
    hi: f64,
}

impl NoisyConstantActuator {
    pub fn new(initial: f64, lo: f64, hi: f64) -> Self {
        Self {
            inner: ConstantActuator::new(initial),
            lo,
            hi,
        }
    }
}

impl Actuator for NoisyConstantActuator {
    fn set_value(&mut self, value: Value) -> anyhow::Result<()> {
        let target = value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("cannot add noise to a {} command", value.type_name()))?;
        let noise = if self.hi > self.lo {
            random_range(self.lo..self.hi)
        } else {
            0.0
        };
        self.inner.set_value(Value::Float(target + noise))
    }

    fn get_actuation(&mut self) -> anyhow::Result<Value> {
        self.inner.get_actuation()
    }
}

struct Slot {
    variable: ActuatorVariable,
    actuator: Mutex<Box<dyn Actuator>>,
}

/// Result of offering an actuation batch to the bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Batch accepted; `applied` entries reached an actuator, `unknown` named none.
    Accepted { applied: usize, unknown: Vec<String> },
    /// Sequence number not newer than the last accepted batch.
    Stale { seq: u64, last: u64 },
}

/// Failure of an actuator's write path while delivering a batch.
#[derive(Debug)]
pub struct ActuatorFailure {
    pub variable: String,
    pub seq: u64,
    pub source: anyhow::Error,
}

/// All actuators of a plant, shared between the tick loop and the receive path.
#[derive(Clone)]
pub struct ActuatorBank {
    slots: Arc<BTreeMap<String, Slot>>,
    filter: Arc<Mutex<SequenceFilter>>,
}

impl ActuatorBank {
    pub(crate) fn new(bound: Vec<(ActuatorVariable, Box<dyn Actuator>)>) -> Result<Self, ConfigError> {
        let mut slots = BTreeMap::new();
        for (variable, actuator) in bound {
            let name = variable.name().to_string();
            if slots.contains_key(&name) {
                return Err(ConfigError::DuplicateBinding {
                    kind: "actuator",
                    variable: name,
                });
            }
            slots.insert(
                name,
                Slot {
                    variable,
                    actuator: Mutex::new(actuator),
                },
            );
        }
        Ok(Self {
            slots: Arc::new(slots),
            filter: Arc::new(Mutex::new(SequenceFilter::new())),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Receive path: rejects stale batches atomically, otherwise forwards every entry to
    /// its actuator's write path. Unknown names are skipped with a warning.
    pub fn deliver(&self, batch: &Batch) -> Result<Delivery, ActuatorFailure> {
        {
            let mut filter = self.filter.lock();
            if let Err(last) = filter.accept(batch.seq) {
                return Ok(Delivery::Stale {
                    seq: batch.seq,
                    last,
                });
            }
        }

        let mut applied = 0;
        let mut unknown = Vec::new();
        for (name, value) in &batch.values {
            match self.slots.get(name) {
                Some(slot) => {
                    slot.actuator
                        .lock()
                        .set_value(value.clone())
                        .map_err(|source| ActuatorFailure {
                            variable: name.clone(),
                            seq: batch.seq,
                            source,
                        })?;
                    applied += 1;
                }
                None => {
                    warn!("[Actuators] batch {} names unknown actuator '{}', dropping entry", batch.seq, name);
                    unknown.push(name.clone());
                }
            }
        }
        Ok(Delivery::Accepted { applied, unknown })
    }

    /// Tick path: reads every actuator once and writes the result into its variable.
    pub(crate) fn apply_all(&self) -> Result<(), (String, anyhow::Error)> {
        for (name, slot) in self.slots.iter() {
            let value = slot
                .actuator
                .lock()
                .get_actuation()
                .map_err(|e| (name.clone(), e))?;
            slot.variable.apply(value);
        }
        Ok(())
    }

    /// Highest accepted actuation sequence number, if any.
    pub fn last_accepted(&self) -> Option<u64> {
        self.filter.lock().last()
    }

    pub(crate) fn shutdown(&self) {
        for slot in self.slots.values() {
            slot.actuator.lock().shutdown();
        }
    }
}
