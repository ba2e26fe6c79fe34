//! variable.rs
//! Semantic variables: named, typed cells shared between the physical model,
//! the sensors reading it and the actuators driving it.
//!
//! - One `parking_lot::Mutex` per variable; there is no store-wide lock, so the tick loop
//!   and the transport receive path only ever contend on the same cell.
//! - Role-restricted handles: the state may write a `SensorVariable` and only read an
//!   `ActuatorVariable`. Writing actuator cells is reserved to the tick loop.
//! - Validity predicates are evaluated once per tick by the plant; a failure halts the run.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Typed scalar carried by a variable and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view of the value. Booleans map to 0.0/1.0; bytes have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Name → value mapping exchanged with sensors, actuators and the controller.
pub type ValueMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Sensor,
    Actuator,
    ControllerParameter,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableKind::Sensor => f.write_str("sensor"),
            VariableKind::Actuator => f.write_str("actuator"),
            VariableKind::ControllerParameter => f.write_str("controller parameter"),
        }
    }
}

pub type ValidityCheck = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct Cell {
    name: String,
    value: Mutex<Value>,
}

impl Cell {
    #[inline]
    fn get(&self) -> Value {
        self.value.lock().clone()
    }

    #[inline]
    fn set(&self, value: Value) {
        *self.value.lock() = value;
    }
}

/// Handle to a sensed quantity. Written by the state, read by its sensor.
#[derive(Clone)]
pub struct SensorVariable {
    cell: Arc<Cell>,
}

impl SensorVariable {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn get(&self) -> Value {
        self.cell.get()
    }

    /// Numeric view; NaN when the variable holds bytes.
    pub fn f64(&self) -> f64 {
        self.cell.get().as_f64().unwrap_or(f64::NAN)
    }

    pub fn set(&self, value: impl Into<Value>) {
        self.cell.set(value.into());
    }
}

/// Handle to an actuated quantity. Read-only for the state.
#[derive(Clone)]
pub struct ActuatorVariable {
    cell: Arc<Cell>,
}

impl ActuatorVariable {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn get(&self) -> Value {
        self.cell.get()
    }

    /// Numeric view; NaN when the variable holds bytes.
    pub fn f64(&self) -> f64 {
        self.cell.get().as_f64().unwrap_or(f64::NAN)
    }

    /// Written only by the tick loop with the value returned by the paired actuator.
    pub(crate) fn apply(&self, value: Value) {
        self.cell.set(value);
    }
}

/// Read-only initialisation parameter for the controller.
#[derive(Clone)]
pub struct ControllerParameter {
    cell: Arc<Cell>,
}

impl ControllerParameter {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn get(&self) -> Value {
        self.cell.get()
    }
}

/// A variable that failed its validity check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub variable: String,
    pub value: Value,
}

/// Collects variables and their checks before the store is frozen.
#[derive(Default)]
pub struct VariableStoreBuilder {
    entries: BTreeMap<String, Entry>,
    error: Option<ConfigError>,
}

impl VariableStoreBuilder {
    fn register(&mut self, name: &str, kind: VariableKind, initial: Value) -> Arc<Cell> {
        if self.entries.contains_key(name) && self.error.is_none() {
            self.error = Some(ConfigError::DuplicateVariable(name.to_string()));
        }
        let cell = Arc::new(Cell {
            name: name.to_string(),
            value: Mutex::new(initial),
        });
        self.entries.insert(
            name.to_string(),
            Entry {
                shared: cell.clone(),
                kind,
                record: kind != VariableKind::ControllerParameter,
                checks: Vec::new(),
            },
        );
        cell
    }

    pub fn sensor(&mut self, name: &str, initial: impl Into<Value>) -> SensorVariable {
        SensorVariable {
            cell: self.register(name, VariableKind::Sensor, initial.into()),
        }
    }

    pub fn actuator(&mut self, name: &str, initial: impl Into<Value>) -> ActuatorVariable {
        ActuatorVariable {
            cell: self.register(name, VariableKind::Actuator, initial.into()),
        }
    }

    pub fn parameter(&mut self, name: &str, value: impl Into<Value>) -> ControllerParameter {
        ControllerParameter {
            cell: self.register(name, VariableKind::ControllerParameter, value.into()),
        }
    }

    /// Attaches a validity predicate to an already-registered variable.
    pub fn check<F>(&mut self, name: &str, predicate: F) -> &mut Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        match self.entries.get_mut(name) {
            Some(entry) => entry.checks.push(Box::new(predicate)),
            None => {
                if self.error.is_none() {
                    self.error = Some(ConfigError::UnknownVariable(name.to_string()));
                }
            }
        }
        self
    }

    /// Excludes a variable from the per-tick value records.
    pub fn no_record(&mut self, name: &str) -> &mut Self {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.record = false;
        }
        self
    }

    pub fn build(mut self) -> Result<VariableStore, ConfigError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        Ok(VariableStore {
            inner: Arc::new(StoreInner {
                cells: self.entries,
            }),
        })
    }
}

struct Entry {
    shared: Arc<Cell>,
    kind: VariableKind,
    record: bool,
    checks: Vec<ValidityCheck>,
}

struct StoreInner {
    cells: BTreeMap<String, Entry>,
}

/// Frozen set of variables. Cloning is cheap and shares the same cells.
#[derive(Clone)]
pub struct VariableStore {
    inner: Arc<StoreInner>,
}

impl VariableStore {
    pub fn builder() -> VariableStoreBuilder {
        VariableStoreBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.cells.get(name).map(|e| e.shared.get())
    }

    pub fn names(&self, kind: VariableKind) -> Vec<String> {
        self.inner
            .cells
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn sensor(&self, name: &str) -> Result<SensorVariable, ConfigError> {
        let entry = self.entry(name, VariableKind::Sensor)?;
        Ok(SensorVariable {
            cell: entry.shared.clone(),
        })
    }

    pub fn actuator(&self, name: &str) -> Result<ActuatorVariable, ConfigError> {
        let entry = self.entry(name, VariableKind::Actuator)?;
        Ok(ActuatorVariable {
            cell: entry.shared.clone(),
        })
    }

    fn entry(&self, name: &str, expected: VariableKind) -> Result<&Entry, ConfigError> {
        let entry = self
            .inner
            .cells
            .get(name)
            .ok_or_else(|| ConfigError::UnknownVariable(name.to_string()))?;
        if entry.kind != expected {
            return Err(ConfigError::WrongKind {
                name: name.to_string(),
                expected,
                actual: entry.kind,
            });
        }
        Ok(entry)
    }

    /// Values of all controller parameters, for handing to the controller at start-up.
    pub fn controller_parameters(&self) -> ValueMap {
        self.snapshot(|e| e.kind == VariableKind::ControllerParameter)
    }

    /// Values of every variable flagged for recording. Each read is atomic per variable only.
    pub fn recorded_values(&self) -> ValueMap {
        self.snapshot(|e| e.record)
    }

    fn snapshot(&self, filter: impl Fn(&Entry) -> bool) -> ValueMap {
        self.inner
            .cells
            .iter()
            .filter(|(_, e)| filter(e))
            .map(|(n, e)| (n.clone(), e.shared.get()))
            .collect()
    }

    /// Evaluates every validity predicate and returns the variables that failed, in name order.
    pub fn check_all(&self) -> Vec<CheckFailure> {
        let mut failed = Vec::new();
        for (name, entry) in &self.inner.cells {
            if entry.checks.is_empty() {
                continue;
            }
            let value = entry.shared.get();
            if entry.checks.iter().any(|check| !check(&value)) {
                failed.push(CheckFailure {
                    variable: name.clone(),
                    value,
                });
            }
        }
        failed
    }
}
