//! Plant: the emulated physical process.
//!
//! One tick of the loop, in order:
//! 1. `State::advance(dt)` with the measured time since the previous tick
//! 2. due sensors sample their variables; the samples leave as one batch (non-blocking)
//! 3. every actuator's read path runs once and its value lands in the actuator variable
//! 4. tick timing and recorded variables go to the recorder
//! 5. validity predicates run; any failure halts the plant
//!
//! Actuation batches arrive on a separate receive thread (`link`) and only ever touch the
//! actuators' write paths.

pub mod actuator;
pub mod clock;
pub mod link;
pub mod receiver;
pub mod sensor;
pub mod transmitter;
pub mod variable;

use std::{
    collections::BTreeSet,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::config::PlantConfig;
use crate::error::{ConfigError, EmulationError, HaltCause};
use crate::net::protocol::{Batch, BatchKind};
use crate::utils::{
    metrics::{Event, RecorderHandle},
    shutdown::StopSignal,
};

use actuator::{Actuator, ActuatorBank};
use clock::{Tick, TickClock};
use sensor::{ScheduledSensor, Sensor};
use transmitter::Transmitter;
use variable::{ValueMap, VariableKind, VariableStore};

/// The physical model.
pub trait State: Send {
    /// Called once before the first tick.
    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Advances the model by `dt`, the measured wall-clock time since the previous tick.
    fn advance(&mut self, dt: Duration) -> anyhow::Result<()>;

    /// Called exactly once when the plant stops, whatever the reason.
    fn shutdown(&mut self) {}
}

/// Summary of a plant run that ended without a fault.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantReport {
    pub ticks: u64,
    pub overruns: u64,
    pub samples: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub elapsed: Duration,
}

pub struct PlantBuilder {
    store: VariableStore,
    state: Box<dyn State>,
    tick_rate_hz: u32,
    duration: Option<Duration>,
    sensors: Vec<(String, u32, Box<dyn Sensor>)>,
    actuators: Vec<(String, Box<dyn Actuator>)>,
    recorder: RecorderHandle,
    pin_core: Option<usize>,
}

impl PlantBuilder {
    pub fn tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Binds `sensor` to the sensor variable `variable`, sampling at `hz`.
    pub fn sensor(mut self, variable: &str, hz: u32, sensor: Box<dyn Sensor>) -> Self {
        self.sensors.push((variable.to_string(), hz, sensor));
        self
    }

    /// Binds `actuator` to the actuator variable `variable`.
    pub fn actuator(mut self, variable: &str, actuator: Box<dyn Actuator>) -> Self {
        self.actuators.push((variable.to_string(), actuator));
        self
    }

    pub fn recorder(mut self, recorder: RecorderHandle) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn pin_core(mut self, core: Option<usize>) -> Self {
        self.pin_core = core;
        self
    }

    /// Applies tick rate, duration and core pinning from a run configuration.
    pub fn configure(mut self, config: &PlantConfig) -> Self {
        self.tick_rate_hz = config.tick_rate_hz;
        self.duration = config.duration();
        self.pin_core = config.pin_core;
        self
    }

    /// Resolves every binding against the variable store. Nothing runs yet.
    pub fn build(self) -> Result<Plant, ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::InvalidTickRate);
        }
        if let Some(d) = self.duration {
            if d.is_zero() {
                return Err(ConfigError::InvalidDuration(0.0));
            }
        }

        let mut seen = BTreeSet::new();
        let mut sensors = Vec::with_capacity(self.sensors.len());
        for (name, hz, sensor) in self.sensors {
            let variable = self.store.sensor(&name)?;
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateBinding {
                    kind: "sensor",
                    variable: name,
                });
            }
            sensors.push(ScheduledSensor::new(variable, hz, self.tick_rate_hz, sensor)?);
        }
        for name in self.store.names(VariableKind::Sensor) {
            if !seen.contains(&name) {
                warn!("[Plant] sensor variable '{}' has no sensor and will never be sent", name);
            }
        }

        let mut bound = Vec::with_capacity(self.actuators.len());
        for (name, actuator) in self.actuators {
            bound.push((self.store.actuator(&name)?, actuator));
        }
        let actuators = ActuatorBank::new(bound)?;
        for name in self.store.names(VariableKind::Actuator) {
            if !actuators.names().any(|n| n == name) {
                return Err(ConfigError::MissingActuator(name));
            }
        }

        Ok(Plant {
            store: self.store,
            state: self.state,
            sensors,
            actuators,
            tick_rate_hz: self.tick_rate_hz,
            duration: self.duration,
            recorder: self.recorder,
            stop: StopSignal::new(),
            transmitter: None,
            pin_core: self.pin_core,
            epoch: Instant::now(),
            shut_down: false,
        })
    }
}

pub struct Plant {
    store: VariableStore,
    state: Box<dyn State>,
    sensors: Vec<ScheduledSensor>,
    actuators: ActuatorBank,
    tick_rate_hz: u32,
    duration: Option<Duration>,
    recorder: RecorderHandle,
    stop: StopSignal,
    transmitter: Option<Transmitter>,
    pin_core: Option<usize>,
    epoch: Instant,
    shut_down: bool,
}

/// A plant running on its own thread.
pub struct PlantHandle {
    join: JoinHandle<Result<PlantReport, EmulationError>>,
    stop: StopSignal,
    actuators: ActuatorBank,
}

impl PlantHandle {
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn actuators(&self) -> ActuatorBank {
        self.actuators.clone()
    }

    /// Requests a stop and waits for the tick loop to finish its shutdown.
    pub fn stop(self) -> Result<PlantReport, EmulationError> {
        self.stop.stop();
        self.join()
    }

    pub fn join(self) -> Result<PlantReport, EmulationError> {
        self.join.join().unwrap_or_else(|_| {
            Err(EmulationError::Halted(HaltCause::UserLogic {
                component: "plant".into(),
                message: "tick thread panicked".into(),
            }))
        })
    }
}

impl Plant {
    pub fn builder(store: VariableStore, state: Box<dyn State>) -> PlantBuilder {
        PlantBuilder {
            store,
            state,
            tick_rate_hz: 100,
            duration: None,
            sensors: Vec::new(),
            actuators: Vec::new(),
            recorder: RecorderHandle::null(),
            pin_core: None,
        }
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn actuators(&self) -> ActuatorBank {
        self.actuators.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn recorder(&self) -> RecorderHandle {
        self.recorder.clone()
    }

    /// Reference instant for event timestamps.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    /// Routes sample batches to `transmitter`. Without one, samples are recorded but not sent.
    pub fn attach_transmitter(&mut self, transmitter: Transmitter) {
        self.transmitter = Some(transmitter);
    }

    /// Runs the tick loop on a max-priority thread.
    pub fn spawn(self) -> std::io::Result<PlantHandle> {
        let stop = self.stop.clone();
        let actuators = self.actuators.clone();
        let join = thread::Builder::new()
            .name("plant-tick".into())
            .spawn_with_priority(ThreadPriority::Max, move |priority| {
                if let Err(e) = priority {
                    debug!("[Plant] running tick thread at default priority: {:?}", e);
                }
                self.run()
            })?;
        Ok(PlantHandle { join, stop, actuators })
    }

    /// Runs until the configured duration elapses, the stop signal is set, or a fault halts the
    /// plant. Every shutdown hook runs exactly once before this returns.
    pub fn run(mut self) -> Result<PlantReport, EmulationError> {
        self.pin_to_core();
        info!(
            "[Plant] starting: {} Hz, {} sensors, {} actuators, duration {:?}",
            self.tick_rate_hz,
            self.sensors.len(),
            self.actuators.len(),
            self.duration
        );

        let mut report = PlantReport::default();
        let outcome = self.run_loop(&mut report);

        match &outcome {
            Ok(()) => {
                self.stop.stop();
            }
            Err(e) => {
                self.stop.halt(halt_cause(e));
            }
        }
        // Closes the outbound channel so the sender thread drains and exits.
        if let Some(tx) = self.transmitter.take() {
            report.batches_dropped = tx.dropped();
        }
        self.shutdown();

        let outcome = outcome.and_then(|()| match self.stop.cause() {
            Some(HaltCause::Stopped) | None => Ok(()),
            Some(cause) => Err(EmulationError::Halted(cause)),
        });

        match outcome {
            Ok(()) => {
                info!(
                    "[Plant] finished: {} ticks in {:.3}s, {} overruns, {} batches sent, {} dropped",
                    report.ticks,
                    report.elapsed.as_secs_f64(),
                    report.overruns,
                    report.batches_sent,
                    report.batches_dropped
                );
                Ok(report)
            }
            Err(e) => {
                error!("[Plant] halted after {} ticks: {}", report.ticks, e);
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, report: &mut PlantReport) -> Result<(), EmulationError> {
        self.state
            .initialize()
            .map_err(|e| EmulationError::user_logic("state", "initialize", e))?;

        let mut clock = TickClock::start(self.tick_rate_hz);
        let mut seq = 0u64;

        let result = loop {
            if !self.stop.is_running() {
                break Ok(());
            }
            if let Some(limit) = self.duration {
                if clock.next_tick_offset() >= limit {
                    break Ok(());
                }
            }

            let tick = clock.wait();
            if let Err(e) = self.tick(&tick, &mut seq, report) {
                break Err(e);
            }
        };

        report.ticks = clock.ticks();
        report.overruns = clock.overruns();
        report.elapsed = clock.started_at().elapsed();
        result
    }

    fn tick(&mut self, tick: &Tick, seq: &mut u64, report: &mut PlantReport) -> Result<(), EmulationError> {
        let ts_ns = self.epoch.elapsed().as_nanos() as u64;

        self.state
            .advance(tick.dt)
            .map_err(|e| EmulationError::user_logic("state", format!("advance at tick {}", tick.index), e))?;

        let mut values = ValueMap::new();
        for sensor in &mut self.sensors {
            if !sensor.advance(tick.elapsed_ticks) {
                continue;
            }
            let sample = sensor.sample().map_err(|e| {
                EmulationError::user_logic(format!("sensor '{}'", sensor.name()), format!("tick {}", tick.index), e)
            })?;
            self.recorder.emit(Event::SensorSample {
                tick: tick.index,
                ts_ns,
                variable: sample.variable.clone(),
                raw: sample.raw,
                sampled: sample.processed.clone(),
            });
            values.insert(sample.variable, sample.processed);
            report.samples += 1;
        }

        if !values.is_empty() {
            *seq += 1;
            if let Some(tx) = &self.transmitter {
                if tx.transmit(Batch::new(BatchKind::Sample, *seq, values)) {
                    report.batches_sent += 1;
                }
            }
        }

        self.actuators.apply_all().map_err(|(name, e)| {
            EmulationError::user_logic(format!("actuator '{}'", name), format!("tick {}", tick.index), e)
        })?;

        // The halting tick is recorded too.
        self.recorder.emit(Event::Tick {
            tick: tick.index,
            ts_ns,
            dt_ns: tick.dt.as_nanos() as u64,
            elapsed_ticks: tick.elapsed_ticks,
            overrun: tick.overrun,
        });
        let recorded = self.store.recorded_values();
        if !recorded.is_empty() {
            self.recorder.emit(Event::Variables {
                tick: tick.index,
                ts_ns,
                values: recorded,
            });
        }

        let failures = self.store.check_all();
        if let Some(first) = failures.first() {
            for failure in &failures {
                error!(
                    "[Plant] tick {}: variable '{}' failed its validity check (value {})",
                    tick.index, failure.variable, failure.value
                );
            }
            return Err(EmulationError::InvalidVariable {
                variable: first.variable.clone(),
                value: first.value.clone(),
                tick: tick.index,
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        debug!("[Plant] running shutdown hooks");
        for sensor in &mut self.sensors {
            debug!("[Plant] sensor '{}' ({} Hz) sampled {} times", sensor.name(), sensor.frequency_hz(), sensor.fired());
            sensor.shutdown();
        }
        self.actuators.shutdown();
        self.state.shutdown();
    }

    fn pin_to_core(&self) {
        let Some(core) = self.pin_core else {
            return;
        };
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        match core_ids.get(core) {
            Some(core_id) if core_affinity::set_for_current(*core_id) => {
                info!("[Plant] tick loop pinned to core {}", core);
            }
            _ => warn!("[Plant] could not pin tick loop to core {}", core),
        }
    }
}

/// A plant dropped without running (failed link setup, failed thread spawn) still stops its link
/// and runs every shutdown hook once.
impl Drop for Plant {
    fn drop(&mut self) {
        if !self.shut_down {
            debug!("[Plant] dropped before running");
            self.stop.stop();
            self.transmitter.take();
            self.shutdown();
        }
    }
}

fn halt_cause(err: &EmulationError) -> HaltCause {
    match err {
        EmulationError::InvalidVariable { variable, value, .. } => HaltCause::InvalidVariable {
            variable: variable.clone(),
            value: value.clone(),
        },
        EmulationError::UserLogic { component, context, source } => HaltCause::UserLogic {
            component: component.clone(),
            message: format!("{}: {:#}", context, source),
        },
        EmulationError::Halted(cause) => cause.clone(),
        other => HaltCause::UserLogic {
            component: "plant".into(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::actuator::ConstantActuator;
    use crate::plant::sensor::SimpleSensor;
    use crate::plant::variable::{ActuatorVariable, SensorVariable};

    struct Idle;
    impl State for Idle {
        fn advance(&mut self, _dt: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn store() -> (VariableStore, SensorVariable, ActuatorVariable) {
        let mut b = VariableStore::builder();
        let pos = b.sensor("pos", 0.0);
        let force = b.actuator("force", 0.0);
        (b.build().unwrap(), pos, force)
    }

    #[test]
    fn unbound_actuator_variable_is_a_config_error() {
        let (store, _, _) = store();
        let err = Plant::builder(store, Box::new(Idle)).build().err();
        assert!(matches!(err, Some(ConfigError::MissingActuator(name)) if name == "force"));
    }

    #[test]
    fn sensor_bound_to_actuator_variable_is_rejected() {
        let (store, _, _) = store();
        let err = Plant::builder(store, Box::new(Idle))
            .sensor("force", 10, Box::new(SimpleSensor))
            .actuator("force", Box::new(ConstantActuator::new(0.0)))
            .build()
            .err();
        assert!(matches!(err, Some(ConfigError::WrongKind { .. })));
    }

    #[test]
    fn sensor_rate_is_checked_against_tick_rate() {
        let (store, _, _) = store();
        let err = Plant::builder(store, Box::new(Idle))
            .tick_rate(100)
            .sensor("pos", 30, Box::new(SimpleSensor))
            .actuator("force", Box::new(ConstantActuator::new(0.0)))
            .build()
            .err();
        assert!(matches!(err, Some(ConfigError::SensorNotSubMultiple { .. })));
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let (store, _, _) = store();
        let err = Plant::builder(store, Box::new(Idle)).tick_rate(0).build().err();
        assert!(matches!(err, Some(ConfigError::InvalidTickRate)));
    }

    #[test]
    fn duplicate_sensor_binding_is_rejected() {
        let (store, _, _) = store();
        let err = Plant::builder(store, Box::new(Idle))
            .sensor("pos", 10, Box::new(SimpleSensor))
            .sensor("pos", 20, Box::new(SimpleSensor))
            .actuator("force", Box::new(ConstantActuator::new(0.0)))
            .build()
            .err();
        assert!(matches!(err, Some(ConfigError::DuplicateBinding { kind: "sensor", .. })));
    }

    #[test]
    fn samples_are_batched_with_increasing_sequence_numbers() {
        let (store, pos, _) = store();
        let mut plant = Plant::builder(store, Box::new(Idle))
            .tick_rate(100)
            .duration(Duration::from_millis(100))
            .sensor("pos", 50, Box::new(SimpleSensor))
            .actuator("force", Box::new(ConstantActuator::new(0.0)))
            .build()
            .unwrap();
        let (tx, rx) = Transmitter::channel(64);
        plant.attach_transmitter(tx);
        pos.set(2.5);

        let report = plant.run().unwrap();
        // 10 on schedule; an overrun on a loaded machine shifts the schedule.
        assert!((8..=10).contains(&report.ticks), "ticks={}", report.ticks);
        assert!(report.samples >= 4 && report.samples <= 5);
        assert_eq!(report.batches_sent, report.samples);

        let batches: Vec<Batch> = rx.try_iter().collect();
        let seqs: Vec<u64> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, (1..=report.samples).collect::<Vec<u64>>());
        assert!(batches.iter().all(|b| b.kind == BatchKind::Sample));
        assert_eq!(batches[0].values.get("pos"), Some(&variable::Value::Float(2.5)));
    }
}
