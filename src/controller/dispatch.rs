//! dispatch.rs
//! Runs the control law one sample batch at a time.
//!
//! - `LatestSlot`: single-element latest-wins hand-off between the receive thread and the
//!   dispatch loop. A batch arriving while the law runs replaces any batch still waiting.
//! - `Dispatcher`: calls the law, drops actuator names it is not configured to forward and
//!   records the processing time of each cycle.

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::controller::Controller;
use crate::error::EmulationError;
use crate::net::protocol::Batch;
use crate::plant::variable::ValueMap;
use crate::utils::metrics::{Event, RecorderHandle};

pub struct LatestSlot<T> {
    value: Mutex<SlotState<T>>,
    ready: Condvar,
}

struct SlotState<T> {
    latest: Option<T>,
    closed: bool,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(SlotState {
                latest: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any value not yet taken. Returns true if one was replaced.
    pub fn put(&self, value: T) -> bool {
        let mut state = self.value.lock();
        let replaced = state.latest.replace(value).is_some();
        self.ready.notify_one();
        replaced
    }

    /// Takes the latest value, waiting up to `timeout` for one. `None` on timeout or once closed
    /// and empty.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.value.lock();
        loop {
            if let Some(v) = state.latest.take() {
                return Some(v);
            }
            if state.closed {
                return None;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state.latest.take();
            }
        }
    }

    /// Wakes any waiter; later `take_timeout` calls only drain what is left.
    pub fn close(&self) {
        self.value.lock().closed = true;
        self.ready.notify_all();
    }
}

pub struct Dispatcher {
    controller: Box<dyn Controller>,
    forward: BTreeSet<String>,
    recorder: RecorderHandle,
    epoch: Instant,
    cycles: u64,
    dropped_names: u64,
    shut_down: bool,
}

impl Dispatcher {
    /// `forward` lists the actuator names replies may carry; empty forwards every name.
    pub fn new(controller: Box<dyn Controller>, forward: &[String], recorder: RecorderHandle) -> Self {
        Self {
            controller,
            forward: forward.iter().cloned().collect(),
            recorder,
            epoch: Instant::now(),
            cycles: 0,
            dropped_names: 0,
            shut_down: false,
        }
    }

    pub fn set_recorder(&mut self, recorder: RecorderHandle, epoch: Instant) {
        self.recorder = recorder;
        self.epoch = epoch;
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn dropped_names(&self) -> u64 {
        self.dropped_names
    }

    /// Runs the control law on `sample` and builds the actuation reply.
    pub fn cycle(&mut self, sample: &Batch) -> Result<Batch, EmulationError> {
        let started = Instant::now();
        let commands = self
            .controller
            .process(&sample.values)
            .map_err(|e| EmulationError::user_logic("controller", format!("sample batch {}", sample.seq), e))?;
        let process_us = started.elapsed().as_micros() as u64;

        let commands = self.filter(sample.seq, commands);
        self.cycles += 1;
        self.recorder.emit(Event::ControlCycle {
            seq: sample.seq,
            ts_ns: self.epoch.elapsed().as_nanos() as u64,
            process_us,
        });
        Ok(sample.reply(commands))
    }

    fn filter(&mut self, seq: u64, commands: ValueMap) -> ValueMap {
        if self.forward.is_empty() {
            return commands;
        }
        let mut out = ValueMap::new();
        for (name, value) in commands {
            if self.forward.contains(&name) {
                out.insert(name, value);
            } else {
                self.dropped_names += 1;
                warn!("[Controller] batch {}: '{}' is not a forwarded actuator, dropping it", seq, name);
            }
        }
        out
    }

    /// Runs the controller's shutdown hook. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.controller.shutdown();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::BatchKind;
    use crate::plant::variable::Value;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    struct Echo {
        shutdowns: Arc<AtomicUsize>,
    }

    impl Controller for Echo {
        fn process(&mut self, samples: &ValueMap) -> anyhow::Result<ValueMap> {
            let speed = samples.get("speed").and_then(Value::as_f64).unwrap_or(0.0);
            let mut out = ValueMap::new();
            out.insert("accel".into(), Value::Float(-speed));
            out.insert("brake".into(), Value::Bool(speed > 1.0));
            Ok(out)
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample(seq: u64, speed: f64) -> Batch {
        let mut values = ValueMap::new();
        values.insert("speed".into(), Value::Float(speed));
        Batch::new(BatchKind::Sample, seq, values)
    }

    #[test]
    fn slot_keeps_only_the_latest_value() {
        let slot = LatestSlot::new();
        assert!(!slot.put(1));
        assert!(slot.put(2));
        assert!(slot.put(3));
        assert_eq!(slot.take_timeout(Duration::from_millis(1)), Some(3));
        assert_eq!(slot.take_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn slot_wakes_a_waiting_taker() {
        let slot = Arc::new(LatestSlot::new());
        let taker = {
            let slot = slot.clone();
            thread::spawn(move || slot.take_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        slot.put(7u64);
        assert_eq!(taker.join().unwrap(), Some(7));
    }

    #[test]
    fn closed_slot_returns_immediately() {
        let slot: LatestSlot<u64> = LatestSlot::new();
        slot.close();
        let started = Instant::now();
        assert_eq!(slot.take_timeout(Duration::from_secs(5)), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn reply_echoes_seq_and_drops_unforwarded_names() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut d = Dispatcher::new(
            Box::new(Echo {
                shutdowns: shutdowns.clone(),
            }),
            &["accel".to_string()],
            RecorderHandle::null(),
        );

        let reply = d.cycle(&sample(9, 2.0)).unwrap();
        assert_eq!(reply.kind, BatchKind::Actuation);
        assert_eq!(reply.seq, 9);
        assert_eq!(reply.values.len(), 1);
        assert_eq!(reply.values.get("accel"), Some(&Value::Float(-2.0)));
        assert_eq!(d.dropped_names(), 1);

        // Keeps running after dropping names.
        let reply = d.cycle(&sample(10, 0.5)).unwrap();
        assert_eq!(reply.values.get("accel"), Some(&Value::Float(-0.5)));
        assert_eq!(d.cycles(), 2);

        d.shutdown();
        d.shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_runs_the_shutdown_hook_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let d = Dispatcher::new(
            Box::new(Echo {
                shutdowns: shutdowns.clone(),
            }),
            &[],
            RecorderHandle::null(),
        );
        drop(d);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let mut d = Dispatcher::new(
            Box::new(Echo {
                shutdowns: shutdowns.clone(),
            }),
            &[],
            RecorderHandle::null(),
        );
        d.shutdown();
        drop(d);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_forward_list_passes_everything() {
        let mut d = Dispatcher::new(
            Box::new(Echo {
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }),
            &[],
            RecorderHandle::null(),
        );
        let reply = d.cycle(&sample(1, 2.0)).unwrap();
        assert_eq!(reply.values.len(), 2);
    }

    #[test]
    fn control_law_errors_carry_the_batch() {
        struct Broken;
        impl Controller for Broken {
            fn process(&mut self, _samples: &ValueMap) -> anyhow::Result<ValueMap> {
                anyhow::bail!("diverged")
            }
        }
        let mut d = Dispatcher::new(Box::new(Broken), &[], RecorderHandle::null());
        let err = d.cycle(&sample(4, 0.0)).unwrap_err();
        assert!(err.to_string().contains("sample batch 4"));
    }
}
