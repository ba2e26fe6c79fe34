//! Event recording for the tick loop and the transport.
//!
//! The core hands every event to a `Recorder` synchronously and never lets a recorder
//! failure reach the control loop: failures are logged (rate-limited) and swallowed.
//!
//! - **CsvRecorder:** lock-free bounded queue → background thread → CSV file.
//!   `record()` never blocks; a full queue drops the event and counts it.
//! - **MemoryRecorder:** keeps events in memory, for tests and short experiments.
//! - **NullRecorder:** discards everything.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::net::protocol::BatchKind;
use crate::plant::variable::{Value, ValueMap};

const EVENT_QUEUE_CAPACITY: usize = 16_384;
const CONSUMER_POLL_MS: u64 = 5;
const FLUSH_BATCHES: usize = 8;
const WARN_EVERY: u64 = 1_000;

/// Timing and value events emitted by the plant and the controller.
/// `ts_ns` is measured from the start of the run that emitted the event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// One plant tick completed.
    Tick {
        tick: u64,
        ts_ns: u64,
        dt_ns: u64,
        /// Nominal periods covered by this tick (>1 after an overrun).
        elapsed_ticks: u64,
        overrun: bool,
    },
    /// A sensor fired on this tick.
    SensorSample {
        tick: u64,
        ts_ns: u64,
        variable: String,
        raw: Value,
        sampled: Value,
    },
    /// Values of recorded variables after the tick.
    Variables { tick: u64, ts_ns: u64, values: ValueMap },
    /// A batch left this side of the link (or was dropped before leaving).
    BatchSent {
        kind: BatchKind,
        seq: u64,
        ts_ns: u64,
        size: usize,
        delivered: bool,
    },
    /// A batch arrived; `accepted` is false for stale batches.
    BatchReceived {
        kind: BatchKind,
        seq: u64,
        ts_ns: u64,
        size: usize,
        accepted: bool,
        rtt_us: Option<u64>,
    },
    /// The control law processed one sample batch.
    ControlCycle { seq: u64, ts_ns: u64, process_us: u64 },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("event queue is full")]
    QueueFull,
    #[error("recorder is closed")]
    Closed,
}

pub trait Recorder: Send + Sync {
    fn record(&self, event: Event) -> Result<(), RecordError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&self, _event: Event) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Keeps all events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn ticks(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Tick { .. }))
            .cloned()
            .collect()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, event: Event) -> Result<(), RecordError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Wraps a recorder so failures are logged and swallowed.
#[derive(Clone)]
pub struct RecorderHandle {
    inner: Arc<dyn Recorder>,
    failures: Arc<AtomicU64>,
}

impl RecorderHandle {
    pub fn new(inner: Arc<dyn Recorder>) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullRecorder))
    }

    #[inline]
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.inner.record(event) {
            let n = self.failures.fetch_add(1, Ordering::Relaxed);
            if n % WARN_EVERY == 0 {
                warn!("[Recorder] failed to record event ({} failures so far): {}", n + 1, e);
            }
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    index: u64,
    component: &'a str,
    event: &'a str,
    ts_ns: u64,
    name: String,
    value: String,
    extra: String,
}

fn fmt_opt(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Flattens one event into CSV rows (variable snapshots produce one row per variable).
fn rows(event: &Event) -> Vec<CsvRow<'static>> {
    match event {
        Event::Tick {
            tick,
            ts_ns,
            dt_ns,
            elapsed_ticks,
            overrun,
        } => vec![CsvRow {
            index: *tick,
            component: "plant",
            event: "tick",
            ts_ns: *ts_ns,
            name: String::new(),
            value: dt_ns.to_string(),
            extra: format!("elapsed_ticks={};overrun={}", elapsed_ticks, overrun),
        }],
        Event::SensorSample {
            tick,
            ts_ns,
            variable,
            raw,
            sampled,
        } => vec![CsvRow {
            index: *tick,
            component: "sensor",
            event: "sample",
            ts_ns: *ts_ns,
            name: variable.clone(),
            value: sampled.to_string(),
            extra: format!("raw={}", raw),
        }],
        Event::Variables { tick, ts_ns, values } => values
            .iter()
            .map(|(name, value)| CsvRow {
                index: *tick,
                component: "plant",
                event: "variable",
                ts_ns: *ts_ns,
                name: name.clone(),
                value: value.to_string(),
                extra: String::new(),
            })
            .collect(),
        Event::BatchSent {
            kind,
            seq,
            ts_ns,
            size,
            delivered,
        } => vec![CsvRow {
            index: *seq,
            component: "transport",
            event: "batch_sent",
            ts_ns: *ts_ns,
            name: kind.as_str().to_string(),
            value: size.to_string(),
            extra: format!("delivered={}", delivered),
        }],
        Event::BatchReceived {
            kind,
            seq,
            ts_ns,
            size,
            accepted,
            rtt_us,
        } => vec![CsvRow {
            index: *seq,
            component: "transport",
            event: "batch_received",
            ts_ns: *ts_ns,
            name: kind.as_str().to_string(),
            value: size.to_string(),
            extra: format!("accepted={};rtt_us={}", accepted, fmt_opt(*rtt_us)),
        }],
        Event::ControlCycle { seq, ts_ns, process_us } => vec![CsvRow {
            index: *seq,
            component: "controller",
            event: "control_cycle",
            ts_ns: *ts_ns,
            name: String::new(),
            value: process_us.to_string(),
            extra: String::new(),
        }],
    }
}

/// Non-blocking recorder with a background CSV writer.
///
/// Capacity: 16K events. The writer thread drains the queue every 5 ms and flushes every
/// few batches; `close()` drains what is left and flushes before returning.
pub struct CsvRecorder {
    queue: Arc<ArrayQueue<Event>>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl CsvRecorder {
    /// Creates `path` (and its parent directory) and starts the writer thread.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;

        let queue = Arc::new(ArrayQueue::new(EVENT_QUEUE_CAPACITY));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let queue = queue.clone();
            let running = running.clone();
            let path_for_log = path.clone();
            thread::Builder::new()
                .name("csv-recorder".into())
                .spawn(move || write_loop(file, queue, running, path_for_log))?
        };

        Ok(Self {
            queue,
            running,
            dropped: Arc::new(AtomicU64::new(0)),
            writer: Mutex::new(Some(handle)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the writer after draining the queue. Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("[Recorder] CSV writer thread panicked ({})", self.path.display());
            }
        }
    }
}

impl Recorder for CsvRecorder {
    fn record(&self, event: Event) -> Result<(), RecordError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RecordError::Closed);
        }
        self.queue.push(event).map_err(|_| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            RecordError::QueueFull
        })
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_loop(file: File, queue: Arc<ArrayQueue<Event>>, running: Arc<AtomicBool>, path: PathBuf) {
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    let mut flush_counter = 0usize;

    let write_event = |wtr: &mut csv::Writer<BufWriter<File>>, event: &Event| {
        for row in rows(event) {
            if let Err(e) = wtr.serialize(&row) {
                error!("[Recorder] failed to write {}: {}", path.display(), e);
            }
        }
    };

    while running.load(Ordering::Acquire) {
        let mut any = false;
        while let Some(event) = queue.pop() {
            write_event(&mut wtr, &event);
            any = true;
        }
        if any {
            flush_counter += 1;
            if flush_counter >= FLUSH_BATCHES {
                wtr.flush().ok();
                flush_counter = 0;
            }
        } else {
            thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
        }
    }

    // Final drain
    while let Some(event) = queue.pop() {
        write_event(&mut wtr, &event);
    }
    wtr.flush().ok();
    debug!("[Recorder] CSV writer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl Recorder for Failing {
        fn record(&self, _event: Event) -> Result<(), RecordError> {
            Err(RecordError::Closed)
        }
    }

    fn tick(n: u64) -> Event {
        Event::Tick {
            tick: n,
            ts_ns: n * 5_000_000,
            dt_ns: 5_000_000,
            elapsed_ticks: 1,
            overrun: false,
        }
    }

    #[test]
    fn failing_recorder_is_swallowed_and_counted() {
        let handle = RecorderHandle::new(Arc::new(Failing));
        for n in 0..10 {
            handle.emit(tick(n));
        }
        assert_eq!(handle.failures(), 10);
    }

    #[test]
    fn csv_recorder_writes_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.csv");
        let recorder = CsvRecorder::create(&path).unwrap();

        recorder.record(tick(0)).unwrap();
        let mut values = ValueMap::new();
        values.insert("speed".into(), Value::Float(1.0));
        values.insert("accel".into(), Value::Float(0.5));
        recorder
            .record(Event::Variables {
                tick: 0,
                ts_ns: 1,
                values,
            })
            .unwrap();
        recorder.close();
        assert!(matches!(recorder.record(tick(1)), Err(RecordError::Closed)));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "index,component,event,ts_ns,name,value,extra");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,plant,tick,0,,5000000,"));
        assert!(content.contains("variable,1,accel,0.5"));
        assert!(content.contains("variable,1,speed,1"));
    }

    #[test]
    fn memory_recorder_filters_ticks() {
        let rec = MemoryRecorder::new();
        rec.record(tick(0)).unwrap();
        rec.record(Event::ControlCycle {
            seq: 1,
            ts_ns: 0,
            process_us: 3,
        })
        .unwrap();
        assert_eq!(rec.events().len(), 2);
        assert_eq!(rec.ticks(), vec![tick(0)]);
    }
}
