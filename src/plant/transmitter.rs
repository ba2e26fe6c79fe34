//! transmitter.rs
//! Outbound sample path of the plant.
//!
//! - The tick loop hands a batch to `Transmitter::transmit`: a non-blocking `try_send` on a bounded
//!   crossbeam channel. A full channel drops the batch and counts it.
//! - A sender thread owns the socket side: encodes, sends to the controller and remembers the send
//!   time of each sequence number so actuation replies can be matched for round-trip time.

use std::{
    collections::VecDeque,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::net::protocol::{Batch, BatchKind};
use crate::utils::metrics::{Event, RecorderHandle};

const SEND_LOG_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Transmitter {
    tx: Sender<Batch>,
    dropped: Arc<AtomicU64>,
}

impl Transmitter {
    /// Creates a transmitter and the receiving end its batches come out of.
    pub fn channel(capacity: usize) -> (Self, Receiver<Batch>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Non-blocking hand-off. Returns false if the batch was dropped.
    pub fn transmit(&self, batch: Batch) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(err) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 1_000 == 0 {
                    warn!("[Transmitter] outbound queue unavailable, {} batches dropped so far", n);
                }
                debug!("[Transmitter] try_send failed: {:?}", err);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Send times of recent sample batches, keyed by sequence number.
#[derive(Clone, Default)]
pub struct SendLog {
    entries: Arc<Mutex<VecDeque<(u64, Instant)>>>,
}

impl SendLog {
    pub fn note(&self, seq: u64, at: Instant) {
        let mut entries = self.entries.lock();
        if entries.len() == SEND_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back((seq, at));
    }

    /// Time since the sample batch `seq` was sent, if it is still remembered.
    pub fn round_trip(&self, seq: u64) -> Option<std::time::Duration> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .find(|(s, _)| *s == seq)
            .map(|(_, at)| at.elapsed())
    }
}

/// Spawns the thread that drains the outbound channel onto the socket.
/// Exits when every `Transmitter` clone is dropped.
pub fn spawn_sender(
    socket: UdpSocket,
    rx: Receiver<Batch>,
    controller: SocketAddr,
    recorder: RecorderHandle,
    send_log: SendLog,
    epoch: Instant,
) -> std::io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("plant-sender".into())
        .spawn(move || {
            let mut sent = 0u64;
            while let Ok(batch) = rx.recv() {
                let bytes = match batch.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("[Transmitter] dropping sample batch {}: {}", batch.seq, e);
                        continue;
                    }
                };
                let delivered = match socket.send_to(&bytes, controller) {
                    Ok(_) => {
                        send_log.note(batch.seq, Instant::now());
                        sent += 1;
                        true
                    }
                    Err(e) => {
                        debug!("[Transmitter] send_to {} failed: {}", controller, e);
                        false
                    }
                };
                recorder.emit(Event::BatchSent {
                    kind: BatchKind::Sample,
                    seq: batch.seq,
                    ts_ns: epoch.elapsed().as_nanos() as u64,
                    size: bytes.len(),
                    delivered,
                });
            }
            debug!("[Transmitter] sender stopped after {} batches", sent);
            sent
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::variable::ValueMap;

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, rx) = Transmitter::channel(2);
        for seq in 1..=5 {
            tx.transmit(Batch::new(BatchKind::Sample, seq, ValueMap::new()));
        }
        assert_eq!(tx.dropped(), 3);
        let seqs: Vec<u64> = rx.try_iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn send_log_forgets_oldest_entries() {
        let log = SendLog::default();
        for seq in 0..(SEND_LOG_CAPACITY as u64 + 10) {
            log.note(seq, Instant::now());
        }
        assert!(log.round_trip(5).is_none());
        assert!(log.round_trip(SEND_LOG_CAPACITY as u64 + 9).is_some());
    }
}
