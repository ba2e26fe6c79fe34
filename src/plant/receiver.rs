//! receiver.rs
//! Inbound actuation path of the plant.
//! - Runs on its own thread, concurrently with the tick loop; never touches the tick schedule.
//! - Malformed, misdirected and stale datagrams are dropped and logged, never fatal.
//! - An actuator write-path failure halts the plant through the stop signal.

use std::{
    net::{SocketAddr, UdpSocket},
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{debug, error, warn};

use crate::error::HaltCause;
use crate::net::{
    protocol::{Batch, BatchKind, MAX_DATAGRAM},
    socket::is_timeout,
};
use crate::plant::actuator::{ActuatorBank, Delivery};
use crate::plant::transmitter::SendLog;
use crate::utils::{
    metrics::{Event, RecorderHandle},
    shutdown::StopSignal,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub datagrams: u64,
    pub accepted: u64,
    pub stale: u64,
    pub malformed: u64,
    pub foreign: u64,
}

pub struct ActuationReceiver {
    socket: UdpSocket,
    controller: SocketAddr,
    bank: ActuatorBank,
    stop: StopSignal,
    recorder: RecorderHandle,
    send_log: SendLog,
    epoch: Instant,
}

impl ActuationReceiver {
    pub fn new(
        socket: UdpSocket,
        controller: SocketAddr,
        bank: ActuatorBank,
        stop: StopSignal,
        recorder: RecorderHandle,
        send_log: SendLog,
        epoch: Instant,
    ) -> Self {
        Self {
            socket,
            controller,
            bank,
            stop,
            recorder,
            send_log,
            epoch,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<ReceiveStats>> {
        thread::Builder::new()
            .name("plant-receiver".into())
            .spawn(move || self.run())
    }

    /// Receives until the stop signal is set. The socket read timeout bounds the reaction time.
    pub fn run(self) -> ReceiveStats {
        let mut stats = ReceiveStats::default();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while self.stop.is_running() {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!("[Receiver] recv_from failed: {}", e);
                    continue;
                }
            };
            stats.datagrams += 1;

            if src != self.controller {
                stats.foreign += 1;
                debug!("[Receiver] ignoring datagram from {} (controller is {})", src, self.controller);
                continue;
            }

            let batch = match Batch::decode_kind(&buf[..len], BatchKind::Actuation) {
                Ok(b) => b,
                Err(e) => {
                    stats.malformed += 1;
                    warn!("[Receiver] dropping datagram from {}: {}", src, e);
                    continue;
                }
            };

            match self.bank.deliver(&batch) {
                Ok(Delivery::Accepted { .. }) => {
                    stats.accepted += 1;
                    let rtt_us = self.send_log.round_trip(batch.seq).map(|d| d.as_micros() as u64);
                    self.record(&batch, len, true, rtt_us);
                }
                Ok(Delivery::Stale { seq, last }) => {
                    stats.stale += 1;
                    warn!("[Receiver] stale actuation batch {} (last accepted {}), dropped", seq, last);
                    self.record(&batch, len, false, None);
                }
                Err(failure) => {
                    error!(
                        "[Receiver] actuator '{}' failed on batch {}: {:#}",
                        failure.variable, failure.seq, failure.source
                    );
                    self.stop.halt(HaltCause::UserLogic {
                        component: format!("actuator '{}'", failure.variable),
                        message: format!("batch {}: {:#}", failure.seq, failure.source),
                    });
                    break;
                }
            }
        }

        debug!("[Receiver] stopped: {:?}", stats);
        stats
    }

    fn record(&self, batch: &Batch, size: usize, accepted: bool, rtt_us: Option<u64>) {
        self.recorder.emit(Event::BatchReceived {
            kind: batch.kind,
            seq: batch.seq,
            ts_ns: self.epoch.elapsed().as_nanos() as u64,
            size,
            accepted,
            rtt_us,
        });
    }
}
