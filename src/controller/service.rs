//! service.rs
//! UDP front of the controller.
//!
//! - Receive thread: decode, reject stale sample batches, remember the sender, publish to the
//!   latest-wins slot. Never waits on the control law.
//! - Dispatch loop (caller's thread): take the newest batch, run the law, reply to the address
//!   the batch came from.
//! - A control-law error stops the service; the controller's shutdown hook runs exactly once.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::controller::{
    dispatch::{Dispatcher, LatestSlot},
    Controller,
};
use crate::error::{EmulationError, HaltCause};
use crate::net::{
    protocol::{Batch, BatchKind, SequenceFilter, MAX_DATAGRAM},
    socket::{bind_udp, is_timeout},
};
use crate::utils::{
    metrics::{Event, RecorderHandle},
    shutdown::StopSignal,
};

/// Counters of a finished controller run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControllerReport {
    pub datagrams: u64,
    pub accepted: u64,
    pub stale: u64,
    pub malformed: u64,
    /// Accepted batches replaced in the slot before the law got to them.
    pub coalesced: u64,
    pub cycles: u64,
    pub replies_sent: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReceiveCounters {
    datagrams: u64,
    accepted: u64,
    stale: u64,
    malformed: u64,
    coalesced: u64,
}

type Inbox = LatestSlot<(Batch, SocketAddr)>;

pub struct ControllerService {
    socket: UdpSocket,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    recorder: RecorderHandle,
    stop: StopSignal,
    poll_interval: Duration,
    epoch: Instant,
}

impl ControllerService {
    /// Binds the controller socket. The service does not receive until `run`.
    ///
    /// On failure the controller is dropped through its dispatcher, so its shutdown hook runs.
    pub fn bind(config: &ControllerConfig, controller: Box<dyn Controller>) -> Result<Self, EmulationError> {
        let dispatcher = Dispatcher::new(controller, &config.actuators, RecorderHandle::null());
        config.validate()?;
        let socket = bind_udp(config.bind_addr, config.recv_buffer_bytes, config.poll_interval())?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            dispatcher,
            recorder: RecorderHandle::null(),
            stop: StopSignal::new(),
            poll_interval: config.poll_interval(),
            epoch: Instant::now(),
        })
    }

    /// Records batches and control cycles to `recorder`.
    pub fn with_recorder(mut self, recorder: RecorderHandle) -> Self {
        self.dispatcher.set_recorder(recorder.clone(), self.epoch);
        self.recorder = recorder;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Serves until the stop signal is set or the control law fails.
    pub fn run(mut self) -> Result<ControllerReport, EmulationError> {
        info!("[Controller] listening on {}", self.local_addr);
        let inbox: Arc<Inbox> = Arc::new(LatestSlot::new());

        let receiver = match self.spawn_receiver(inbox.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.dispatcher.shutdown();
                return Err(e);
            }
        };
        let mut report = ControllerReport::default();
        let outcome = self.dispatch_loop(&inbox, &mut report);

        match &outcome {
            Ok(()) => self.stop.stop(),
            Err(e) => {
                self.stop.halt(HaltCause::UserLogic {
                    component: "controller".into(),
                    message: format!("{:#}", e),
                });
            }
        };
        inbox.close();
        let counters = receiver.join().unwrap_or_else(|_| {
            warn!("[Controller] receive thread panicked");
            ReceiveCounters::default()
        });
        self.dispatcher.shutdown();

        report.datagrams = counters.datagrams;
        report.accepted = counters.accepted;
        report.stale = counters.stale;
        report.malformed = counters.malformed;
        report.coalesced = counters.coalesced;
        report.cycles = self.dispatcher.cycles();

        match outcome {
            Ok(()) => {
                info!("[Controller] stopped: {:?}", report);
                Ok(report)
            }
            Err(e) => {
                error!("[Controller] halted after {} cycles: {}", report.cycles, e);
                Err(e)
            }
        }
    }

    fn dispatch_loop(&mut self, inbox: &Inbox, report: &mut ControllerReport) -> Result<(), EmulationError> {
        while self.stop.is_running() {
            let Some((sample, peer)) = inbox.take_timeout(self.poll_interval) else {
                continue;
            };
            let reply = self.dispatcher.cycle(&sample)?;
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("[Controller] cannot encode reply to batch {}: {}", sample.seq, e);
                    continue;
                }
            };
            match self.socket.send_to(&bytes, peer) {
                Ok(_) => {
                    report.replies_sent += 1;
                    self.recorder.emit(Event::BatchSent {
                        kind: BatchKind::Actuation,
                        seq: reply.seq,
                        ts_ns: self.epoch.elapsed().as_nanos() as u64,
                        size: bytes.len(),
                        delivered: true,
                    });
                }
                Err(e) => debug!("[Controller] send_to {} failed: {}", peer, e),
            }
        }
        Ok(())
    }

    fn spawn_receiver(&self, inbox: Arc<Inbox>) -> Result<JoinHandle<ReceiveCounters>, EmulationError> {
        let socket = self.socket.try_clone()?;
        let epoch = self.epoch;
        let stop = self.stop.clone();
        let recorder = self.recorder.clone();

        let handle = thread::Builder::new()
            .name("controller-receiver".into())
            .spawn(move || {
                let mut counters = ReceiveCounters::default();
                let mut filter = SequenceFilter::new();
                let mut buf = vec![0u8; MAX_DATAGRAM];

                while stop.is_running() {
                    let (len, src) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e) if is_timeout(&e) => continue,
                        Err(e) => {
                            warn!("[Controller] recv_from failed: {}", e);
                            continue;
                        }
                    };
                    counters.datagrams += 1;

                    let batch = match Batch::decode_kind(&buf[..len], BatchKind::Sample) {
                        Ok(b) => b,
                        Err(e) => {
                            counters.malformed += 1;
                            warn!("[Controller] dropping datagram from {}: {}", src, e);
                            continue;
                        }
                    };

                    let accepted = match filter.accept(batch.seq) {
                        Ok(()) => true,
                        Err(last) => {
                            counters.stale += 1;
                            warn!("[Controller] stale sample batch {} (last accepted {}), dropped", batch.seq, last);
                            false
                        }
                    };
                    recorder.emit(Event::BatchReceived {
                        kind: BatchKind::Sample,
                        seq: batch.seq,
                        ts_ns: epoch.elapsed().as_nanos() as u64,
                        size: len,
                        accepted,
                        rtt_us: None,
                    });
                    if !accepted {
                        continue;
                    }
                    counters.accepted += 1;
                    if inbox.put((batch, src)) {
                        counters.coalesced += 1;
                    }
                }
                debug!("[Controller] receive thread stopped");
                counters
            })?;
        Ok(handle)
    }
}
