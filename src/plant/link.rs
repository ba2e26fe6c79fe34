//! link.rs
//! UDP link between a plant and its controller.
//!
//! One socket, two threads: the sender drains the tick loop's outbound queue, the receiver feeds
//! actuation batches to the actuator bank. Both stop once the plant run ends.

use std::{net::SocketAddr, thread::JoinHandle};

use log::{info, warn};

use crate::config::PlantConfig;
use crate::error::EmulationError;
use crate::net::socket::bind_udp;
use crate::plant::{
    receiver::{ActuationReceiver, ReceiveStats},
    transmitter::{spawn_sender, SendLog, Transmitter},
    Plant,
};

pub struct PlantLink {
    local_addr: SocketAddr,
    sender: JoinHandle<u64>,
    receiver: JoinHandle<ReceiveStats>,
}

/// Traffic counters of a finished link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub received: ReceiveStats,
}

impl PlantLink {
    /// Binds the plant socket and attaches the link to `plant`.
    pub fn connect(config: &PlantConfig, plant: &mut Plant) -> Result<Self, EmulationError> {
        let socket = bind_udp(config.bind_addr, config.recv_buffer_bytes, config.poll_interval())?;
        let local_addr = socket.local_addr()?;
        let send_socket = socket.try_clone()?;

        let (transmitter, rx) = Transmitter::channel(config.channel_capacity);
        let send_log = SendLog::default();

        let sender = spawn_sender(
            send_socket,
            rx,
            config.controller_addr,
            plant.recorder(),
            send_log.clone(),
            plant.epoch(),
        )?;
        let receiver = ActuationReceiver::new(
            socket,
            config.controller_addr,
            plant.actuators(),
            plant.stop_signal(),
            plant.recorder(),
            send_log,
            plant.epoch(),
        )
        .spawn()?;

        plant.attach_transmitter(transmitter);
        info!("[Transport] plant bound to {}, controller at {}", local_addr, config.controller_addr);

        Ok(Self {
            local_addr,
            sender,
            receiver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for both link threads. Call after the plant run returned.
    pub fn join(self) -> LinkStats {
        let sent = self.sender.join().unwrap_or_else(|_| {
            warn!("[Transport] sender thread panicked");
            0
        });
        let received = self.receiver.join().unwrap_or_else(|_| {
            warn!("[Transport] receiver thread panicked");
            ReceiveStats::default()
        });
        info!(
            "[Transport] link closed: {} batches sent, {} received ({} accepted, {} stale, {} malformed)",
            sent, received.datagrams, received.accepted, received.stale, received.malformed
        );
        LinkStats { sent, received }
    }
}
