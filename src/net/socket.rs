//! socket.rs
//! UDP socket setup shared by both ends of the link.
//!
//! Sockets are built with `socket2` so the kernel receive buffer can be bounded: when it fills,
//! further datagrams are dropped by the OS instead of queueing without limit. A read timeout
//! lets receive loops notice the stop flag between datagrams.

use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::EmulationError;

/// Binds a UDP socket at `addr`.
///
/// # Arguments
/// * `addr`: Local address; port 0 picks an ephemeral port.
/// * `recv_buffer_bytes`: Kernel receive-buffer size, `None` keeps the OS default.
/// * `poll_interval`: Read timeout used by receive loops to poll their stop flag.
pub fn bind_udp(
    addr: SocketAddr,
    recv_buffer_bytes: Option<usize>,
    poll_interval: Duration,
) -> Result<UdpSocket, EmulationError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| EmulationError::Bind { addr, source })?;

    if let Some(bytes) = recv_buffer_bytes {
        socket
            .set_recv_buffer_size(bytes)
            .map_err(|source| EmulationError::Bind { addr, source })?;
        debug!(
            "[Transport] receive buffer requested={}B effective={:?}",
            bytes,
            socket.recv_buffer_size().ok()
        );
    }

    socket
        .bind(&addr.into())
        .map_err(|source| EmulationError::Bind { addr, source })?;

    let udp: UdpSocket = socket.into();
    udp.set_read_timeout(Some(poll_interval))?;
    Ok(udp)
}

/// True for the errors a read timeout produces on the supported platforms.
#[inline]
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_and_times_out() {
        let sock = bind_udp("127.0.0.1:0".parse().unwrap(), Some(64 * 1024), Duration::from_millis(10)).unwrap();
        assert_ne!(sock.local_addr().unwrap().port(), 0);

        let mut buf = [0u8; 16];
        let err = sock.recv_from(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }
}
