//! UDP CAN streaming channel.
//!
//! The panda pushes received CAN traffic as UDP datagrams to whichever
//! host last sent it a `hello`. The registration expires, so the host has to
//! [`kick`](CanStream::kick) the device at least every five seconds.

use crate::can::{parse_can_buffer, CanFrame, CAN_RECORD_SIZE};
use crate::wifi::resolve;
use crate::{CanReceiver, CanStream};
use panda_common::config::DeviceConfig;
use panda_common::error::{PandaError, PandaResult};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Keep-alive payload.
pub const KICK_PAYLOAD: &[u8] = b"hello";

/// The device forgets a streaming client after this long without a kick.
pub const KICK_INTERVAL: Duration = Duration::from_secs(5);

/// Receive buffer size: up to 0x200 frame records per datagram.
const RECV_BUFFER_SIZE: usize = 0x200 * CAN_RECORD_SIZE;

/// Streaming receiver for a panda on WiFi.
pub struct PandaWifiStreaming {
    /// Non-blocking socket bound to an ephemeral local port.
    socket: UdpSocket,
    /// Device streaming address; datagrams from anywhere else are ignored.
    device: SocketAddr,
    /// Datagram buffer.
    rx_buffer: Vec<u8>,
}

impl PandaWifiStreaming {
    /// Open the streaming channel described by `config` and register with the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve, the socket cannot be
    /// bound, or the initial kick cannot be sent.
    pub fn connect(config: &DeviceConfig) -> PandaResult<Self> {
        let device = resolve(&config.ip, config.streaming_port)?;
        Self::connect_addr(device)
    }

    /// Open a streaming channel to an explicit device address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the initial kick fails.
    pub fn connect_addr(device: SocketAddr) -> PandaResult<Self> {
        let bind_addr: SocketAddr = if device.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| PandaError::Connection(format!("failed to bind UDP socket: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| PandaError::Connection(format!("failed to set non-blocking: {e}")))?;

        debug!(%device, local = ?socket.local_addr().ok(), "Opened streaming socket");

        let mut streaming = Self {
            socket,
            device,
            rx_buffer: vec![0u8; RECV_BUFFER_SIZE],
        };
        streaming.kick()?;
        Ok(streaming)
    }

    /// Local address the device streams to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be queried.
    pub fn local_addr(&self) -> PandaResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Device streaming address.
    #[must_use]
    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }
}

impl CanReceiver for PandaWifiStreaming {
    fn can_recv(&mut self) -> PandaResult<Vec<CanFrame>> {
        let mut frames = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.rx_buffer) {
                Ok((len, from)) => {
                    if from != self.device {
                        trace!(%from, len, "Ignoring datagram from unknown peer");
                        continue;
                    }
                    frames.extend(parse_can_buffer(&self.rx_buffer[..len])?);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    warn!(error = %e, "Streaming receive failed");
                    return Err(PandaError::IoError(format!("streaming receive failed: {e}")));
                }
            }
        }
        Ok(frames)
    }
}

impl CanStream for PandaWifiStreaming {
    fn kick(&mut self) -> PandaResult<()> {
        trace!(device = %self.device, "Kicking streaming channel");
        self.socket
            .send_to(KICK_PAYLOAD, self.device)
            .map_err(|e| PandaError::IoError(format!("kick failed: {e}")))?;
        Ok(())
    }
}
