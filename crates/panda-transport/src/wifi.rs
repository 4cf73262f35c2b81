//! WiFi control transport.
//!
//! The panda exposes its USB-style control and bulk endpoints over a TCP
//! socket when it runs as an access point. Every request, control or bulk,
//! is answered with a length-prefixed reply:
//!
//! - Control: `u16 0, u16 0, u8 request_type, u8 request, u16 value, u16 index, u16 length`
//! - Bulk write: `u16 endpoint, u16 len`, followed by at most 16 payload bytes
//! - Bulk read: `u16 endpoint, u16 0`
//! - Reply: `u32 len`, followed by `len` bytes (at most 0x40)
//!
//! All integers are little-endian.

use panda_common::config::DeviceConfig;
use panda_common::error::{PandaError, PandaResult};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Size of an encoded control request.
pub const CONTROL_HEADER_SIZE: usize = 12;

/// Size of an encoded bulk request header.
pub const BULK_HEADER_SIZE: usize = 4;

/// Largest payload a single bulk write may carry.
pub const MAX_BULK_WRITE: usize = 0x10;

/// Largest reply payload the device sends.
pub const MAX_REPLY_LEN: usize = 0x40;

/// Host-to-device vendor request addressed to the device.
pub const REQUEST_OUT: u8 = 0x40;

/// Raw request/reply access to a panda.
///
/// Mirrors the USB control and bulk transfer primitives so device logic
/// stays independent of the link underneath.
pub trait PandaHandle: Send {
    /// Issue a control request that carries no reply payload.
    fn control_write(&mut self, request_type: u8, request: u8, value: u16, index: u16)
        -> PandaResult<()>;

    /// Write a payload to a bulk endpoint.
    fn bulk_write(&mut self, endpoint: u16, data: &[u8]) -> PandaResult<()>;

    /// Read whatever the device has queued on a bulk endpoint.
    fn bulk_read(&mut self, endpoint: u16) -> PandaResult<Vec<u8>>;
}

/// Encode a control request.
#[must_use]
pub fn encode_control(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; CONTROL_HEADER_SIZE] {
    let mut bytes = [0u8; CONTROL_HEADER_SIZE];
    bytes[4] = request_type;
    bytes[5] = request;
    bytes[6..8].copy_from_slice(&value.to_le_bytes());
    bytes[8..10].copy_from_slice(&index.to_le_bytes());
    bytes[10..12].copy_from_slice(&length.to_le_bytes());
    bytes
}

/// Encode a bulk request header.
#[must_use]
pub fn encode_bulk(endpoint: u16, len: u16) -> [u8; BULK_HEADER_SIZE] {
    let mut bytes = [0u8; BULK_HEADER_SIZE];
    bytes[0..2].copy_from_slice(&endpoint.to_le_bytes());
    bytes[2..4].copy_from_slice(&len.to_le_bytes());
    bytes
}

/// TCP connection to the panda's control port.
pub struct WifiHandle {
    /// Peer address.
    addr: SocketAddr,
    /// Open connection.
    stream: TcpStream,
    /// Reply buffer.
    rx_buffer: [u8; MAX_REPLY_LEN],
}

impl WifiHandle {
    /// Connect to the control port described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PandaError::Connection`] if the address does not resolve or
    /// the device does not accept the connection.
    pub fn connect(config: &DeviceConfig) -> PandaResult<Self> {
        let addr = resolve(&config.ip, config.control_port)?;
        Self::connect_addr(addr, config.connect_timeout, config.io_timeout)
    }

    /// Connect to an explicit address.
    ///
    /// # Errors
    ///
    /// Returns [`PandaError::Connection`] if the connection cannot be set up.
    pub fn connect_addr(
        addr: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> PandaResult<Self> {
        info!(%addr, "Connecting to panda control port");

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| PandaError::Connection(format!("connect to {addr} failed: {e}")))?;

        stream
            .set_read_timeout(Some(io_timeout))
            .map_err(|e| PandaError::Connection(format!("failed to set read timeout: {e}")))?;

        stream
            .set_write_timeout(Some(io_timeout))
            .map_err(|e| PandaError::Connection(format!("failed to set write timeout: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| PandaError::Connection(format!("failed to set TCP_NODELAY: {e}")))?;

        info!(%addr, "Connected to panda");
        Ok(Self {
            addr,
            stream,
            rx_buffer: [0u8; MAX_REPLY_LEN],
        })
    }

    fn send(&mut self, bytes: &[u8]) -> PandaResult<()> {
        self.stream
            .write_all(bytes)
            .map_err(|e| PandaError::IoError(format!("send to {} failed: {e}", self.addr)))
    }

    /// Read one length-prefixed reply.
    fn recv_reply(&mut self) -> PandaResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .map_err(|e| PandaError::IoError(format!("receive reply header failed: {e}")))?;

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_REPLY_LEN {
            return Err(PandaError::Protocol(format!(
                "reply of {len} bytes exceeds {MAX_REPLY_LEN}"
            )));
        }

        let body = &mut self.rx_buffer[..len];
        self.stream
            .read_exact(body)
            .map_err(|e| PandaError::IoError(format!("receive reply body failed: {e}")))?;

        trace!(len, "Received reply");
        Ok(body.to_vec())
    }
}

impl PandaHandle for WifiHandle {
    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    ) -> PandaResult<()> {
        debug!(
            request = format_args!("0x{request:02x}"),
            value,
            index,
            "Control request"
        );
        self.send(&encode_control(request_type, request, value, index, 0))?;
        // The device always replies; the payload of a write is discarded
        self.recv_reply().map(|_| ())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bulk_write(&mut self, endpoint: u16, data: &[u8]) -> PandaResult<()> {
        if data.len() > MAX_BULK_WRITE {
            return Err(PandaError::Protocol(format!(
                "bulk write of {} bytes exceeds {MAX_BULK_WRITE}",
                data.len()
            )));
        }
        let mut request = Vec::with_capacity(BULK_HEADER_SIZE + data.len());
        request.extend_from_slice(&encode_bulk(endpoint, data.len() as u16));
        request.extend_from_slice(data);
        self.send(&request)?;
        self.recv_reply().map(|_| ())
    }

    fn bulk_read(&mut self, endpoint: u16) -> PandaResult<Vec<u8>> {
        self.send(&encode_bulk(endpoint, 0))?;
        self.recv_reply()
    }
}

/// Resolve `host:port` to the first socket address.
pub(crate) fn resolve(host: &str, port: u16) -> PandaResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| PandaError::Connection(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| PandaError::Connection(format!("no address for {host}:{port}")))
}
