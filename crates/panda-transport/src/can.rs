//! CAN frame model and the panda's 16-byte buffer format.
//!
//! Each frame travels as one 16-byte record:
//!
//! | Bytes | Host to device                     | Device to host                    |
//! |-------|------------------------------------|-----------------------------------|
//! | 0..4  | `id << 21 \| TX` or `id << 3 \| TX \| EXT` | `id << 21` or `id << 3 \| EXT` |
//! | 4..8  | `len \| bus << 4`                  | `len \| src << 4 \| bus_time << 16` |
//! | 8..16 | data, zero padded                  | data, zero padded                 |
//!
//! All words are little-endian.

use panda_common::error::{PandaError, PandaResult};

/// Size of one packed frame record in bytes.
pub const CAN_RECORD_SIZE: usize = 0x10;

/// Maximum classic CAN payload.
pub const MAX_DATA_LEN: usize = 8;

/// Packed chunks are closed once they grow past this many bytes.
pub const CHUNK_LIMIT: usize = 256;

/// Bit set in word 0 to request transmission.
const TRANSMIT: u32 = 1;

/// Bit set in word 0 for 29-bit identifiers.
const EXTENDED: u32 = 4;

/// First identifier that needs the extended format.
const FIRST_EXTENDED_ID: u32 = 0x800;

/// Highest 29-bit identifier.
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Flag OR'd into the source bus of a transmit echo.
pub const ECHO_FLAG: u8 = 0x80;

/// Bits on the wire for a standard-id frame with 8 data bytes:
/// SOF, id, RTR, IDE, r0, DLC, data, CRC, CRC delimiter, ACK, ACK delimiter, EOF.
pub const CAN_FRAME_BITS: u32 = 1 + 11 + 1 + 1 + 1 + 4 + 8 * 8 + 15 + 1 + 1 + 1 + 7;

/// Bus speeds accepted by the firmware, in kbps.
pub const CAN_SPEEDS_KBPS: [u32; 8] = [10, 20, 50, 100, 125, 250, 500, 1000];

/// Check if the firmware accepts a bus speed.
#[must_use]
pub fn is_supported_speed(speed_kbps: u32) -> bool {
    CAN_SPEEDS_KBPS.contains(&speed_kbps)
}

/// A single CAN frame as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration identifier (11 or 29 bits).
    pub address: u32,
    /// Device timestamp; zero on frames built by the host.
    pub bus_time: u16,
    /// Payload, at most 8 bytes.
    pub data: Vec<u8>,
    /// Bus number; transmit echoes carry `0x80 | bus`.
    pub src: u8,
}

impl CanFrame {
    /// Build a frame to send on `bus`.
    pub fn new(address: u32, data: impl Into<Vec<u8>>, bus: u8) -> Self {
        Self {
            address,
            bus_time: 0,
            data: data.into(),
            src: bus,
        }
    }

    /// Whether this frame is the device's acknowledgement of one of our transmits.
    #[must_use]
    pub fn is_echo(&self) -> bool {
        self.src & ECHO_FLAG != 0
    }

    /// Bus number with the echo flag stripped.
    #[must_use]
    pub fn bus(&self) -> u8 {
        self.src & !ECHO_FLAG
    }

    /// Whether the identifier requires the 29-bit format.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.address >= FIRST_EXTENDED_ID
    }

    /// The echo the device reports after transmitting this frame.
    #[must_use]
    pub fn to_echo(&self) -> Self {
        Self {
            src: self.bus() | ECHO_FLAG,
            ..self.clone()
        }
    }
}

fn encode_record(frame: &CanFrame, word0: u32, word1: u32) -> [u8; CAN_RECORD_SIZE] {
    let mut record = [0u8; CAN_RECORD_SIZE];
    record[0..4].copy_from_slice(&word0.to_le_bytes());
    record[4..8].copy_from_slice(&word1.to_le_bytes());
    record[8..8 + frame.data.len()].copy_from_slice(&frame.data);
    record
}

fn check_frame(frame: &CanFrame) -> PandaResult<()> {
    if frame.data.len() > MAX_DATA_LEN {
        return Err(PandaError::InvalidFrame(format!(
            "payload of {} bytes exceeds {MAX_DATA_LEN}",
            frame.data.len()
        )));
    }
    if frame.address > MAX_EXTENDED_ID {
        return Err(PandaError::InvalidFrame(format!(
            "address 0x{:X} wider than 29 bits",
            frame.address
        )));
    }
    Ok(())
}

/// Pack frames for transmission, split into chunks of a little over 256 bytes.
///
/// # Errors
///
/// Returns [`PandaError::InvalidFrame`] for oversized payloads or identifiers.
#[allow(clippy::cast_possible_truncation)]
pub fn pack_can_buffer(frames: &[CanFrame]) -> PandaResult<Vec<Vec<u8>>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for frame in frames {
        check_frame(frame)?;
        let word0 = if frame.is_extended() {
            (frame.address << 3) | TRANSMIT | EXTENDED
        } else {
            (frame.address << 21) | TRANSMIT
        };
        let word1 = frame.data.len() as u32 | (u32::from(frame.src) << 4);

        current.extend_from_slice(&encode_record(frame, word0, word1));
        if current.len() > CHUNK_LIMIT {
            chunks.push(std::mem::take(&mut current));
        }
    }
    chunks.push(current);
    Ok(chunks)
}

/// Encode frames the way the device reports them to the host.
///
/// Used by the simulated device and mock servers.
///
/// # Errors
///
/// Returns [`PandaError::InvalidFrame`] for oversized payloads or identifiers.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_rx_buffer(frames: &[CanFrame]) -> PandaResult<Vec<u8>> {
    let mut out = Vec::with_capacity(frames.len() * CAN_RECORD_SIZE);
    for frame in frames {
        check_frame(frame)?;
        let word0 = if frame.is_extended() {
            (frame.address << 3) | EXTENDED
        } else {
            frame.address << 21
        };
        let word1 = frame.data.len() as u32
            | (u32::from(frame.src) << 4)
            | (u32::from(frame.bus_time) << 16);
        out.extend_from_slice(&encode_record(frame, word0, word1));
    }
    Ok(out)
}

/// Parse a receive buffer from the device.
///
/// # Errors
///
/// Returns [`PandaError::Protocol`] if the buffer is not a whole number of
/// records or a record declares more than 8 data bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_can_buffer(buf: &[u8]) -> PandaResult<Vec<CanFrame>> {
    if buf.len() % CAN_RECORD_SIZE != 0 {
        return Err(PandaError::Protocol(format!(
            "CAN buffer length {} is not a multiple of {CAN_RECORD_SIZE}",
            buf.len()
        )));
    }

    buf.chunks_exact(CAN_RECORD_SIZE)
        .map(|record| {
            let f1 = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let f2 = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
            let address = if f1 & EXTENDED != 0 { f1 >> 3 } else { f1 >> 21 };
            let len = (f2 & 0xF) as usize;
            if len > MAX_DATA_LEN {
                return Err(PandaError::Protocol(format!(
                    "record for 0x{address:X} declares {len} data bytes"
                )));
            }
            Ok(CanFrame {
                address,
                bus_time: (f2 >> 16) as u16,
                data: record[8..8 + len].to_vec(),
                src: ((f2 >> 4) & 0xFF) as u8,
            })
        })
        .collect()
}
