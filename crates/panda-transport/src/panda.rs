//! Panda device handle.
//!
//! Translates the device-level operations used by the bench (safety mode,
//! loopback, bus speed, frame send/receive) into control and bulk requests
//! on a [`PandaHandle`].

use crate::can::{is_supported_speed, pack_can_buffer, parse_can_buffer, CanFrame};
use crate::wifi::{PandaHandle, WifiHandle, MAX_BULK_WRITE, REQUEST_OUT};
use crate::{CanDevice, CanReceiver, SafetyMode};
use panda_common::config::DeviceConfig;
use panda_common::error::{PandaError, PandaResult};
use tracing::{debug, info, trace};

/// Vendor request codes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    /// Set safety mode (0xdc).
    SetSafetyMode = 0xdc,
    /// Set CAN bus speed (0xde).
    SetCanSpeed = 0xde,
    /// Enable or disable CAN loopback (0xe5).
    SetCanLoopback = 0xe5,
}

/// Bulk endpoint carrying received CAN frames.
pub const CAN_RECV_ENDPOINT: u16 = 1;

/// Bulk endpoint accepting CAN frames to transmit.
pub const CAN_SEND_ENDPOINT: u16 = 3;

/// A panda reached through a [`PandaHandle`].
pub struct Panda<H: PandaHandle = WifiHandle> {
    handle: H,
}

impl Panda<WifiHandle> {
    /// Open the panda described by `config` over WiFi.
    ///
    /// # Errors
    ///
    /// Returns [`PandaError::Connection`] if the device cannot be reached.
    pub fn connect(config: &DeviceConfig) -> PandaResult<Self> {
        Ok(Self::with_handle(WifiHandle::connect(config)?))
    }
}

impl<H: PandaHandle> Panda<H> {
    /// Wrap an already open handle.
    pub fn with_handle(handle: H) -> Self {
        Self { handle }
    }

    /// Access the underlying handle.
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    fn control(&mut self, request: Request, value: u16, index: u16) -> PandaResult<()> {
        self.handle
            .control_write(REQUEST_OUT, request as u8, value, index)
    }
}

impl<H: PandaHandle> CanReceiver for Panda<H> {
    fn can_recv(&mut self) -> PandaResult<Vec<CanFrame>> {
        let buf = self.handle.bulk_read(CAN_RECV_ENDPOINT)?;
        let frames = parse_can_buffer(&buf)?;
        trace!(count = frames.len(), "Received frames from control channel");
        Ok(frames)
    }
}

impl<H: PandaHandle> CanDevice for Panda<H> {
    fn set_safety_mode(&mut self, mode: SafetyMode) -> PandaResult<()> {
        info!(?mode, "Setting safety mode");
        self.control(Request::SetSafetyMode, mode as u16, 0)
    }

    fn set_can_loopback(&mut self, enable: bool) -> PandaResult<()> {
        info!(enable, "Setting CAN loopback");
        self.control(Request::SetCanLoopback, u16::from(enable), 0)
    }

    fn set_can_speed_kbps(&mut self, bus: u8, speed_kbps: u32) -> PandaResult<()> {
        if !is_supported_speed(speed_kbps) {
            return Err(PandaError::Config(format!(
                "unsupported CAN speed {speed_kbps} kbps"
            )));
        }
        debug!(bus, speed_kbps, "Setting CAN speed");
        // Firmware takes the speed in units of 100 bps
        let index = u16::try_from(speed_kbps * 10)
            .map_err(|_| PandaError::Config(format!("CAN speed {speed_kbps} out of range")))?;
        self.control(Request::SetCanSpeed, u16::from(bus), index)
    }

    fn can_send_many(&mut self, frames: &[CanFrame]) -> PandaResult<()> {
        trace!(count = frames.len(), "Sending frames");
        for chunk in pack_can_buffer(frames)? {
            for slice in chunk.chunks(MAX_BULK_WRITE) {
                self.handle.bulk_write(CAN_SEND_ENDPOINT, slice)?;
            }
        }
        Ok(())
    }
}
