//! Device access for the panda CAN interface.
//!
//! This crate provides:
//! - [`CanDevice`], [`CanReceiver`] and [`CanStream`] traits the bench is written against
//! - [`can`] module with the frame model and the 16-byte buffer codec
//! - [`wifi`] module with the TCP control transport
//! - [`panda`] module with the device handle
//! - [`streaming`] module with the UDP streaming receiver
//! - [`simulated`] module with an in-process panda for testing without hardware

pub mod can;
pub mod panda;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod streaming;
pub mod wifi;

pub use can::*;
pub use panda::Panda;
#[cfg(feature = "simulated")]
pub use simulated::*;
pub use streaming::PandaWifiStreaming;
pub use wifi::{PandaHandle, WifiHandle};

use panda_common::PandaResult;

/// Firmware safety modes relevant to the bench.
///
/// Mirrors the firmware's default hooks: in `NoOutput` every transmit is
/// refused, in `AllOutput` every transmit is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum SafetyMode {
    /// Block all transmits.
    #[default]
    NoOutput = 0,
    /// Allow all transmits.
    AllOutput = 17,
}

/// Source of received CAN frames.
pub trait CanReceiver {
    /// Drain frames received since the last call.
    ///
    /// Never blocks; returns an empty vector when nothing is pending.
    fn can_recv(&mut self) -> PandaResult<Vec<CanFrame>>;
}

/// A configurable CAN device.
pub trait CanDevice: CanReceiver + Send {
    /// Set the firmware safety mode.
    fn set_safety_mode(&mut self, mode: SafetyMode) -> PandaResult<()>;

    /// Echo transmitted frames back as received frames without touching the bus.
    fn set_can_loopback(&mut self, enable: bool) -> PandaResult<()>;

    /// Set the nominal speed of `bus`.
    fn set_can_speed_kbps(&mut self, bus: u8, speed_kbps: u32) -> PandaResult<()>;

    /// Queue frames for transmission.
    fn can_send_many(&mut self, frames: &[CanFrame]) -> PandaResult<()>;

    /// Queue a single frame for transmission.
    fn can_send(&mut self, address: u32, data: &[u8], bus: u8) -> PandaResult<()> {
        self.can_send_many(&[CanFrame::new(address, data.to_vec(), bus)])
    }
}

/// A receive channel that must be kept alive by the host.
pub trait CanStream: CanReceiver {
    /// Keep-alive; also (re)registers the host with the device.
    fn kick(&mut self) -> PandaResult<()>;
}
