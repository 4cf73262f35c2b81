//! In-process simulated panda.
//!
//! Models just enough of the device for the bench to run without hardware:
//! safety-mode gating of transmits, per-bus speed, serialization of frames on
//! the bus, transmit echoes, loopback, and the streaming keep-alive.
//!
//! [`SimulatedPanda`] and the [`SimulatedStream`] obtained from it share one
//! device state, the same way a real panda serves both its control and
//! streaming channels.

use crate::can::{is_supported_speed, CanFrame, CAN_FRAME_BITS, MAX_DATA_LEN};
use crate::streaming::KICK_INTERVAL;
use crate::{CanDevice, CanReceiver, CanStream, SafetyMode};
use panda_common::error::{PandaError, PandaResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Number of CAN buses on the device.
pub const NUM_BUSES: usize = 3;

/// Recessive bits between two frames on the bus.
pub const INTERFRAME_SPACE_BITS: u32 = 3;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Streaming stops delivering when not kicked for this long.
    pub keepalive: Duration,
    /// Drop every Nth transmitted frame (fault injection).
    pub drop_every: Option<usize>,
    /// Initial speed of every bus in kbps.
    pub initial_speed_kbps: u32,
    /// Idle bits charged after every frame on top of [`CAN_FRAME_BITS`].
    pub interframe_bits: u32,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            keepalive: KICK_INTERVAL,
            drop_every: None,
            initial_speed_kbps: 500,
            interframe_bits: INTERFRAME_SPACE_BITS,
        }
    }
}

/// A batch handed to [`CanDevice::can_send_many`], as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBatch {
    /// Arbitration id of the first frame.
    pub msg_id: u32,
    /// Number of frames in the batch.
    pub count: usize,
    /// Streaming kicks received before this batch.
    pub kicks_before: u64,
}

#[derive(Debug)]
struct SimState {
    config: SimulatedConfig,
    epoch: Instant,
    safety_mode: SafetyMode,
    loopback: bool,
    speeds_kbps: [u32; NUM_BUSES],
    bus_free_at: [Instant; NUM_BUSES],
    /// Frames waiting to be reported, ordered by due time.
    pending: VecDeque<(Instant, CanFrame)>,
    last_kick: Option<Instant>,
    kicks: u64,
    transmitted: u64,
    batches: Vec<SentBatch>,
}

impl SimState {
    fn new(config: SimulatedConfig) -> Self {
        let now = Instant::now();
        Self {
            epoch: now,
            safety_mode: SafetyMode::default(),
            loopback: false,
            speeds_kbps: [config.initial_speed_kbps; NUM_BUSES],
            bus_free_at: [now; NUM_BUSES],
            pending: VecDeque::new(),
            last_kick: None,
            kicks: 0,
            transmitted: 0,
            batches: Vec::new(),
            config,
        }
    }

    fn bus_index(bus: u8) -> PandaResult<usize> {
        let idx = usize::from(bus);
        if idx < NUM_BUSES {
            Ok(idx)
        } else {
            Err(PandaError::Config(format!("no CAN bus {bus}")))
        }
    }

    /// Reject the batch before anything is queued.
    fn check_batch(frames: &[CanFrame]) -> PandaResult<()> {
        for frame in frames {
            if frame.data.len() > MAX_DATA_LEN {
                return Err(PandaError::InvalidFrame(format!(
                    "payload of {} bytes exceeds {MAX_DATA_LEN}",
                    frame.data.len()
                )));
            }
            Self::bus_index(frame.bus())?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn transmit(&mut self, frames: &[CanFrame]) -> PandaResult<()> {
        Self::check_batch(frames)?;
        self.batches.push(SentBatch {
            msg_id: frames.first().map_or(0, |f| f.address),
            count: frames.len(),
            kicks_before: self.kicks,
        });

        if self.safety_mode == SafetyMode::NoOutput {
            warn!(count = frames.len(), "Transmit refused by safety mode");
            return Ok(());
        }

        let now = Instant::now();
        let frame_bits = f64::from(CAN_FRAME_BITS + self.config.interframe_bits);
        for frame in frames {
            let bus = Self::bus_index(frame.bus())?;
            let frame_time =
                Duration::from_secs_f64(frame_bits / (f64::from(self.speeds_kbps[bus]) * 1000.0));
            let done = self.bus_free_at[bus].max(now) + frame_time;
            self.bus_free_at[bus] = done;

            self.transmitted += 1;
            if let Some(n) = self.config.drop_every {
                if n > 0 && self.transmitted % n as u64 == 0 {
                    trace!(address = frame.address, "Dropping frame");
                    continue;
                }
            }

            // Device timestamps are a free-running microsecond counter
            let bus_time = done.duration_since(self.epoch).as_micros() as u16;
            let echo = CanFrame {
                bus_time,
                ..frame.to_echo()
            };
            self.pending.push_back((done, echo));
            if self.loopback {
                let looped = CanFrame {
                    bus_time,
                    src: frame.bus(),
                    ..frame.clone()
                };
                self.pending.push_back((done, looped));
            }
        }
        // Batches on different buses interleave
        self.pending
            .make_contiguous()
            .sort_by_key(|(due, _)| *due);
        Ok(())
    }

    fn take_due(&mut self) -> Vec<CanFrame> {
        let now = Instant::now();
        let mut out = Vec::new();
        while self.pending.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, frame)) = self.pending.pop_front() {
                out.push(frame);
            }
        }
        out
    }

    fn stream_alive(&self) -> bool {
        self.last_kick
            .is_some_and(|kick| kick.elapsed() <= self.config.keepalive)
    }
}

/// Simulated panda handle.
#[derive(Debug, Clone)]
pub struct SimulatedPanda {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedPanda {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPanda {
    /// Create a simulated panda with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SimulatedConfig::default())
    }

    /// Create a simulated panda with custom parameters.
    #[must_use]
    pub fn with_config(config: SimulatedConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Open the streaming channel of this device. Kicks once, like the real receiver.
    #[must_use]
    pub fn stream(&self) -> SimulatedStream {
        let mut stream = SimulatedStream {
            state: Arc::clone(&self.state),
        };
        stream.register();
        stream
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current safety mode.
    #[must_use]
    pub fn safety_mode(&self) -> SafetyMode {
        self.lock().safety_mode
    }

    /// Whether loopback is enabled.
    #[must_use]
    pub fn loopback(&self) -> bool {
        self.lock().loopback
    }

    /// Configured speed of `bus`, if it exists.
    #[must_use]
    pub fn can_speed_kbps(&self, bus: u8) -> Option<u32> {
        self.lock().speeds_kbps.get(usize::from(bus)).copied()
    }

    /// Total streaming kicks received.
    #[must_use]
    pub fn kick_count(&self) -> u64 {
        self.lock().kicks
    }

    /// Every batch sent so far, in order.
    #[must_use]
    pub fn sent_batches(&self) -> Vec<SentBatch> {
        self.lock().batches.clone()
    }
}

impl CanReceiver for SimulatedPanda {
    fn can_recv(&mut self) -> PandaResult<Vec<CanFrame>> {
        Ok(self.lock().take_due())
    }
}

impl CanDevice for SimulatedPanda {
    fn set_safety_mode(&mut self, mode: SafetyMode) -> PandaResult<()> {
        debug!(?mode, "Simulated safety mode");
        self.lock().safety_mode = mode;
        Ok(())
    }

    fn set_can_loopback(&mut self, enable: bool) -> PandaResult<()> {
        debug!(enable, "Simulated loopback");
        self.lock().loopback = enable;
        Ok(())
    }

    fn set_can_speed_kbps(&mut self, bus: u8, speed_kbps: u32) -> PandaResult<()> {
        if !is_supported_speed(speed_kbps) {
            return Err(PandaError::Config(format!(
                "unsupported CAN speed {speed_kbps} kbps"
            )));
        }
        let idx = SimState::bus_index(bus)?;
        self.lock().speeds_kbps[idx] = speed_kbps;
        Ok(())
    }

    fn can_send_many(&mut self, frames: &[CanFrame]) -> PandaResult<()> {
        self.lock().transmit(frames)
    }
}

/// Streaming channel of a [`SimulatedPanda`].
#[derive(Debug)]
pub struct SimulatedStream {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedStream {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&mut self) {
        let mut state = self.lock();
        state.kicks += 1;
        state.last_kick = Some(Instant::now());
    }
}

impl CanReceiver for SimulatedStream {
    fn can_recv(&mut self) -> PandaResult<Vec<CanFrame>> {
        let mut state = self.lock();
        let due = state.take_due();
        if state.stream_alive() {
            Ok(due)
        } else {
            if !due.is_empty() {
                trace!(count = due.len(), "Streaming client expired, frames lost");
            }
            Ok(Vec::new())
        }
    }
}

impl CanStream for SimulatedStream {
    fn kick(&mut self) -> PandaResult<()> {
        self.register();
        Ok(())
    }
}
