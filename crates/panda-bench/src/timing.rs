//! Send-and-measure helper.
//!
//! Sends a batch of identical frames, waits for every one of them to come
//! back (transmit echo plus loopback copy), and converts the elapsed time
//! into completed bus throughput.

use panda_common::error::{PandaError, PandaResult};
use panda_transport::{CanDevice, CanFrame, CanReceiver, CAN_FRAME_BITS, ECHO_FLAG};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Payload of every frame sent by [`time_many_sends`].
pub const SEND_PAYLOAD: [u8; 8] = [0xaa; 8];

/// Received frames sorted by their relation to a sent batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Transmit echoes of the batch (`src == 0x80 | bus`).
    pub echoed: usize,
    /// Loopback copies of the batch (`src == bus`).
    pub looped: usize,
    /// Anything else.
    pub leftovers: usize,
}

impl BatchOutcome {
    /// Classify received frames against the batch's id and bus.
    #[must_use]
    pub fn classify(frames: &[CanFrame], msg_id: u32, bus: u8) -> Self {
        frames.iter().fold(Self::default(), |mut outcome, frame| {
            if frame.address != msg_id {
                outcome.leftovers += 1;
            } else if frame.src == ECHO_FLAG | bus {
                outcome.echoed += 1;
            } else if frame.src == bus {
                outcome.looped += 1;
            } else {
                outcome.leftovers += 1;
            }
            outcome
        })
    }

    /// Fail unless exactly `msg_count` echoes and loopback copies arrived and nothing else.
    ///
    /// # Errors
    ///
    /// Returns [`PandaError::UnexpectedFrames`] for stray frames, otherwise
    /// [`PandaError::DroppedFrames`] on any count mismatch.
    pub fn check(&self, msg_id: u32, msg_count: usize) -> PandaResult<()> {
        if self.leftovers > 0 {
            return Err(PandaError::UnexpectedFrames {
                msg_id,
                count: self.leftovers,
            });
        }
        if self.echoed != msg_count || self.looped != msg_count {
            return Err(PandaError::DroppedFrames {
                msg_id,
                expected: msg_count,
                echoed: self.echoed,
                looped: self.looped,
            });
        }
        Ok(())
    }
}

/// Completed throughput in kbps for `msg_count` frames over `elapsed`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn completed_kbps(msg_count: usize, elapsed: Duration) -> f64 {
    let elapsed_ms = (elapsed.as_secs_f64() * 1000.0).max(f64::EPSILON);
    f64::from(CAN_FRAME_BITS) * msg_count as f64 / elapsed_ms
}

/// Saturation of a bus: measured throughput as a percentage of nominal speed.
#[must_use]
pub fn saturation_pct(comp_kbps: f64, speed_kbps: u32) -> f64 {
    comp_kbps / f64::from(speed_kbps) * 100.0
}

/// Send `msg_count` frames with id `msg_id` on `bus` and time their return.
///
/// Frames are received from `precv`, which is typically the streaming channel
/// of the same device. The device must be in loopback so every frame comes
/// back twice. Receiving stops after `2 * msg_count` frames or `recv_timeout`.
///
/// Returns the completed throughput in kbps.
///
/// # Errors
///
/// Propagates transport errors, and fails with
/// [`PandaError::UnexpectedFrames`] or [`PandaError::DroppedFrames`] when the
/// received traffic does not match the batch.
pub fn time_many_sends<D, R>(
    panda: &mut D,
    bus: u8,
    precv: &mut R,
    msg_count: usize,
    msg_id: u32,
    recv_timeout: Duration,
) -> PandaResult<f64>
where
    D: CanDevice + ?Sized,
    R: CanReceiver + ?Sized,
{
    let expected = msg_count * 2;
    let frames = vec![CanFrame::new(msg_id, SEND_PAYLOAD.to_vec(), bus); msg_count];

    let start = Instant::now();
    panda.can_send_many(&frames)?;

    let mut received = Vec::with_capacity(expected);
    while received.len() < expected && start.elapsed() < recv_timeout {
        let batch = precv.can_recv()?;
        if batch.is_empty() {
            std::thread::yield_now();
        } else {
            trace!(count = batch.len(), total = received.len(), "Received frames");
            received.extend(batch);
        }
    }
    let elapsed = start.elapsed();

    BatchOutcome::classify(&received, msg_id, bus).check(msg_id, msg_count)?;

    let comp_kbps = completed_kbps(msg_count, elapsed);
    debug!(
        msg_id = format_args!("0x{msg_id:X}"),
        msg_count,
        elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        comp_kbps,
        "Batch completed"
    );
    Ok(comp_kbps)
}
