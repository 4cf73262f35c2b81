use thiserror::Error;

/// Errors raised while talking to a panda or evaluating a throughput run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PandaError {
    /// Configuration or argument error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Device could not be reached or the connection was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Device replied with something the host cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A CAN frame could not be packed or parsed.
    #[error("invalid CAN frame: {0}")]
    InvalidFrame(String),

    /// Fewer frames came back than were sent.
    #[error(
        "dropped frames for id 0x{msg_id:X}: sent {expected}, got {echoed} echoes and {looped} loopback frames"
    )]
    DroppedFrames {
        /// Arbitration id of the batch.
        msg_id: u32,
        /// Frames sent.
        expected: usize,
        /// Transmit echoes received.
        echoed: usize,
        /// Loopback copies received.
        looped: usize,
    },

    /// Frames that belong to neither the echo nor the loopback of the batch.
    #[error("{count} unexpected frames received for id 0x{msg_id:X}")]
    UnexpectedFrames {
        /// Arbitration id of the batch.
        msg_id: u32,
        /// Number of stray frames.
        count: usize,
    },

    /// Measured saturation fell outside the accepted band.
    #[error(
        "saturation {saturation_pct:.2}% for {msg_count} messages (id 0x{msg_id:X}) outside ({min_pct}, {max_pct})"
    )]
    SaturationOutOfBounds {
        /// Frames per batch.
        msg_count: usize,
        /// Arbitration id of the batch.
        msg_id: u32,
        /// Measured saturation percentage.
        saturation_pct: f64,
        /// Exclusive lower bound.
        min_pct: f64,
        /// Exclusive upper bound.
        max_pct: f64,
    },
}

impl From<std::io::Error> for PandaError {
    fn from(err: std::io::Error) -> Self {
        PandaError::IoError(err.to_string())
    }
}

/// Convenience type alias for panda operations.
pub type PandaResult<T> = Result<T, PandaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation_message_reports_value() {
        let err = PandaError::SaturationOutOfBounds {
            msg_count: 100,
            msg_id: 0x105,
            saturation_pct: 42.123,
            min_pct: 60.0,
            max_pct: 100.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("42.12%"), "got: {msg}");
        assert!(msg.contains("0x105"));
        assert!(msg.contains("(60, 100)"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: PandaError = io.into();
        assert!(matches!(err, PandaError::IoError(ref s) if s.contains("reset by peer")));
    }
}
