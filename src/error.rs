use thiserror::Error;

use crate::protocol::Protocol;

/// A frame that cannot be decoded. The offending bytes have already been
/// dropped from the buffer when this is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("malformed {protocol} frame: {reason}")]
    Malformed { protocol: Protocol, reason: String },
    #[error("io: {0}")]
    Io(String),
}

impl FrameError {
    pub fn malformed(protocol: Protocol, reason: impl Into<String>) -> Self {
        FrameError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        // Required by tokio_util's Decoder; codecs never perform IO.
        FrameError::Io(e.to_string())
    }
}

/// Why a decoded sample did not become a [`crate::types::Position`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("duplicate timestamp")]
    Duplicate,
    #[error("timestamp older than last accepted position")]
    OutOfOrder,
    #[error("invalid timestamp")]
    InvalidTimestamp,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no decoder matches the connection")]
    ProtocolUnresolved,
    #[error(transparent)]
    Malformed(#[from] FrameError),
    #[error("connection bound to device {bound} received a frame for {got}")]
    DeviceMismatch { bound: String, got: String },
    #[error("storage gateway failure: {0}")]
    Gateway(#[source] anyhow::Error),
}
