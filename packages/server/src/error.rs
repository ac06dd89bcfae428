//! Error types for the synchronization server.

use cinesync_shared::protocol::ErrorCode;
use thiserror::Error;

/// Rejection of a single channel operation. Reported only to the
/// originating connection; never affects other participants and never
/// terminates the channel's processing loop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// Malformed or missing fields, unknown mode, unknown entity
    #[error("{0}")]
    Validation(String),

    /// Roster is full
    #[error("channel is full (capacity {0})")]
    Capacity(usize),

    /// Issuer's mode lacks the required capability
    #[error("mode '{0}' may not issue playback commands")]
    Authorization(String),

    /// Syntactically valid frame with an unrecognized type
    #[error("unknown message type '{0}'")]
    UnknownMessage(String),
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Capacity(_) => ErrorCode::Capacity,
            Self::Authorization(_) => ErrorCode::Authorization,
            Self::UnknownMessage(_) => ErrorCode::UnknownMessage,
        }
    }
}

/// Failure to deliver to a connection. Marks that connection for eviction;
/// delivery to everyone else proceeds.
#[derive(Debug, Error)]
#[error("send to participant '{participant_id}' failed: {reason}")]
pub struct TransportError {
    pub participant_id: String,
    pub reason: String,
}

/// The reference time source could not be reached. Degrades the clock,
/// never fails the caller.
#[derive(Debug, Error)]
pub enum ClockSyncError {
    #[error("time source '{0}' request failed: {1}")]
    Request(String, String),

    #[error("time source '{0}' returned an unparsable payload: {1}")]
    Parse(String, String),

    #[error("all time sources failed, last error: {0}")]
    AllSourcesFailed(String),
}
