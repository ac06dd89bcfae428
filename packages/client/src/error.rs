//! Error types for the CineSync client.

use thiserror::Error;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection establishment or transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Ran out of reconnection attempts
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Failures talking to the local media player.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("player request failed: {0}")]
    Request(String),

    #[error("player authentication failed, check password")]
    Unauthorized,

    #[error("player returned an unparsable status: {0}")]
    Status(String),
}
