//! Local media player abstraction.
//!
//! The drift controller talks to this trait and nothing else, so the real
//! VLC driver and the mock used in tests are interchangeable.

use async_trait::async_trait;

use crate::error::PlayerError;

/// Snapshot of the local player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerStatus {
    /// Position in seconds
    pub position: f64,
    /// Total length in seconds (0 when nothing is loaded)
    pub length: f64,
    pub playing: bool,
    /// Volume in percent (0-100)
    pub volume: u32,
    /// Playback rate (1.0 = normal speed)
    pub rate: f64,
}

/// Control surface of the local media player.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlayerDriver: Send + Sync {
    /// Current player status.
    async fn status(&self) -> Result<PlayerStatus, PlayerError>;

    /// Start playback, optionally seeking first.
    async fn play(&self, position: Option<f64>) -> Result<(), PlayerError>;

    /// Pause playback.
    async fn pause(&self) -> Result<(), PlayerError>;

    /// Seek to a position in seconds.
    async fn seek(&self, position: f64) -> Result<(), PlayerError>;

    /// Set volume in percent (0-100).
    async fn set_volume(&self, volume: u32) -> Result<(), PlayerError>;

    /// Set the playback rate (1.0 = normal speed).
    async fn set_rate(&self, rate: f64) -> Result<(), PlayerError>;
}
