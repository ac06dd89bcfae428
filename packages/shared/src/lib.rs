//! Shared library for CineSync, a synchronized media playback system.
//!
//! This crate provides the pieces both the server and the client need:
//! the WebSocket wire protocol, participant modes, clock-offset estimation
//! and the common time/logging utilities.

pub mod clock;
pub mod logger;
pub mod protocol;
pub mod time;
