//! CineSync client library.
//!
//! Connects a local media player to a synchronization channel: joins over
//! WebSocket, estimates the clock offset from heartbeat round trips, applies
//! broadcast commands at their scheduled instants and reconciles the
//! player's actual position against the authoritative target with
//! bounded-cost corrections.

pub mod drift;
pub mod error;
pub mod player;
pub mod session;
pub mod sync;
pub mod vlc;
