//! CineSync synchronization server.
//!
//! One authority per channel owns the roster, the playback state, the shared
//! file registry and the screen-share set, and serializes every mutation.
//! Accepted mutations become clock-scheduled commands fanned out to all
//! other participants so their players change state at the same instant.

pub mod authority;
pub mod broadcast;
pub mod domain;
pub mod error;
pub mod handler;
pub mod registry;
pub mod runner;
pub mod session;
pub mod signal;
pub mod state;
pub mod timesource;

pub use runner::run_server;
