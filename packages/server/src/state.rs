//! Shared application state for the synchronization server.

use std::sync::Arc;

use serde::Deserialize;

use crate::broadcast::Broadcaster;
use crate::domain::DEFAULT_CHANNEL_CAPACITY;
use crate::registry::ChannelRegistry;
use crate::session::{SessionConfig, SessionManager};
use crate::timesource::{ServerClock, TimeSource};

/// Query parameters for the WebSocket upgrade
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Channel to attach this connection to
    pub channel: Option<String>,
}

/// Server tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub channel_capacity: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            session: SessionConfig::default(),
        }
    }
}

/// Shared application state
pub struct AppState {
    pub registry: ChannelRegistry,
    pub sessions: Arc<SessionManager>,
    pub broadcaster: Broadcaster,
    pub server_clock: Arc<ServerClock>,
    /// Ordered reference time sources; empty disables external sync
    pub time_sources: Arc<Vec<Box<dyn TimeSource>>>,
}

impl AppState {
    pub fn new(config: ServerConfig, time_sources: Vec<Box<dyn TimeSource>>) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session));
        Self {
            registry: ChannelRegistry::new(config.channel_capacity),
            sessions: sessions.clone(),
            broadcaster: Broadcaster::new(sessions),
            server_clock: Arc::new(ServerClock::new()),
            time_sources: Arc::new(time_sources),
        }
    }
}
