//! Connection and liveness management.
//!
//! The session manager owns the transport edge of every participant: the
//! outbound message channel, the per-connection heartbeat push timer and the
//! liveness monitor that evicts silent connections. It also remembers recent
//! departures for a grace window so a reconnecting client presenting its
//! prior participant id is reattached with the state it left with.
//!
//! All timers are owned, cancellable tasks; disconnecting a participant
//! aborts them. Nothing here blocks a channel's mutation path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cinesync_shared::protocol::{ParticipantMode, ServerMessage};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::timesource::ServerClock;

/// Liveness and rejoin tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Interval between server-pushed heartbeats
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a connection counts as dead
    pub max_missed_heartbeats: u32,
    /// Window within which a departed participant id may be reclaimed
    pub rejoin_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            rejoin_grace: Duration::from_secs(60),
        }
    }
}

/// Outbound channel plus the timers owned by one connection.
struct ConnectionEntry {
    sender: mpsc::UnboundedSender<String>,
    last_seen: Arc<StdMutex<Instant>>,
    heartbeat_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

/// What the grace window remembers about a departed participant.
#[derive(Debug, Clone)]
struct Departure {
    channel_id: String,
    mode: ParticipantMode,
    departed_at: Instant,
}

pub struct SessionManager {
    config: SessionConfig,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    departures: StdMutex<HashMap<String, Departure>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            departures: StdMutex::new(HashMap::new()),
        }
    }

    /// Register a joined participant's connection and start its timers.
    ///
    /// `on_evict` runs at most once, when the connection stays silent past
    /// `heartbeat_interval * max_missed_heartbeats`.
    pub async fn register<F>(
        &self,
        participant_id: &str,
        channel_id: &str,
        sender: mpsc::UnboundedSender<String>,
        server_clock: Arc<ServerClock>,
        on_evict: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let last_seen = Arc::new(StdMutex::new(Instant::now()));

        let heartbeat_task = {
            let sender = sender.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let message = ServerMessage::Heartbeat {
                        server_time: server_clock.now_secs(),
                    };
                    if sender.send(message.to_json()).is_err() {
                        // Receiver gone; the socket task handles cleanup
                        break;
                    }
                }
            })
        };

        let monitor_task = {
            let last_seen = last_seen.clone();
            let interval = self.config.heartbeat_interval;
            let deadline = interval * self.config.max_missed_heartbeats;
            let participant_id = participant_id.to_string();
            let channel_id = channel_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let silent_for = last_seen.lock().expect("last_seen lock").elapsed();
                    if silent_for > deadline {
                        tracing::warn!(
                            "Participant '{}' in channel '{}' silent for {:?}, evicting",
                            participant_id,
                            channel_id,
                            silent_for
                        );
                        break;
                    }
                }
                on_evict.await;
            })
        };

        let entry = ConnectionEntry {
            sender,
            last_seen,
            heartbeat_task,
            monitor_task,
        };
        if let Some(old) = self.connections.lock().await.insert(participant_id.to_string(), entry)
        {
            // A rejoin replaced a connection whose socket never closed
            old.heartbeat_task.abort();
            old.monitor_task.abort();
        }
    }

    /// Tear down a connection's timers and drop its outbound channel.
    pub async fn unregister(&self, participant_id: &str) {
        if let Some(entry) = self.connections.lock().await.remove(participant_id) {
            entry.heartbeat_task.abort();
            entry.monitor_task.abort();
        }
    }

    /// Refresh liveness after any inbound message.
    pub async fn touch(&self, participant_id: &str) {
        if let Some(entry) = self.connections.lock().await.get(participant_id) {
            *entry.last_seen.lock().expect("last_seen lock") = Instant::now();
        }
    }

    pub async fn sender(&self, participant_id: &str) -> Option<mpsc::UnboundedSender<String>> {
        self.connections
            .lock()
            .await
            .get(participant_id)
            .map(|entry| entry.sender.clone())
    }

    /// Remember a departure so the participant can rejoin in place.
    pub fn remember_departure(
        &self,
        participant_id: &str,
        channel_id: &str,
        mode: ParticipantMode,
    ) {
        self.departures.lock().expect("departures lock").insert(
            participant_id.to_string(),
            Departure {
                channel_id: channel_id.to_string(),
                mode,
                departed_at: Instant::now(),
            },
        );
    }

    /// Claim a remembered departure for a rejoin. Returns the preserved mode
    /// when the id departed from this channel within the grace window;
    /// expired or foreign entries are dropped and the join proceeds as new.
    pub fn take_rejoin(&self, participant_id: &str, channel_id: &str) -> Option<ParticipantMode> {
        let mut departures = self.departures.lock().expect("departures lock");
        let departure = departures.remove(participant_id)?;
        if departure.channel_id != channel_id {
            return None;
        }
        if departure.departed_at.elapsed() > self.config.rejoin_grace {
            return None;
        }
        Some(departure.mode)
    }
}
