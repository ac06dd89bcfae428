//! Command broadcaster: fans accepted authority results out to the rest of
//! the channel.
//!
//! Delivery is fire-and-forget per connection. A failed send marks that
//! connection for eviction but never stops delivery to the others, and never
//! rolls back the already-applied authoritative state.

use std::sync::Arc;

use cinesync_shared::protocol::ServerMessage;

use crate::error::TransportError;
use crate::session::SessionManager;

pub struct Broadcaster {
    sessions: Arc<SessionManager>,
}

impl Broadcaster {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Send to a single participant.
    pub async fn push_to(
        &self,
        participant_id: &str,
        message: &ServerMessage,
    ) -> Result<(), TransportError> {
        let sender = self.sessions.sender(participant_id).await.ok_or_else(|| {
            TransportError {
                participant_id: participant_id.to_string(),
                reason: "no connection registered".to_string(),
            }
        })?;
        sender
            .send(message.to_json())
            .map_err(|e| TransportError {
                participant_id: participant_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Deliver to every listed participant except `exclude`, returning the
    /// ids whose connections failed so the caller can evict them.
    pub async fn broadcast(
        &self,
        targets: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Vec<String> {
        let payload = message.to_json();
        let mut failed = Vec::new();
        for target in targets {
            if exclude.is_some_and(|id| id == target) {
                continue;
            }
            match self.sessions.sender(target).await {
                Some(sender) => {
                    if sender.send(payload.clone()).is_err() {
                        tracing::warn!("Failed to push message to participant '{}'", target);
                        failed.push(target.clone());
                    }
                }
                None => {
                    tracing::warn!(
                        "Participant '{}' has no connection during broadcast, skipping",
                        target
                    );
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::timesource::ServerClock;
    use tokio::sync::mpsc;

    async fn register(
        sessions: &Arc<SessionManager>,
        id: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        sessions
            .register(id, "movie-night", tx, Arc::new(ServerClock::new()), async {})
            .await;
        rx
    }

    fn heartbeat() -> ServerMessage {
        ServerMessage::Heartbeat { server_time: 1.0 }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_issuer() {
        // given: three connected participants
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let mut alice = register(&sessions, "alice").await;
        let mut bob = register(&sessions, "bob").await;
        let mut carol = register(&sessions, "carol").await;
        let broadcaster = Broadcaster::new(sessions);

        // when: broadcasting with alice excluded
        let targets = vec!["alice".into(), "bob".into(), "carol".into()];
        let failed = broadcaster
            .broadcast(&targets, &heartbeat(), Some("alice"))
            .await;

        // then:
        assert!(failed.is_empty());
        assert!(alice.try_recv().is_err());
        assert!(bob.try_recv().is_ok());
        assert!(carol.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dead_receiver_does_not_block_the_rest() {
        // given: bob's receiver is gone
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let _alice = register(&sessions, "alice").await;
        let bob = register(&sessions, "bob").await;
        drop(bob);
        let mut carol = register(&sessions, "carol").await;
        let broadcaster = Broadcaster::new(sessions);

        // when:
        let targets = vec!["alice".into(), "bob".into(), "carol".into()];
        let failed = broadcaster.broadcast(&targets, &heartbeat(), None).await;

        // then: bob is reported for eviction, carol still got the message
        assert_eq!(failed, vec!["bob".to_string()]);
        assert!(carol.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_push_to_unknown_participant_is_a_transport_error() {
        // given:
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let broadcaster = Broadcaster::new(sessions);

        // when:
        let result = broadcaster.push_to("ghost", &heartbeat()).await;

        // then:
        assert!(result.is_err());
    }
}
