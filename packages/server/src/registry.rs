//! Table of live channel authorities.
//!
//! Channels are created on first join and torn down when the last
//! participant leaves; there is no other global state. Each authority sits
//! behind its own async mutex, which is the serialization point for that
//! channel: lock holders mutate one at a time, in acquisition order, and
//! different channels proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::authority::ChannelAuthority;

/// Summary row for the channel listing endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub participant_count: usize,
    pub capacity: usize,
}

pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<Mutex<ChannelAuthority>>>>,
    capacity: usize,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Look up a channel, creating it on first use.
    pub async fn get_or_create(&self, channel_id: &str, now: f64) -> Arc<Mutex<ChannelAuthority>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                tracing::info!("Channel '{}' created", channel_id);
                Arc::new(Mutex::new(ChannelAuthority::new(
                    channel_id.to_string(),
                    self.capacity,
                    now,
                )))
            })
            .clone()
    }

    pub async fn get(&self, channel_id: &str) -> Option<Arc<Mutex<ChannelAuthority>>> {
        self.channels.lock().await.get(channel_id).cloned()
    }

    /// Drop a channel once its roster is empty. Holding the outer lock
    /// while checking prevents a racing join from resurrecting a channel
    /// that is being removed.
    pub async fn remove_if_empty(&self, channel_id: &str) {
        let mut channels = self.channels.lock().await;
        if let Some(authority) = channels.get(channel_id) {
            let empty = authority.lock().await.is_empty();
            if empty {
                channels.remove(channel_id);
                tracing::info!("Channel '{}' is empty, removed", channel_id);
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn summaries(&self) -> Vec<ChannelSummary> {
        let channels = self.channels.lock().await;
        let mut summaries = Vec::with_capacity(channels.len());
        for authority in channels.values() {
            let authority = authority.lock().await;
            summaries.push(ChannelSummary {
                id: authority.channel_id().to_string(),
                participant_count: authority.participant_count(),
                capacity: authority.capacity(),
            });
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_created_on_first_lookup() {
        // given:
        let registry = ChannelRegistry::new(5);
        assert_eq!(registry.count().await, 0);

        // when:
        let first = registry.get_or_create("movie-night", 0.0).await;
        let second = registry.get_or_create("movie-night", 1.0).await;

        // then: same instance, created once
        assert_eq!(registry.count().await, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_empty_channel_is_torn_down_and_recreated_lazily() {
        // given: a channel whose only participant leaves
        let registry = ChannelRegistry::new(5);
        let authority = registry.get_or_create("movie-night", 0.0).await;
        let id = {
            let mut authority = authority.lock().await;
            let outcome = authority
                .join(None, Some("alice"), Some("observer"), None, 0.0)
                .unwrap();
            outcome.participant.id
        };
        authority.lock().await.leave(&id);

        // when:
        registry.remove_if_empty("movie-night").await;

        // then: gone, and the next lookup makes a fresh one
        assert_eq!(registry.count().await, 0);
        let recreated = registry.get_or_create("movie-night", 5.0).await;
        assert_eq!(recreated.lock().await.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_if_empty_keeps_populated_channel() {
        // given:
        let registry = ChannelRegistry::new(5);
        let authority = registry.get_or_create("movie-night", 0.0).await;
        authority
            .lock()
            .await
            .join(None, Some("alice"), Some("observer"), None, 0.0)
            .unwrap();

        // when:
        registry.remove_if_empty("movie-night").await;

        // then:
        assert_eq!(registry.count().await, 1);
    }
}
