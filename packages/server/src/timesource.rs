//! Reference time synchronization for the server.
//!
//! The server's notion of "now" is its local clock plus an offset estimated
//! against public HTTP time services. Sync runs on a fixed period and
//! opportunistically before scheduling commands when the estimate has gone
//! stale; it retries each source with exponential backoff and walks an
//! ordered list of alternates. A total failure keeps the last known offset
//! (zero before the first success) and flags the clock as degraded; time
//! sync never blocks or fails channel operation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cinesync_shared::clock::{ClockOffset, SyncAccuracy, SyncedClock};
use cinesync_shared::time::{Clock, SystemClock};

use crate::error::ClockSyncError;

/// Refresh period for the background sync task
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

const MAX_ATTEMPTS_PER_SOURCE: u32 = 3;

/// A queryable reference time source.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Fetch the reference time as Unix milliseconds.
    async fn fetch_unix_ms(&self) -> Result<i64, ClockSyncError>;

    fn name(&self) -> &str;
}

/// HTTP time API source. Understands the worldtimeapi.org and timeapi.io
/// response documents.
pub struct HttpTimeSource {
    url: String,
    client: reqwest::Client,
}

impl HttpTimeSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// The default ordered list of alternates.
    pub fn defaults() -> Vec<Box<dyn TimeSource>> {
        vec![
            Box::new(Self::new(
                "https://timeapi.io/api/Time/current/zone?timeZone=UTC",
            )),
            Box::new(Self::new(
                "https://worldtimeapi.org/api/timezone/Etc/UTC",
            )),
        ]
    }

    fn parse_document(&self, body: &serde_json::Value) -> Result<i64, ClockSyncError> {
        // worldtimeapi: { "utc_datetime": "2025-06-08T05:04:07.801500+00:00" }
        if let Some(raw) = body.get("utc_datetime").and_then(|v| v.as_str()) {
            let parsed = chrono::DateTime::parse_from_rfc3339(raw)
                .map_err(|e| ClockSyncError::Parse(self.url.clone(), e.to_string()))?;
            return Ok(parsed.timestamp_millis());
        }
        // timeapi.io: { "dateTime": "2025-06-08T05:04:16.4772212" } (UTC, no zone)
        if let Some(raw) = body.get("dateTime").and_then(|v| v.as_str()) {
            let parsed = chrono::DateTime::parse_from_rfc3339(&format!("{raw}Z"))
                .map_err(|e| ClockSyncError::Parse(self.url.clone(), e.to_string()))?;
            return Ok(parsed.timestamp_millis());
        }
        Err(ClockSyncError::Parse(
            self.url.clone(),
            "no recognized time field".to_string(),
        ))
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn fetch_unix_ms(&self) -> Result<i64, ClockSyncError> {
        let response = self
            .client
            .get(&self.url)
            .header("User-Agent", "cinesync/0.1")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ClockSyncError::Request(self.url.clone(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClockSyncError::Request(
                self.url.clone(),
                format!("HTTP {}", response.status()),
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClockSyncError::Parse(self.url.clone(), e.to_string()))?;
        self.parse_document(&body)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// The server's synchronized clock: local system time plus the current
/// offset estimate. Cheap to read from any task.
pub struct ServerClock {
    clock: SystemClock,
    synced: RwLock<SyncedClock>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            clock: SystemClock,
            synced: RwLock::new(SyncedClock::new()),
        }
    }

    /// Synchronized "now" in seconds with millisecond precision.
    pub fn now_secs(&self) -> f64 {
        self.synced.read().expect("clock lock").now_secs(&self.clock)
    }

    pub fn offset_ms(&self) -> i64 {
        self.synced.read().expect("clock lock").offset_ms()
    }

    pub fn accuracy(&self) -> SyncAccuracy {
        self.synced.read().expect("clock lock").accuracy()
    }

    pub fn is_degraded(&self) -> bool {
        self.synced.read().expect("clock lock").is_degraded()
    }

    /// Take one offset sample from one source, timestamping the round trip.
    async fn sample(&self, source: &dyn TimeSource) -> Result<ClockOffset, ClockSyncError> {
        let local_send = self.clock.now_unix_millis();
        let remote = source.fetch_unix_ms().await?;
        let local_recv = self.clock.now_unix_millis();
        Ok(ClockOffset::estimate(local_send, remote, local_recv))
    }

    /// Walk the ordered source list with per-source retries and exponential
    /// backoff. On success the new offset takes effect; on total failure the
    /// previous offset stays and the clock reports itself degraded.
    pub async fn resync(&self, sources: &[Box<dyn TimeSource>]) {
        let mut last_error = String::from("no sources configured");
        for source in sources {
            for attempt in 0..MAX_ATTEMPTS_PER_SOURCE {
                match self.sample(source.as_ref()).await {
                    Ok(sample) => {
                        tracing::info!(
                            "Time sync against {} done: offset {}ms, rtt {}ms",
                            source.name(),
                            sample.offset_ms,
                            sample.round_trip_ms
                        );
                        self.synced.write().expect("clock lock").apply(sample);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Time sync attempt {} against {} failed: {}",
                            attempt + 1,
                            source.name(),
                            e
                        );
                        last_error = e.to_string();
                        if attempt + 1 < MAX_ATTEMPTS_PER_SOURCE {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        }
                    }
                }
            }
        }
        let error = ClockSyncError::AllSourcesFailed(last_error);
        tracing::warn!("{}; keeping previous offset with degraded accuracy", error);
        self.synced.write().expect("clock lock").mark_degraded();
    }

    /// Kick off a refresh when the estimate is stale, without waiting for
    /// it. Called before scheduling time-critical commands.
    pub fn maybe_resync(self: Arc<Self>, sources: Arc<Vec<Box<dyn TimeSource>>>) {
        if sources.is_empty() {
            return;
        }
        let stale = {
            let synced = self.synced.read().expect("clock lock");
            synced.is_stale(self.clock.now_unix_millis())
        };
        if stale {
            tokio::spawn(async move {
                self.resync(&sources).await;
            });
        }
    }

    /// Background task refreshing the offset on a fixed period.
    pub fn spawn_periodic(
        self: Arc<Self>,
        sources: Arc<Vec<Box<dyn TimeSource>>>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.resync(&sources).await;
                tokio::time::sleep(period).await;
            }
        })
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        Source {}

        #[async_trait]
        impl TimeSource for Source {
            async fn fetch_unix_ms(&self) -> Result<i64, ClockSyncError>;
            fn name(&self) -> &str;
        }
    }

    fn failing_source(times: usize) -> MockSource {
        let mut source = MockSource::new();
        source
            .expect_fetch_unix_ms()
            .times(times)
            .returning(|| Err(ClockSyncError::Request("mock".into(), "down".into())));
        source.expect_name().return_const("mock".to_string());
        source
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_applies_offset_from_first_healthy_source() {
        // given: a source slightly ahead of the local clock
        let clock = ServerClock::new();
        let mut source = MockSource::new();
        source
            .expect_fetch_unix_ms()
            .returning(|| Ok(cinesync_shared::time::get_unix_timestamp() + 80));
        source.expect_name().return_const("mock".to_string());
        let sources: Vec<Box<dyn TimeSource>> = vec![Box::new(source)];

        // when:
        clock.resync(&sources).await;

        // then: the offset is close to the simulated 80ms skew
        assert!(!clock.is_degraded());
        assert!((clock.offset_ms() - 80).abs() <= 20);
        assert_eq!(clock.accuracy(), SyncAccuracy::Good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_falls_back_to_alternate_source() {
        // given: a dead primary and a healthy alternate
        let clock = ServerClock::new();
        let mut alternate = MockSource::new();
        alternate
            .expect_fetch_unix_ms()
            .returning(|| Ok(cinesync_shared::time::get_unix_timestamp()));
        alternate.expect_name().return_const("alternate".to_string());
        let sources: Vec<Box<dyn TimeSource>> = vec![
            Box::new(failing_source(MAX_ATTEMPTS_PER_SOURCE as usize)),
            Box::new(alternate),
        ];

        // when:
        clock.resync(&sources).await;

        // then:
        assert!(!clock.is_degraded());
        assert_ne!(clock.accuracy(), SyncAccuracy::Unsynced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_keeps_offset_and_degrades() {
        // given: a clock with a previous good estimate
        let clock = ServerClock::new();
        let mut good = MockSource::new();
        good.expect_fetch_unix_ms()
            .returning(|| Ok(cinesync_shared::time::get_unix_timestamp() + 40));
        good.expect_name().return_const("good".to_string());
        let healthy: Vec<Box<dyn TimeSource>> = vec![Box::new(good)];
        clock.resync(&healthy).await;
        let previous_offset = clock.offset_ms();

        // when: every source fails
        let dead: Vec<Box<dyn TimeSource>> =
            vec![Box::new(failing_source(MAX_ATTEMPTS_PER_SOURCE as usize))];
        clock.resync(&dead).await;

        // then: previous offset survives, accuracy degrades to poor
        assert!(clock.is_degraded());
        assert_eq!(clock.offset_ms(), previous_offset);
        assert_eq!(clock.accuracy(), SyncAccuracy::Poor);
    }

    #[test]
    fn test_parse_worldtimeapi_document() {
        // given:
        let source = HttpTimeSource::new("https://worldtimeapi.org/api/timezone/Etc/UTC");
        let body = serde_json::json!({ "utc_datetime": "2025-06-08T05:04:07.801+00:00" });

        // when:
        let ms = source.parse_document(&body).unwrap();

        // then:
        assert_eq!(ms, 1749359047801);
    }

    #[test]
    fn test_parse_timeapi_document() {
        // given:
        let source = HttpTimeSource::new("https://timeapi.io/api/Time/current/zone?timeZone=UTC");
        let body = serde_json::json!({ "dateTime": "2025-06-08T05:04:16.477" });

        // when:
        let ms = source.parse_document(&body).unwrap();

        // then:
        assert_eq!(ms, 1749359056477);
    }

    #[test]
    fn test_parse_unknown_document_is_an_error() {
        // given:
        let source = HttpTimeSource::new("https://example.com/time");
        let body = serde_json::json!({ "now": 12345 });

        // then:
        assert!(matches!(
            source.parse_document(&body),
            Err(ClockSyncError::Parse(_, _))
        ));
    }
}
