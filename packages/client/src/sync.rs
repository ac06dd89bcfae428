//! Client-side clock synchronization.
//!
//! The client estimates its offset against the server's reference clock
//! from heartbeat round trips: it notes the local send time, and when the
//! `heartbeat{serverTime}` answer arrives the offset is
//! `serverTime - (sendTime + roundTrip/2)`. Before the first round trip a
//! one-way sample (welcome or server-pushed heartbeat) seeds the estimate
//! without a round-trip bound.

use cinesync_shared::clock::{ClockOffset, SyncAccuracy, SyncedClock};
use cinesync_shared::time::Clock;

pub struct ClockSynchronizer {
    synced: SyncedClock,
    pending_sent_at_ms: Option<i64>,
}

impl ClockSynchronizer {
    pub fn new() -> Self {
        Self {
            synced: SyncedClock::new(),
            pending_sent_at_ms: None,
        }
    }

    /// Note the local send time of an outgoing heartbeat.
    pub fn note_heartbeat_sent(&mut self, local_ms: i64) {
        self.pending_sent_at_ms = Some(local_ms);
    }

    /// Feed a server timestamp back in. With a pending heartbeat this is a
    /// full round-trip sample; without one it only seeds an unsynced clock.
    pub fn note_server_time(&mut self, server_time_secs: f64, local_recv_ms: i64) {
        let remote_ms = (server_time_secs * 1000.0).round() as i64;
        match self.pending_sent_at_ms.take() {
            Some(sent_at) => {
                self.synced
                    .apply(ClockOffset::estimate(sent_at, remote_ms, local_recv_ms));
            }
            None => {
                if self.synced.last_sync_ms().is_none() {
                    self.synced.apply(ClockOffset {
                        offset_ms: remote_ms - local_recv_ms,
                        round_trip_ms: 0,
                        sampled_at_ms: local_recv_ms,
                    });
                }
            }
        }
    }

    pub fn now_secs(&self, clock: &dyn Clock) -> f64 {
        self.synced.now_secs(clock)
    }

    pub fn offset_ms(&self) -> i64 {
        self.synced.offset_ms()
    }

    pub fn accuracy(&self) -> SyncAccuracy {
        self.synced.accuracy()
    }
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinesync_shared::time::FixedClock;

    #[test]
    fn test_round_trip_sample_sets_offset() {
        // given: a heartbeat sent at t=1000ms, answered at t=1200ms with
        // serverTime 2.1s
        let mut sync = ClockSynchronizer::new();
        sync.note_heartbeat_sent(1000);

        // when:
        sync.note_server_time(2.1, 1200);

        // then: offset = 2100 - (1000 + 100) = 1000ms
        assert_eq!(sync.offset_ms(), 1000);
        let clock = FixedClock::new(1200);
        assert!((sync.now_secs(&clock) - 2.2).abs() < 1e-9);
    }

    #[test]
    fn test_one_way_sample_only_seeds_unsynced_clock() {
        // given:
        let mut sync = ClockSynchronizer::new();
        assert_eq!(sync.accuracy(), SyncAccuracy::Unsynced);

        // when: a server-pushed heartbeat arrives with no pending ping
        sync.note_server_time(5.0, 4950);

        // then: seeded with the one-way estimate
        assert_eq!(sync.offset_ms(), 50);

        // when: a later unsolicited push with wild skew
        sync.note_server_time(100.0, 5000);

        // then: ignored, the seed stands until a real round trip
        assert_eq!(sync.offset_ms(), 50);
    }

    #[test]
    fn test_round_trip_sample_replaces_seed() {
        // given: a seeded clock
        let mut sync = ClockSynchronizer::new();
        sync.note_server_time(5.0, 4950);
        assert_eq!(sync.offset_ms(), 50);

        // when: a real round trip lands
        sync.note_heartbeat_sent(6000);
        sync.note_server_time(6.08, 6040);

        // then: offset = 6080 - (6000 + 20) = 60ms
        assert_eq!(sync.offset_ms(), 60);
        assert_eq!(sync.accuracy(), SyncAccuracy::Good);
    }
}
