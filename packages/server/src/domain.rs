//! Channel domain model: roster, playback state, file registry and
//! screen-share sessions.
//!
//! These structs carry no locking and no I/O; the authority mutates them
//! through validated operations only.

use std::collections::{HashMap, HashSet};

use cinesync_shared::protocol::{
    FileInfo, ParticipantInfo, ParticipantMode, PlaybackCommandKind, PlaybackInfo,
};

/// Default maximum roster size per channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 5;

/// One member of a channel's roster.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub mode: ParticipantMode,
    /// Synchronized time of the join (seconds)
    pub joined_at: f64,
    /// Synchronized time of the last inbound message (seconds)
    pub last_seen: f64,
}

impl Participant {
    pub fn new(id: String, name: String, mode: ParticipantMode, now: f64) -> Self {
        Self {
            id,
            name,
            mode,
            joined_at: now,
            last_seen: now,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            mode: self.mode,
            joined_at: self.joined_at,
            last_seen: self.last_seen,
        }
    }
}

/// The single authoritative playback state of a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    /// Position in seconds at `last_update`
    pub position: f64,
    pub playing: bool,
    /// Synchronized time of the last mutation (seconds)
    pub last_update: f64,
}

impl PlaybackState {
    pub fn new(now: f64) -> Self {
        Self {
            position: 0.0,
            playing: false,
            last_update: now,
        }
    }

    pub fn update(&mut self, position: f64, playing: bool, now: f64) {
        self.position = position;
        self.playing = playing;
        self.last_update = now;
    }

    /// Position extrapolated to `now`: while playing, the stored position
    /// advances with wall time.
    pub fn current_position(&self, now: f64) -> f64 {
        if self.playing {
            (self.position + (now - self.last_update)).max(0.0)
        } else {
            self.position
        }
    }

    pub fn info(&self, now: f64) -> PlaybackInfo {
        PlaybackInfo {
            position: self.current_position(now),
            playing: self.playing,
            last_update: self.last_update,
        }
    }
}

/// A scheduled playback command, produced by an accepted mutation and
/// existing only for broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: PlaybackCommandKind,
    pub position: f64,
    pub playing: bool,
    /// Synchronized instant at which all receivers apply the command
    pub target_time: f64,
    pub issued_by: String,
    pub issuer_mode: ParticipantMode,
    pub issued_at: f64,
}

/// Registry entry for a file shared into the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,
    pub owner: String,
    pub chunk_count: u32,
    pub received_chunks: u32,
}

impl SharedFileRecord {
    pub fn is_complete(&self) -> bool {
        self.received_chunks >= self.chunk_count
    }

    /// Count one arrived chunk. Returns `true` when this chunk completed
    /// the file. Records are immutable once complete.
    pub fn record_chunk(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.received_chunks += 1;
        self.is_complete()
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            file_type: self.file_type.clone(),
            owner: self.owner.clone(),
            chunk_count: self.chunk_count,
            received_chunks: self.received_chunks,
            complete: self.is_complete(),
        }
    }
}

/// An active screen share: one host, the viewers attached to it and the
/// declared capture parameters. Signaling payloads are relayed opaquely and
/// never inspected.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenShareSession {
    pub host_id: String,
    pub viewers: HashSet<String>,
    pub quality: String,
    pub frame_rate: u32,
}

/// All state owned by one channel.
///
/// Invariants: `participants.len() <= capacity`; `screen_sharers` contains
/// exactly the participants whose mode is `ScreenShareHost`.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub capacity: usize,
    pub participants: HashMap<String, Participant>,
    pub playback: PlaybackState,
    pub files: HashMap<String, SharedFileRecord>,
    pub screen_sharers: HashSet<String>,
    pub screen_shares: HashMap<String, ScreenShareSession>,
}

impl Channel {
    pub fn new(id: String, capacity: usize, now: f64) -> Self {
        Self {
            id,
            capacity,
            participants: HashMap::new(),
            playback: PlaybackState::new(now),
            files: HashMap::new(),
            screen_sharers: HashSet::new(),
            screen_shares: HashMap::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Keep the sharer set in step with a participant's (new) mode.
    pub fn sync_sharer_set(&mut self, participant_id: &str, mode: ParticipantMode) {
        if mode == ParticipantMode::ScreenShareHost {
            self.screen_sharers.insert(participant_id.to_string());
        } else {
            self.screen_sharers.remove(participant_id);
            self.screen_shares.remove(participant_id);
        }
    }

    /// Roster sorted by join time for stable snapshots.
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        let mut roster: Vec<ParticipantInfo> =
            self.participants.values().map(Participant::info).collect();
        roster.sort_by(|a, b| {
            a.joined_at
                .partial_cmp(&b.joined_at)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        roster
    }

    pub fn file_list(&self) -> Vec<FileInfo> {
        let mut files: Vec<FileInfo> = self.files.values().map(SharedFileRecord::info).collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        files
    }

    pub fn sharer_list(&self) -> Vec<String> {
        let mut sharers: Vec<String> = self.screen_sharers.iter().cloned().collect();
        sharers.sort();
        sharers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_position_interpolates_while_playing() {
        // given: playback started at position 10 at t=100
        let mut playback = PlaybackState::new(100.0);
        playback.update(10.0, true, 100.0);

        // then: 3.5 seconds later the position has advanced
        assert!((playback.current_position(103.5) - 13.5).abs() < 1e-9);
    }

    #[test]
    fn test_playback_position_frozen_while_paused() {
        // given:
        let mut playback = PlaybackState::new(100.0);
        playback.update(42.0, false, 100.0);

        // then:
        assert_eq!(playback.current_position(500.0), 42.0);
    }

    #[test]
    fn test_file_record_completion_fires_once() {
        // given: a two-chunk file
        let mut record = SharedFileRecord {
            id: "f-1".to_string(),
            name: "movie.mkv".to_string(),
            size: 1024,
            file_type: "video/x-matroska".to_string(),
            owner: "u-1".to_string(),
            chunk_count: 2,
            received_chunks: 0,
        };

        // when / then:
        assert!(!record.record_chunk());
        assert!(record.record_chunk());
        assert!(record.is_complete());

        // then: further chunks no longer mutate the record
        assert!(!record.record_chunk());
        assert_eq!(record.received_chunks, 2);
    }

    #[test]
    fn test_sharer_set_follows_mode() {
        // given:
        let mut channel = Channel::new("movie-night".to_string(), 5, 0.0);
        channel.participants.insert(
            "u-1".to_string(),
            Participant::new(
                "u-1".to_string(),
                "alice".to_string(),
                ParticipantMode::ScreenShareHost,
                0.0,
            ),
        );

        // when:
        channel.sync_sharer_set("u-1", ParticipantMode::ScreenShareHost);

        // then:
        assert!(channel.screen_sharers.contains("u-1"));

        // when: the mode moves away from hosting
        channel.sync_sharer_set("u-1", ParticipantMode::Observer);

        // then:
        assert!(!channel.screen_sharers.contains("u-1"));
    }
}
