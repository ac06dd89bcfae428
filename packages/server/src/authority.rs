//! Per-channel authority: the single serialized owner of a channel's
//! mutable state.
//!
//! Every mutation goes through one of the `Result`-returning operations
//! below while the caller holds the channel's mutex, so exactly one mutation
//! is in flight at a time, in receipt order. The authority validates, updates
//! state under the synchronized clock and returns the data the handler needs
//! for the corresponding broadcast; it never touches a socket itself.

use cinesync_shared::protocol::{FileInfo, ParticipantMode, PlaybackCommandKind};
use uuid::Uuid;

use crate::domain::{
    Channel, Command, Participant, ScreenShareSession, SharedFileRecord,
};
use crate::error::ChannelError;

/// Everything a joining participant needs to calibrate and render.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Participant,
    pub snapshot: ChannelSnapshot,
    /// Whether the entry was restored from a grace-window departure
    pub rejoined: bool,
}

/// Point-in-time view of a channel, playback position interpolated to `now`.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub playback: cinesync_shared::protocol::PlaybackInfo,
    pub participants: Vec<cinesync_shared::protocol::ParticipantInfo>,
    pub files: Vec<FileInfo>,
    pub screen_sharers: Vec<String>,
}

/// Progress of one upload after a chunk arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub file_id: String,
    pub received_chunks: u32,
    pub chunk_count: u32,
    /// Set exactly once, on the chunk that completed the file
    pub completed: bool,
}

pub struct ChannelAuthority {
    channel: Channel,
}

impl ChannelAuthority {
    pub fn new(channel_id: String, capacity: usize, now: f64) -> Self {
        Self {
            channel: Channel::new(channel_id, capacity, now),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel.id
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.channel.participants.len()
    }

    pub fn capacity(&self) -> usize {
        self.channel.capacity
    }

    pub fn participant_mode(&self, participant_id: &str) -> Option<ParticipantMode> {
        self.channel
            .participants
            .get(participant_id)
            .map(|p| p.mode)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.channel.participants.contains_key(participant_id)
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.channel.participants.keys().cloned().collect()
    }

    pub fn snapshot(&self, now: f64) -> ChannelSnapshot {
        ChannelSnapshot {
            playback: self.channel.playback.info(now),
            participants: self.channel.roster(),
            files: self.channel.file_list(),
            screen_sharers: self.channel.sharer_list(),
        }
    }

    /// Refresh a participant's liveness timestamp.
    pub fn touch(&mut self, participant_id: &str, now: f64) {
        if let Some(participant) = self.channel.participants.get_mut(participant_id) {
            participant.last_seen = now;
        }
    }

    /// Insert a participant and return the welcome snapshot.
    ///
    /// A missing name or mode is a validation error; a full roster is a
    /// capacity error. `restored_mode` (from the session manager's
    /// grace-window memory) overrides the requested mode so a rejoining
    /// participant comes back as it left.
    pub fn join(
        &mut self,
        participant_id: Option<String>,
        name: Option<&str>,
        mode: Option<&str>,
        restored_mode: Option<ParticipantMode>,
        now: f64,
    ) -> Result<JoinOutcome, ChannelError> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ChannelError::Validation("missing required field 'name'".into()))?;
        let requested_mode = match restored_mode {
            Some(mode) => mode,
            None => {
                let raw = mode.ok_or_else(|| {
                    ChannelError::Validation("missing required field 'mode'".into())
                })?;
                ParticipantMode::from_wire(raw)
                    .ok_or_else(|| ChannelError::Validation(format!("unknown mode '{raw}'")))?
            }
        };

        if let Some(id) = &participant_id
            && self.channel.participants.contains_key(id)
        {
            return Err(ChannelError::Validation(format!(
                "participant '{id}' is already in the channel"
            )));
        }
        if self.channel.is_full() {
            return Err(ChannelError::Capacity(self.channel.capacity));
        }

        let id = participant_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let participant = Participant::new(id.clone(), name.to_string(), requested_mode, now);
        self.channel.participants.insert(id.clone(), participant.clone());
        self.channel.sync_sharer_set(&id, requested_mode);

        tracing::info!(
            "Participant '{}' ({}) joined channel '{}' as {}",
            name,
            id,
            self.channel.id,
            requested_mode
        );

        Ok(JoinOutcome {
            participant,
            snapshot: self.snapshot(now),
            rejoined: restored_mode.is_some(),
        })
    }

    /// Remove a participant and its screen-share membership. Idempotent:
    /// removing an absent participant is a no-op returning `None`.
    pub fn leave(&mut self, participant_id: &str) -> Option<Participant> {
        let participant = self.channel.participants.remove(participant_id)?;
        self.channel.screen_sharers.remove(participant_id);
        self.channel.screen_shares.remove(participant_id);
        // Prune the departed participant from any viewer sets it sat in
        for session in self.channel.screen_shares.values_mut() {
            session.viewers.remove(participant_id);
        }
        tracing::info!(
            "Participant '{}' ({}) left channel '{}'",
            participant.name,
            participant_id,
            self.channel.id
        );
        Some(participant)
    }

    /// Switch a participant's mode. Any mode may transition to any other;
    /// an unrecognized target leaves the state untouched.
    pub fn change_mode(
        &mut self,
        participant_id: &str,
        new_mode: &str,
        now: f64,
    ) -> Result<(ParticipantMode, ParticipantMode), ChannelError> {
        let new_mode = ParticipantMode::from_wire(new_mode)
            .ok_or_else(|| ChannelError::Validation(format!("unknown mode '{new_mode}'")))?;
        let participant = self
            .channel
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| {
                ChannelError::Validation(format!("unknown participant '{participant_id}'"))
            })?;

        let old_mode = participant.mode;
        participant.mode = new_mode;
        participant.last_seen = now;
        self.channel.sync_sharer_set(participant_id, new_mode);
        if old_mode == ParticipantMode::ScreenShareViewer
            && new_mode != ParticipantMode::ScreenShareViewer
        {
            for session in self.channel.screen_shares.values_mut() {
                session.viewers.remove(participant_id);
            }
        }
        Ok((old_mode, new_mode))
    }

    /// Apply a playback mutation and produce the scheduled command to
    /// broadcast. Rejected issuers leave the playback state untouched.
    pub fn apply_playback_command(
        &mut self,
        issuer_id: &str,
        kind: PlaybackCommandKind,
        position: f64,
        playing_for_sync: bool,
        now: f64,
    ) -> Result<Command, ChannelError> {
        let issuer = self.channel.participants.get(issuer_id).ok_or_else(|| {
            ChannelError::Validation(format!("unknown participant '{issuer_id}'"))
        })?;
        if !issuer.mode.can_control_playback() {
            return Err(ChannelError::Authorization(issuer.mode.as_wire().into()));
        }
        if !position.is_finite() || position < 0.0 {
            return Err(ChannelError::Validation(format!(
                "invalid position {position}"
            )));
        }

        let issuer_mode = issuer.mode;
        let playing = match kind {
            PlaybackCommandKind::Play => true,
            PlaybackCommandKind::Pause => false,
            PlaybackCommandKind::Seek => self.channel.playback.playing,
            PlaybackCommandKind::Sync => playing_for_sync,
        };
        self.channel.playback.update(position, playing, now);

        Ok(Command {
            kind,
            position,
            playing,
            target_time: now + kind.lead_secs(),
            issued_by: issuer_id.to_string(),
            issuer_mode,
            issued_at: now,
        })
    }

    /// Open a new upload in the file registry.
    pub fn register_file_upload(
        &mut self,
        owner_id: &str,
        name: &str,
        size: u64,
        file_type: &str,
        chunk_count: u32,
    ) -> Result<String, ChannelError> {
        if !self.channel.participants.contains_key(owner_id) {
            return Err(ChannelError::Validation(format!(
                "unknown participant '{owner_id}'"
            )));
        }
        if name.trim().is_empty() {
            return Err(ChannelError::Validation("missing file name".into()));
        }
        if chunk_count == 0 {
            return Err(ChannelError::Validation(
                "chunk count must be positive".into(),
            ));
        }

        let file_id = Uuid::new_v4().to_string();
        self.channel.files.insert(
            file_id.clone(),
            SharedFileRecord {
                id: file_id.clone(),
                name: name.to_string(),
                size,
                file_type: file_type.to_string(),
                owner: owner_id.to_string(),
                chunk_count,
                received_chunks: 0,
            },
        );
        tracing::debug!(
            "Upload '{}' ({} chunks) registered in channel '{}'",
            name,
            chunk_count,
            self.channel.id
        );
        Ok(file_id)
    }

    /// Count one arrived chunk of an upload.
    pub fn record_chunk(&mut self, file_id: &str) -> Result<ChunkProgress, ChannelError> {
        let record = self
            .channel
            .files
            .get_mut(file_id)
            .ok_or_else(|| ChannelError::Validation(format!("unknown file '{file_id}'")))?;
        let completed = record.record_chunk();
        Ok(ChunkProgress {
            file_id: file_id.to_string(),
            received_chunks: record.received_chunks,
            chunk_count: record.chunk_count,
            completed,
        })
    }

    /// Hand out a completed file for download. Side effect: the requesting
    /// participant's mode becomes `FileDownload`.
    pub fn request_download(
        &mut self,
        participant_id: &str,
        file_id: &str,
        now: f64,
    ) -> Result<FileInfo, ChannelError> {
        let info = {
            let record = self
                .channel
                .files
                .get(file_id)
                .ok_or_else(|| ChannelError::Validation(format!("unknown file '{file_id}'")))?;
            if !record.is_complete() {
                return Err(ChannelError::Validation(format!(
                    "file '{file_id}' is not fully uploaded yet"
                )));
            }
            record.info()
        };
        self.change_mode(participant_id, ParticipantMode::FileDownload.as_wire(), now)?;
        Ok(info)
    }

    /// Begin a screen share. Side effect: the host's mode becomes
    /// `ScreenShareHost` and it enters the sharer set.
    pub fn start_screen_share(
        &mut self,
        participant_id: &str,
        quality: &str,
        frame_rate: u32,
        now: f64,
    ) -> Result<(ParticipantMode, ParticipantMode), ChannelError> {
        let modes = self.change_mode(
            participant_id,
            ParticipantMode::ScreenShareHost.as_wire(),
            now,
        )?;
        self.channel.screen_shares.insert(
            participant_id.to_string(),
            ScreenShareSession {
                host_id: participant_id.to_string(),
                viewers: Default::default(),
                quality: quality.to_string(),
                frame_rate,
            },
        );
        Ok(modes)
    }

    /// End a screen share, dropping the session and moving the host to the
    /// requested fallback mode (observer when unspecified).
    pub fn stop_screen_share(
        &mut self,
        participant_id: &str,
        fallback_mode: Option<&str>,
        now: f64,
    ) -> Result<(ParticipantMode, ParticipantMode), ChannelError> {
        if !self.channel.screen_shares.contains_key(participant_id) {
            return Err(ChannelError::Validation(format!(
                "participant '{participant_id}' is not screen sharing"
            )));
        }
        let fallback = fallback_mode.unwrap_or(ParticipantMode::Observer.as_wire());
        // change_mode away from hosting drops the session and sharer entry
        self.change_mode(participant_id, fallback, now)
    }

    /// Attach a viewer to a host's screen-share session (derived from the
    /// signaling edge: an answer sent back to the host).
    pub fn note_screen_share_viewer(&mut self, host_id: &str, viewer_id: &str) {
        if let Some(session) = self.channel.screen_shares.get_mut(host_id) {
            session.viewers.insert(viewer_id.to_string());
        }
    }

    pub fn screen_share_session(&self, host_id: &str) -> Option<&ScreenShareSession> {
        self.channel.screen_shares.get(host_id)
    }
}
