//! WebSocket wire protocol.
//!
//! Inbound and outbound payloads form two closed tagged unions discriminated
//! by a `type` field (snake_case tags, camelCase payload fields). Decoding an
//! unrecognized `type` is distinguished from a malformed payload so the
//! server can answer with the right error code.

use serde::{Deserialize, Serialize};

/// Participant role within a channel, determining its capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantMode {
    /// Plays a local copy of the content; may issue playback commands
    #[serde(rename = "localplay")]
    LocalPlay,
    /// Shares its screen; may issue playback commands
    #[serde(rename = "screenshare_host")]
    ScreenShareHost,
    /// Watches another participant's screen share
    #[serde(rename = "screenshare_viewer")]
    ScreenShareViewer,
    /// Downloading a shared file
    #[serde(rename = "file_download")]
    FileDownload,
    /// Watching along without any capability
    #[serde(rename = "observer")]
    Observer,
}

impl ParticipantMode {
    /// Parse a wire-format mode name. `None` for anything unrecognized;
    /// the caller turns that into a validation error.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "localplay" => Some(Self::LocalPlay),
            "screenshare_host" => Some(Self::ScreenShareHost),
            "screenshare_viewer" => Some(Self::ScreenShareViewer),
            "file_download" => Some(Self::FileDownload),
            "observer" => Some(Self::Observer),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::LocalPlay => "localplay",
            Self::ScreenShareHost => "screenshare_host",
            Self::ScreenShareViewer => "screenshare_viewer",
            Self::FileDownload => "file_download",
            Self::Observer => "observer",
        }
    }

    /// Only local players and screen-share hosts may mutate playback state.
    pub fn can_control_playback(&self) -> bool {
        matches!(self, Self::LocalPlay | Self::ScreenShareHost)
    }
}

impl std::fmt::Display for ParticipantMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Kind of a scheduled playback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackCommandKind {
    Play,
    Pause,
    Seek,
    /// Periodic state echo; applied immediately, not scheduled
    Sync,
}

impl PlaybackCommandKind {
    /// Lead time added to "now" so the broadcast reaches every receiver
    /// before the scheduled instant.
    pub fn lead_secs(&self) -> f64 {
        match self {
            Self::Play => 0.1,
            Self::Pause | Self::Seek => 0.2,
            Self::Sync => 0.0,
        }
    }
}

/// Error classes surfaced to the originating connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Capacity,
    Authorization,
    UnknownMessage,
    Transport,
    ClockSync,
}

/// Roster entry as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub mode: ParticipantMode,
    pub joined_at: f64,
    pub last_seen: f64,
}

/// Authoritative playback state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    /// Position in seconds
    pub position: f64,
    pub playing: bool,
    /// Synchronized time of the last mutation (seconds)
    pub last_update: f64,
}

/// Shared file registry entry as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,
    pub owner: String,
    pub chunk_count: u32,
    pub received_chunks: u32,
    pub complete: bool,
}

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Join the channel; `participant_id` is only set when rejoining
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        /// Wire mode name; validated server-side so an unknown mode is a
        /// validation error rather than an undecodable message
        #[serde(default)]
        mode: Option<String>,
    },
    Leave {},
    Heartbeat {},
    #[serde(rename_all = "camelCase")]
    Play {
        position: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_time: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Pause { position: f64 },
    #[serde(rename_all = "camelCase")]
    Seek {
        position: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_time: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Sync { position: f64, playing: bool },
    #[serde(rename_all = "camelCase")]
    ChangeMode { mode: String },
    #[serde(rename_all = "camelCase")]
    FileUpload {
        name: String,
        size: u64,
        file_type: String,
        chunk_count: u32,
    },
    /// Marker that one chunk of an upload arrived (payload bytes travel out
    /// of band)
    #[serde(rename_all = "camelCase")]
    FileChunk { file_id: String, index: u32 },
    #[serde(rename_all = "camelCase")]
    FileDownloadRequest { file_id: String },
    #[serde(rename_all = "camelCase")]
    ScreenshareStart { quality: String, frame_rate: u32 },
    #[serde(rename_all = "camelCase")]
    ScreenshareStop {
        #[serde(default)]
        fallback_mode: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareOffer {
        target: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareAnswer {
        target: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: String,
        payload: serde_json::Value,
    },
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Syntactically valid JSON with a `type` outside the protocol
    UnknownType(String),
    /// Not JSON, no `type` field, or fields that don't match the variant
    Malformed(String),
}

impl ClientRequest {
    /// Decode an inbound text frame, separating "we don't speak this
    /// message" from "this message is broken".
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing 'type' field".to_string()))?
            .to_string();
        match serde_json::from_value::<Self>(value) {
            Ok(request) => Ok(request),
            Err(e) => {
                if KNOWN_TYPES.contains(&tag.as_str()) {
                    Err(DecodeError::Malformed(e.to_string()))
                } else {
                    Err(DecodeError::UnknownType(tag))
                }
            }
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "join",
    "leave",
    "heartbeat",
    "play",
    "pause",
    "seek",
    "sync",
    "change_mode",
    "file_upload",
    "file_chunk",
    "file_download_request",
    "screenshare_start",
    "screenshare_stop",
    "screenshare_offer",
    "screenshare_answer",
    "ice_candidate",
];

/// Messages the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full channel snapshot for a participant that just joined
    #[serde(rename_all = "camelCase")]
    Welcome {
        participant_id: String,
        name: String,
        mode: ParticipantMode,
        playback: PlaybackInfo,
        participants: Vec<ParticipantInfo>,
        files: Vec<FileInfo>,
        screen_sharers: Vec<String>,
        /// Server's reference-clock offset in milliseconds, for immediate
        /// calibration by the joiner
        clock_offset: i64,
        server_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { server_time: f64 },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        participant: ParticipantInfo,
        total: usize,
        screen_sharers: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        participant_id: String,
        name: String,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        position: f64,
        target_time: f64,
        issued_by: String,
        issuer_mode: ParticipantMode,
        server_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Pause {
        position: f64,
        target_time: f64,
        issued_by: String,
        issuer_mode: ParticipantMode,
        server_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Seek {
        position: f64,
        target_time: f64,
        issued_by: String,
        issuer_mode: ParticipantMode,
        server_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Sync {
        position: f64,
        playing: bool,
        server_time: f64,
    },
    /// To the issuer of a successful change_mode
    #[serde(rename_all = "camelCase")]
    ModeChanged {
        old: ParticipantMode,
        new: ParticipantMode,
    },
    /// To everyone else after a mode change
    #[serde(rename_all = "camelCase")]
    ParticipantModeChanged {
        participant_id: String,
        old: ParticipantMode,
        new: ParticipantMode,
        screen_sharers: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileUploadStarted { file_id: String },
    #[serde(rename_all = "camelCase")]
    FileUploadProgress {
        file_id: String,
        received_chunks: u32,
        chunk_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileAvailable {
        file_id: String,
        name: String,
        size: u64,
        file_type: String,
        owner: String,
    },
    #[serde(rename_all = "camelCase")]
    FileDownloadReady {
        file_id: String,
        name: String,
        size: u64,
        file_type: String,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareAvailable {
        host_id: String,
        quality: String,
        frame_rate: u32,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareEnded { host_id: String },
    #[serde(rename_all = "camelCase")]
    ScreenshareOffer {
        from: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareAnswer {
        from: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // A closed set of serde-derived variants cannot fail to serialize
        serde_json::to_string(self).expect("server message serializes")
    }
}
