//! WebSocket connection handling and request dispatch.
//!
//! Each socket runs one receive loop. Frames decode into the closed
//! `ClientRequest` union and are dispatched against the channel authority
//! while its lock is held; accepted mutations turn into broadcasts through
//! the command broadcaster. Every rejection goes back to the originating
//! connection only.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use cinesync_shared::protocol::{
    ClientRequest, DecodeError, ErrorCode, PlaybackCommandKind, ServerMessage,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use crate::authority::ChannelAuthority;
use crate::domain::Command;
use crate::error::ChannelError;
use crate::state::{AppState, ConnectQuery};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    let channel_id = query
        .channel
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "default".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, channel_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound channel for this connection; the broadcaster and the
    // session manager's heartbeat timer feed it
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // The id is assigned by the authority on join; until then the
    // connection may only join or heartbeat
    let mut participant_id: Option<String> = None;

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &channel_id, &mut participant_id, &tx, &text).await;
            }
            Ok(Message::Close(_)) => {
                tracing::info!("Connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    if let Some(id) = participant_id {
        disconnect_participant(state, &channel_id, &id, true).await;
    }
}

/// Send an error back to the originating connection only.
fn send_error(tx: &mpsc::UnboundedSender<String>, code: ErrorCode, message: String) {
    let _ = tx.send(ServerMessage::Error { code, message }.to_json());
}

fn send_channel_error(tx: &mpsc::UnboundedSender<String>, error: &ChannelError) {
    send_error(tx, error.code(), error.to_string());
}

async fn handle_frame(
    state: &Arc<AppState>,
    channel_id: &str,
    participant_id: &mut Option<String>,
    tx: &mpsc::UnboundedSender<String>,
    raw: &str,
) {
    let request = match ClientRequest::decode(raw) {
        Ok(request) => request,
        Err(DecodeError::UnknownType(t)) => {
            send_error(
                tx,
                ErrorCode::UnknownMessage,
                format!("unknown message type '{t}'"),
            );
            return;
        }
        Err(DecodeError::Malformed(reason)) => {
            send_error(tx, ErrorCode::Validation, format!("invalid message: {reason}"));
            return;
        }
    };

    // Any decodable inbound frame counts as liveness
    if let Some(id) = participant_id.as_deref() {
        state.sessions.touch(id).await;
    }

    match request {
        ClientRequest::Join {
            participant_id: requested_id,
            name,
            mode,
        } => {
            if participant_id.is_some() {
                send_error(tx, ErrorCode::Validation, "already in channel".to_string());
                return;
            }
            match join_participant(state, channel_id, requested_id, name, mode, tx).await {
                Ok(id) => *participant_id = Some(id),
                Err(error) => {
                    send_channel_error(tx, &error);
                    // A failed first join must not leave an empty channel behind
                    state.registry.remove_if_empty(channel_id).await;
                }
            }
        }
        ClientRequest::Leave {} => {
            if let Some(id) = participant_id.take() {
                disconnect_participant(state.clone(), channel_id, &id, false).await;
            }
        }
        ClientRequest::Heartbeat {} => {
            if let Some(id) = participant_id.as_deref()
                && let Some(authority) = state.registry.get(channel_id).await
            {
                authority.lock().await.touch(id, state.server_clock.now_secs());
            }
            let message = ServerMessage::Heartbeat {
                server_time: state.server_clock.now_secs(),
            };
            let _ = tx.send(message.to_json());
        }
        ClientRequest::Play { position, .. } => {
            playback_command(state, channel_id, participant_id, tx, PlaybackCommandKind::Play, position, false)
                .await;
        }
        ClientRequest::Pause { position } => {
            playback_command(state, channel_id, participant_id, tx, PlaybackCommandKind::Pause, position, false)
                .await;
        }
        ClientRequest::Seek { position, .. } => {
            playback_command(state, channel_id, participant_id, tx, PlaybackCommandKind::Seek, position, false)
                .await;
        }
        ClientRequest::Sync { position, playing } => {
            playback_command(state, channel_id, participant_id, tx, PlaybackCommandKind::Sync, position, playing)
                .await;
        }
        ClientRequest::ChangeMode { mode } => {
            let Some(issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let now = state.server_clock.now_secs();
            let result = {
                let mut authority = authority.lock().await;
                authority
                    .change_mode(&issuer, &mode, now)
                    .map(|modes| (modes, roster_ids(&authority), authority.snapshot(now).screen_sharers))
            };
            match result {
                Ok(((old, new), targets, screen_sharers)) => {
                    let _ = tx.send(ServerMessage::ModeChanged { old, new }.to_json());
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::ParticipantModeChanged {
                            participant_id: issuer.clone(),
                            old,
                            new,
                            screen_sharers,
                        },
                        Some(&issuer),
                    )
                    .await;
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::FileUpload {
            name,
            size,
            file_type,
            chunk_count,
        } => {
            let Some(issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let result = authority
                .lock()
                .await
                .register_file_upload(&issuer, &name, size, &file_type, chunk_count);
            match result {
                Ok(file_id) => {
                    let _ = tx.send(ServerMessage::FileUploadStarted { file_id }.to_json());
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::FileChunk { file_id, .. } => {
            let Some(_issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let result = {
                let mut authority = authority.lock().await;
                authority
                    .record_chunk(&file_id)
                    .map(|progress| {
                        let file = authority
                            .snapshot(state.server_clock.now_secs())
                            .files
                            .into_iter()
                            .find(|f| f.id == file_id);
                        (progress, file, roster_ids(&authority))
                    })
            };
            match result {
                Ok((progress, file, targets)) => {
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::FileUploadProgress {
                            file_id: progress.file_id.clone(),
                            received_chunks: progress.received_chunks,
                            chunk_count: progress.chunk_count,
                        },
                        None,
                    )
                    .await;
                    if progress.completed
                        && let Some(file) = file
                    {
                        broadcast_and_evict(
                            state,
                            channel_id,
                            &targets,
                            &ServerMessage::FileAvailable {
                                file_id: file.id,
                                name: file.name,
                                size: file.size,
                                file_type: file.file_type,
                                owner: file.owner,
                            },
                            None,
                        )
                        .await;
                    }
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::FileDownloadRequest { file_id } => {
            let Some(issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let now = state.server_clock.now_secs();
            let result = {
                let mut authority = authority.lock().await;
                let old_mode = authority.participant_mode(&issuer);
                authority.request_download(&issuer, &file_id, now).map(|info| {
                    (
                        info,
                        old_mode,
                        authority.participant_mode(&issuer),
                        roster_ids(&authority),
                        authority.snapshot(now).screen_sharers,
                    )
                })
            };
            match result {
                Ok((info, old_mode, new_mode, targets, screen_sharers)) => {
                    let _ = tx.send(
                        ServerMessage::FileDownloadReady {
                            file_id: info.id,
                            name: info.name,
                            size: info.size,
                            file_type: info.file_type,
                        }
                        .to_json(),
                    );
                    // The download switched the requester's mode; everyone
                    // else learns about it the usual way
                    if let (Some(old), Some(new)) = (old_mode, new_mode)
                        && old != new
                    {
                        broadcast_and_evict(
                            state,
                            channel_id,
                            &targets,
                            &ServerMessage::ParticipantModeChanged {
                                participant_id: issuer.clone(),
                                old,
                                new,
                                screen_sharers,
                            },
                            Some(&issuer),
                        )
                        .await;
                    }
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::ScreenshareStart { quality, frame_rate } => {
            let Some(issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let now = state.server_clock.now_secs();
            let result = {
                let mut authority = authority.lock().await;
                authority
                    .start_screen_share(&issuer, &quality, frame_rate, now)
                    .map(|modes| (modes, roster_ids(&authority), authority.snapshot(now).screen_sharers))
            };
            match result {
                Ok(((old, new), targets, screen_sharers)) => {
                    let _ = tx.send(ServerMessage::ModeChanged { old, new }.to_json());
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::ParticipantModeChanged {
                            participant_id: issuer.clone(),
                            old,
                            new,
                            screen_sharers,
                        },
                        Some(&issuer),
                    )
                    .await;
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::ScreenshareAvailable {
                            host_id: issuer.clone(),
                            quality,
                            frame_rate,
                        },
                        Some(&issuer),
                    )
                    .await;
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::ScreenshareStop { fallback_mode } => {
            let Some(issuer) = require_joined(participant_id, tx) else {
                return;
            };
            let Some(authority) = state.registry.get(channel_id).await else {
                return;
            };
            let now = state.server_clock.now_secs();
            let result = {
                let mut authority = authority.lock().await;
                authority
                    .stop_screen_share(&issuer, fallback_mode.as_deref(), now)
                    .map(|modes| (modes, roster_ids(&authority), authority.snapshot(now).screen_sharers))
            };
            match result {
                Ok(((old, new), targets, screen_sharers)) => {
                    let _ = tx.send(ServerMessage::ModeChanged { old, new }.to_json());
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::ScreenshareEnded {
                            host_id: issuer.clone(),
                        },
                        Some(&issuer),
                    )
                    .await;
                    broadcast_and_evict(
                        state,
                        channel_id,
                        &targets,
                        &ServerMessage::ParticipantModeChanged {
                            participant_id: issuer.clone(),
                            old,
                            new,
                            screen_sharers,
                        },
                        Some(&issuer),
                    )
                    .await;
                }
                Err(error) => send_channel_error(tx, &error),
            }
        }
        ClientRequest::ScreenshareOffer { target, payload } => {
            relay_signal(state, channel_id, participant_id, tx, &target, |from| {
                ServerMessage::ScreenshareOffer { from, payload }
            })
            .await;
        }
        ClientRequest::ScreenshareAnswer { target, payload } => {
            // The answer edge is where a viewer attaches to a host's session
            if let Some(viewer) = participant_id.as_deref()
                && let Some(authority) = state.registry.get(channel_id).await
            {
                authority.lock().await.note_screen_share_viewer(&target, viewer);
            }
            relay_signal(state, channel_id, participant_id, tx, &target, |from| {
                ServerMessage::ScreenshareAnswer { from, payload }
            })
            .await;
        }
        ClientRequest::IceCandidate { target, payload } => {
            relay_signal(state, channel_id, participant_id, tx, &target, |from| {
                ServerMessage::IceCandidate { from, payload }
            })
            .await;
        }
    }
}

/// Join flow: claim any grace-window state, run the authority mutation,
/// register the connection and announce the newcomer.
async fn join_participant(
    state: &Arc<AppState>,
    channel_id: &str,
    requested_id: Option<String>,
    name: Option<String>,
    mode: Option<String>,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<String, ChannelError> {
    let now = state.server_clock.now_secs();
    let authority = state.registry.get_or_create(channel_id, now).await;

    let restored_mode = requested_id
        .as_deref()
        .and_then(|id| state.sessions.take_rejoin(id, channel_id));

    let outcome = {
        let mut authority = authority.lock().await;
        authority.join(
            requested_id,
            name.as_deref(),
            mode.as_deref(),
            restored_mode,
            now,
        )?
    };
    let id = outcome.participant.id.clone();

    let evict_state = state.clone();
    let evict_channel = channel_id.to_string();
    let evict_id = id.clone();
    state
        .sessions
        .register(
            &id,
            channel_id,
            tx.clone(),
            state.server_clock.clone(),
            async move {
                disconnect_participant(evict_state, &evict_channel, &evict_id, true).await;
            },
        )
        .await;

    let welcome = ServerMessage::Welcome {
        participant_id: id.clone(),
        name: outcome.participant.name.clone(),
        mode: outcome.participant.mode,
        playback: outcome.snapshot.playback,
        participants: outcome.snapshot.participants.clone(),
        files: outcome.snapshot.files.clone(),
        screen_sharers: outcome.snapshot.screen_sharers.clone(),
        clock_offset: state.server_clock.offset_ms(),
        server_time: now,
    };
    let _ = tx.send(welcome.to_json());

    let targets: Vec<String> = outcome
        .snapshot
        .participants
        .iter()
        .map(|p| p.id.clone())
        .collect();
    broadcast_and_evict(
        state,
        channel_id,
        &targets,
        &ServerMessage::UserJoined {
            participant: outcome.participant.info(),
            total: targets.len(),
            screen_sharers: outcome.snapshot.screen_sharers,
        },
        Some(&id),
    )
    .await;

    Ok(id)
}

/// Shared playback mutation path for play/pause/seek/sync.
async fn playback_command(
    state: &Arc<AppState>,
    channel_id: &str,
    participant_id: &Option<String>,
    tx: &mpsc::UnboundedSender<String>,
    kind: PlaybackCommandKind,
    position: f64,
    playing_for_sync: bool,
) {
    let Some(issuer) = require_joined(participant_id, tx) else {
        return;
    };
    let Some(authority) = state.registry.get(channel_id).await else {
        return;
    };

    // Commands schedule a future instant; refresh a stale offset out of
    // band so the channel never waits on the network
    state
        .server_clock
        .clone()
        .maybe_resync(state.time_sources.clone());

    let now = state.server_clock.now_secs();
    let result = {
        let mut authority = authority.lock().await;
        authority
            .apply_playback_command(&issuer, kind, position, playing_for_sync, now)
            .map(|command| (command, roster_ids(&authority)))
    };
    match result {
        Ok((command, targets)) => {
            let message = command_message(&command, now);
            broadcast_and_evict(state, channel_id, &targets, &message, Some(&issuer)).await;
        }
        Err(error) => send_channel_error(tx, &error),
    }
}

fn command_message(command: &Command, server_time: f64) -> ServerMessage {
    match command.kind {
        PlaybackCommandKind::Play => ServerMessage::Play {
            position: command.position,
            target_time: command.target_time,
            issued_by: command.issued_by.clone(),
            issuer_mode: command.issuer_mode,
            server_time,
        },
        PlaybackCommandKind::Pause => ServerMessage::Pause {
            position: command.position,
            target_time: command.target_time,
            issued_by: command.issued_by.clone(),
            issuer_mode: command.issuer_mode,
            server_time,
        },
        PlaybackCommandKind::Seek => ServerMessage::Seek {
            position: command.position,
            target_time: command.target_time,
            issued_by: command.issued_by.clone(),
            issuer_mode: command.issuer_mode,
            server_time,
        },
        PlaybackCommandKind::Sync => ServerMessage::Sync {
            position: command.position,
            playing: command.playing,
            server_time,
        },
    }
}

/// Opaque signaling relay; warns and drops when the target is absent.
async fn relay_signal<F>(
    state: &Arc<AppState>,
    channel_id: &str,
    participant_id: &Option<String>,
    tx: &mpsc::UnboundedSender<String>,
    target: &str,
    build: F,
) where
    F: FnOnce(String) -> ServerMessage,
{
    let Some(from) = require_joined(participant_id, tx) else {
        return;
    };
    let target_connected = {
        match state.registry.get(channel_id).await {
            Some(authority) => authority.lock().await.contains(target),
            None => false,
        }
    };
    if !target_connected {
        tracing::warn!(
            "Signal relay target '{}' not present in channel '{}', dropping",
            target,
            channel_id
        );
        return;
    }
    if let Err(e) = state.broadcaster.push_to(target, &build(from)).await {
        tracing::warn!("Signal relay failed: {}", e);
    }
}

fn require_joined(
    participant_id: &Option<String>,
    tx: &mpsc::UnboundedSender<String>,
) -> Option<String> {
    match participant_id {
        Some(id) => Some(id.clone()),
        None => {
            send_error(
                tx,
                ErrorCode::Validation,
                "join the channel first".to_string(),
            );
            None
        }
    }
}

fn roster_ids(authority: &ChannelAuthority) -> Vec<String> {
    authority.participant_ids()
}

/// Deliver a broadcast and evict any connection whose send failed.
///
/// Returns a boxed future with an explicit `Send` bound rather than being an
/// `async fn`: it and `disconnect_participant` are mutually recursive (eviction
/// re-enters disconnect), and type-erasing this node breaks the `Send`
/// auto-trait inference cycle the recursion would otherwise create.
fn broadcast_and_evict<'a>(
    state: &'a Arc<AppState>,
    channel_id: &'a str,
    targets: &'a [String],
    message: &'a ServerMessage,
    exclude: Option<&'a str>,
) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let failed = state.broadcaster.broadcast(targets, message, exclude).await;
        for id in failed {
            let state = state.clone();
            let channel_id = channel_id.to_string();
            // Boxed so the eviction future's type does not recurse through
            // the broadcast path that spawned it
            let eviction: std::pin::Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(async move {
                    disconnect_participant(state, &channel_id, &id, true).await;
                });
            tokio::spawn(eviction);
        }
    })
}

/// Remove a participant after a disconnect, eviction or explicit leave.
///
/// Transport-initiated departures are remembered for the rejoin grace
/// window; an explicit leave is final.
pub async fn disconnect_participant(
    state: Arc<AppState>,
    channel_id: &str,
    participant_id: &str,
    remember: bool,
) {
    let Some(authority) = state.registry.get(channel_id).await else {
        state.sessions.unregister(participant_id).await;
        return;
    };

    let departed = {
        let mut authority = authority.lock().await;
        authority
            .leave(participant_id)
            .map(|participant| (participant, roster_ids(&authority)))
    };
    state.sessions.unregister(participant_id).await;

    if let Some((participant, targets)) = departed {
        if remember {
            state
                .sessions
                .remember_departure(participant_id, channel_id, participant.mode);
        }
        broadcast_and_evict(
            &state,
            channel_id,
            &targets,
            &ServerMessage::UserLeft {
                participant_id: participant.id,
                name: participant.name,
                total: targets.len(),
            },
            None,
        )
        .await;
    }

    state.registry.remove_if_empty(channel_id).await;
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "clockOffsetMs": state.server_clock.offset_ms(),
        "clockAccuracy": state.server_clock.accuracy().as_str(),
        "clockDegraded": state.server_clock.is_degraded(),
        "channels": state.registry.count().await,
    }))
}

/// Channel listing endpoint
pub async fn get_channels(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<crate::registry::ChannelSummary>> {
    Json(state.registry.summaries().await)
}
