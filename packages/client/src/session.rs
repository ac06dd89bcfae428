//! WebSocket session: connect, join, heartbeat, reconnect and command
//! dispatch.
//!
//! Inbound scheduled commands are executed by an owned task that sleeps
//! until synchronized "now" reaches the command's target time and then runs
//! the drift controller; a newer command replaces a pending one. On
//! disconnect the session retries with a bounded number of attempts and
//! rejoins with its prior participant id and mode, so the server can
//! reattach it within the grace window.

use std::sync::Arc;
use std::time::Duration;

use cinesync_shared::protocol::{ClientRequest, ServerMessage};
use cinesync_shared::time::{Clock, SystemClock};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::drift::{DriftController, TargetState};
use crate::error::ClientError;
use crate::player::PlayerDriver;
use crate::sync::ClockSynchronizer;

/// Session tuning and identity.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub url: String,
    pub channel: String,
    pub name: String,
    /// Wire mode name to join with
    pub mode: String,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl SessionOptions {
    fn endpoint(&self) -> String {
        format!("{}?channel={}", self.url, self.channel)
    }
}

/// Commands coming from the interactive prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Play,
    Pause,
    Seek(f64),
    Mode(String),
    Status,
    Quit,
}

/// Why the inner connection loop ended.
enum LoopEnd {
    Quit,
    ConnectionLost,
}

struct SessionState {
    participant_id: Option<String>,
    mode: String,
    /// Last authoritative playing flag, used when a seek command leaves the
    /// play state untouched
    authoritative_playing: bool,
    sync: ClockSynchronizer,
    controller: Arc<Mutex<DriftController>>,
    pending_command: Option<JoinHandle<()>>,
    clock: SystemClock,
}

impl SessionState {
    fn cancel_pending_command(&mut self) {
        if let Some(task) = self.pending_command.take() {
            task.abort();
        }
    }
}

/// Run the client session until the user quits or reconnection is
/// exhausted.
pub async fn run_session(
    options: SessionOptions,
    player: Arc<dyn PlayerDriver>,
    mut user_rx: mpsc::UnboundedReceiver<UserCommand>,
) -> Result<(), ClientError> {
    let mut state = SessionState {
        participant_id: None,
        mode: options.mode.clone(),
        authoritative_playing: false,
        sync: ClockSynchronizer::new(),
        controller: Arc::new(Mutex::new(DriftController::new(player.clone()))),
        pending_command: None,
        clock: SystemClock,
    };

    let mut attempts: u32 = 0;
    loop {
        match connect_once(&options, &player, &mut state, &mut user_rx).await {
            Ok(LoopEnd::Quit) => return Ok(()),
            Ok(LoopEnd::ConnectionLost) | Err(_) => {
                state.cancel_pending_command();
                state.controller.lock().await.cancel_pending_reset();
                attempts += 1;
                if attempts > options.max_reconnect_attempts {
                    return Err(ClientError::ReconnectExhausted(
                        options.max_reconnect_attempts,
                    ));
                }
                tracing::info!(
                    "Reconnecting, attempt {} of {}",
                    attempts,
                    options.max_reconnect_attempts
                );
                tokio::time::sleep(options.reconnect_delay).await;
            }
        }
    }
}

async fn connect_once(
    options: &SessionOptions,
    player: &Arc<dyn PlayerDriver>,
    state: &mut SessionState,
    user_rx: &mut mpsc::UnboundedReceiver<UserCommand>,
) -> Result<LoopEnd, ClientError> {
    let endpoint = options.endpoint();
    let (ws_stream, _response) = tokio::time::timeout(
        Duration::from_secs(10),
        connect_async(&endpoint),
    )
    .await
    .map_err(|_| ClientError::Connection("connection timeout".to_string()))?
    .map_err(|e| ClientError::Connection(e.to_string()))?;
    tracing::info!("Connected to {}", endpoint);

    let (mut write, mut read) = ws_stream.split();

    // Join (or rejoin with the prior id so the server reattaches us)
    let join = ClientRequest::Join {
        participant_id: state.participant_id.clone(),
        name: Some(options.name.clone()),
        mode: Some(state.mode.clone()),
    };
    send_request(&mut write, &join).await?;

    let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it, the join just went out
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = read.next() => {
                let Some(frame) = frame else {
                    tracing::warn!("Server closed the connection");
                    return Ok(LoopEnd::ConnectionLost);
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_server_message(state, &text).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Server closed the connection");
                        return Ok(LoopEnd::ConnectionLost);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket read error: {}", e);
                        return Ok(LoopEnd::ConnectionLost);
                    }
                }
            }
            _ = heartbeat.tick() => {
                state.sync.note_heartbeat_sent(state.clock.now_unix_millis());
                send_request(&mut write, &ClientRequest::Heartbeat {}).await?;
            }
            command = user_rx.recv() => {
                let Some(command) = command else {
                    // Prompt thread is gone; treat like quit
                    let _ = send_request(&mut write, &ClientRequest::Leave {}).await;
                    return Ok(LoopEnd::Quit);
                };
                if handle_user_command(state, player, &mut write, command).await? {
                    return Ok(LoopEnd::Quit);
                }
            }
        }
    }
}

async fn send_request<S>(write: &mut S, request: &ClientRequest) -> Result<(), ClientError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json =
        serde_json::to_string(request).map_err(|e| ClientError::Connection(e.to_string()))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))
}

async fn handle_server_message(state: &mut SessionState, raw: &str) {
    let message = match serde_json::from_str::<ServerMessage>(raw) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Undecodable server message: {} ({})", raw, e);
            return;
        }
    };

    match message {
        ServerMessage::Welcome {
            participant_id,
            mode,
            playback,
            participants,
            screen_sharers,
            server_time,
            ..
        } => {
            state.participant_id = Some(participant_id);
            state.mode = mode.as_wire().to_string();
            state.authoritative_playing = playback.playing;
            state
                .sync
                .note_server_time(server_time, state.clock.now_unix_millis());
            tracing::info!(
                "Joined as {} ({} participant(s), {} sharing, position {:.1}s)",
                mode,
                participants.len(),
                screen_sharers.len(),
                playback.position
            );
            // Pull the player onto the channel's current state right away
            schedule_command(
                state,
                server_time,
                TargetState {
                    position: playback.position,
                    playing: playback.playing,
                },
            );
        }
        ServerMessage::Heartbeat { server_time } => {
            state
                .sync
                .note_server_time(server_time, state.clock.now_unix_millis());
        }
        ServerMessage::Play {
            position,
            target_time,
            issued_by,
            ..
        } => {
            tracing::info!("play @{:.1}s scheduled by {}", position, issued_by);
            state.authoritative_playing = true;
            schedule_command(
                state,
                target_time,
                TargetState {
                    position,
                    playing: true,
                },
            );
        }
        ServerMessage::Pause {
            position,
            target_time,
            issued_by,
            ..
        } => {
            tracing::info!("pause @{:.1}s scheduled by {}", position, issued_by);
            state.authoritative_playing = false;
            schedule_command(
                state,
                target_time,
                TargetState {
                    position,
                    playing: false,
                },
            );
        }
        ServerMessage::Seek {
            position,
            target_time,
            issued_by,
            ..
        } => {
            tracing::info!("seek to {:.1}s scheduled by {}", position, issued_by);
            // A seek leaves the play/pause state as the authority last set it
            schedule_command(
                state,
                target_time,
                TargetState {
                    position,
                    playing: state.authoritative_playing,
                },
            );
        }
        ServerMessage::Sync {
            position, playing, ..
        } => {
            state.authoritative_playing = playing;
            schedule_command(state, 0.0, TargetState { position, playing });
        }
        ServerMessage::ModeChanged { old, new } => {
            state.mode = new.as_wire().to_string();
            tracing::info!("Mode changed: {} -> {}", old, new);
        }
        ServerMessage::UserJoined { participant, total, .. } => {
            tracing::info!("{} joined ({} in channel)", participant.name, total);
        }
        ServerMessage::UserLeft { name, total, .. } => {
            tracing::info!("{} left ({} in channel)", name, total);
        }
        ServerMessage::ParticipantModeChanged {
            participant_id,
            new,
            ..
        } => {
            tracing::info!("{} is now {}", participant_id, new);
        }
        ServerMessage::FileUploadStarted { file_id } => {
            tracing::info!("Upload started: {}", file_id);
        }
        ServerMessage::FileUploadProgress {
            file_id,
            received_chunks,
            chunk_count,
        } => {
            tracing::debug!("Upload {}: {}/{} chunks", file_id, received_chunks, chunk_count);
        }
        ServerMessage::FileAvailable { name, file_id, .. } => {
            tracing::info!("File available: {} ({})", name, file_id);
        }
        ServerMessage::FileDownloadReady { name, .. } => {
            tracing::info!("Download ready: {}", name);
        }
        ServerMessage::ScreenshareAvailable {
            host_id,
            quality,
            frame_rate,
        } => {
            tracing::info!(
                "{} started screen sharing ({}, {} fps)",
                host_id,
                quality,
                frame_rate
            );
        }
        ServerMessage::ScreenshareEnded { host_id } => {
            tracing::info!("{} stopped screen sharing", host_id);
        }
        ServerMessage::ScreenshareOffer { from, .. }
        | ServerMessage::ScreenshareAnswer { from, .. }
        | ServerMessage::IceCandidate { from, .. } => {
            // Media negotiation is the GUI layer's concern
            tracing::debug!("Signaling payload from {}", from);
        }
        ServerMessage::Error { code, message } => {
            tracing::warn!("Server rejected request ({:?}): {}", code, message);
        }
    }
}

/// Execute a command at its synchronized target time. A newer command
/// replaces a pending one.
fn schedule_command(state: &mut SessionState, target_time: f64, target: TargetState) {
    state.cancel_pending_command();
    let delay = (target_time - state.sync.now_secs(&state.clock)).max(0.0);
    let controller = state.controller.clone();
    state.pending_command = Some(tokio::spawn(async move {
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        if let Err(e) = controller.lock().await.apply(target).await {
            tracing::warn!("Drift correction failed: {}", e);
        }
    }));
}

/// Returns `true` when the session should end.
async fn handle_user_command<S>(
    state: &mut SessionState,
    player: &Arc<dyn PlayerDriver>,
    write: &mut S,
    command: UserCommand,
) -> Result<bool, ClientError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match command {
        UserCommand::Play => {
            let position = match player.status().await {
                Ok(status) => status.position,
                Err(e) => {
                    tracing::warn!("Cannot read player position: {}", e);
                    0.0
                }
            };
            send_request(write, &ClientRequest::Play {
                position,
                target_time: None,
            })
            .await?;
        }
        UserCommand::Pause => {
            let position = match player.status().await {
                Ok(status) => status.position,
                Err(e) => {
                    tracing::warn!("Cannot read player position: {}", e);
                    0.0
                }
            };
            send_request(write, &ClientRequest::Pause { position }).await?;
        }
        UserCommand::Seek(position) => {
            send_request(write, &ClientRequest::Seek {
                position,
                target_time: None,
            })
            .await?;
        }
        UserCommand::Mode(mode) => {
            send_request(write, &ClientRequest::ChangeMode { mode }).await?;
        }
        UserCommand::Status => {
            match player.status().await {
                Ok(status) => println!(
                    "player: {} @{:.1}s/{:.1}s rate {:.2} | clock: offset {}ms ({})",
                    if status.playing { "playing" } else { "paused" },
                    status.position,
                    status.length,
                    status.rate,
                    state.sync.offset_ms(),
                    state.sync.accuracy(),
                ),
                Err(e) => println!("player unavailable: {e}"),
            }
        }
        UserCommand::Quit => {
            let _ = send_request(write, &ClientRequest::Leave {}).await;
            return Ok(true);
        }
    }
    Ok(false)
}
