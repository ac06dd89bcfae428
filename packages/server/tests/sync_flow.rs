//! End-to-end tests over a real WebSocket connection: join, scheduled
//! command broadcast, permission rejection and liveness.

use std::net::SocketAddr;
use std::time::Duration;

use cinesync_server::runner::build_app;
use cinesync_server::session::SessionConfig;
use cinesync_server::state::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bind an ephemeral port and serve the app in the background.
async fn spawn_server(config: ServerConfig) -> SocketAddr {
    let (app, _state) = build_app(config, Vec::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn test_config(capacity: usize) -> ServerConfig {
    ServerConfig {
        channel_capacity: capacity,
        session: SessionConfig {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            rejoin_grace: Duration::from_secs(60),
        },
    }
}

async fn connect(addr: SocketAddr, channel: &str) -> Socket {
    let url = format!("ws://{addr}/ws?channel={channel}");
    let (socket, _response) = connect_async(&url).await.expect("connect");
    socket
}

async fn send(socket: &mut Socket, payload: Value) {
    socket
        .send(Message::Text(payload.to_string().into()))
        .await
        .expect("send frame");
}

/// Read frames until one matches the wanted type, skipping unrelated
/// traffic such as heartbeats.
async fn recv_type(socket: &mut Socket, wanted: &str) -> Value {
    let deadline = Duration::from_secs(2);
    loop {
        let frame = tokio::time::timeout(deadline, socket.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for '{wanted}'"))
            .expect("stream ended")
            .expect("frame error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).expect("json frame");
            if value["type"] == wanted {
                return value;
            }
        }
    }
}

async fn join(socket: &mut Socket, name: &str, mode: &str) -> Value {
    send(socket, json!({ "type": "join", "name": name, "mode": mode })).await;
    recv_type(socket, "welcome").await
}

#[tokio::test]
async fn test_join_receives_full_snapshot() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;

    // when:
    let welcome = join(&mut alice, "alice", "localplay").await;

    // then:
    assert_eq!(welcome["name"], "alice");
    assert_eq!(welcome["mode"], "localplay");
    assert_eq!(welcome["playback"]["position"], 0.0);
    assert_eq!(welcome["playback"]["playing"], false);
    assert_eq!(welcome["participants"].as_array().unwrap().len(), 1);
    assert_eq!(welcome["files"].as_array().unwrap().len(), 0);
    assert_eq!(welcome["screenSharers"].as_array().unwrap().len(), 0);
    // No external time source in tests, so the server runs at zero offset
    assert_eq!(welcome["clockOffset"], 0);
}

#[tokio::test]
async fn test_play_command_is_broadcast_with_lead_time() {
    // given: alice (controller) and bob (observer) in one channel
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    let welcome = join(&mut alice, "alice", "localplay").await;
    let alice_id = welcome["participantId"].as_str().unwrap().to_string();

    let mut bob = connect(addr, "movie-night").await;
    join(&mut bob, "bob", "observer").await;
    recv_type(&mut alice, "user_joined").await;

    // when: alice starts playback at position 0
    send(&mut alice, json!({ "type": "play", "position": 0.0 })).await;

    // then: bob receives the scheduled command, alice does not
    let play = recv_type(&mut bob, "play").await;
    assert_eq!(play["position"], 0.0);
    assert_eq!(play["issuedBy"], alice_id.as_str());
    assert_eq!(play["issuerMode"], "localplay");
    let lead = play["targetTime"].as_f64().unwrap() - play["serverTime"].as_f64().unwrap();
    assert!((lead - 0.1).abs() < 1e-6, "unexpected lead {lead}");
}

#[tokio::test]
async fn test_viewer_seek_is_rejected_and_state_unchanged() {
    // given: a controller and a screen-share viewer
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "localplay").await;
    let mut bob = connect(addr, "movie-night").await;
    join(&mut bob, "bob", "screenshare_viewer").await;

    // when: the viewer tries to seek
    send(&mut bob, json!({ "type": "seek", "position": 5.0 })).await;

    // then: only bob hears about it, as an authorization error
    let error = recv_type(&mut bob, "error").await;
    assert_eq!(error["code"], "authorization");

    // and: the authoritative position is unchanged for a late joiner
    let mut carol = connect(addr, "movie-night").await;
    let welcome = join(&mut carol, "carol", "observer").await;
    assert_eq!(welcome["playback"]["position"], 0.0);
}

#[tokio::test]
async fn test_capacity_limit_rejects_late_joiner() {
    // given: a two-seat channel, both taken
    let addr = spawn_server(test_config(2)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "localplay").await;
    let mut bob = connect(addr, "movie-night").await;
    join(&mut bob, "bob", "observer").await;

    // when:
    let mut carol = connect(addr, "movie-night").await;
    send(
        &mut carol,
        json!({ "type": "join", "name": "carol", "mode": "observer" }),
    )
    .await;

    // then:
    let error = recv_type(&mut carol, "error").await;
    assert_eq!(error["code"], "capacity");
}

#[tokio::test]
async fn test_channels_are_independent() {
    // given: full channel "a", empty channel "b"
    let addr = spawn_server(test_config(1)).await;
    let mut alice = connect(addr, "a").await;
    join(&mut alice, "alice", "localplay").await;

    // when:
    let mut bob = connect(addr, "b").await;
    let welcome = join(&mut bob, "bob", "localplay").await;

    // then: capacity in one channel does not affect the other
    assert_eq!(welcome["name"], "bob");
}

#[tokio::test]
async fn test_heartbeat_answers_with_server_time() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "observer").await;

    // when:
    send(&mut alice, json!({ "type": "heartbeat" })).await;

    // then:
    let heartbeat = recv_type(&mut alice, "heartbeat").await;
    assert!(heartbeat["serverTime"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_unknown_message_type_is_reported() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "observer").await;

    // when:
    send(&mut alice, json!({ "type": "teleport", "position": 3.0 })).await;

    // then:
    let error = recv_type(&mut alice, "error").await;
    assert_eq!(error["code"], "unknown_message");
}

#[tokio::test]
async fn test_mode_change_is_announced_to_everyone() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    let welcome = join(&mut alice, "alice", "observer").await;
    let alice_id = welcome["participantId"].as_str().unwrap().to_string();
    let mut bob = connect(addr, "movie-night").await;
    join(&mut bob, "bob", "observer").await;

    // when:
    send(&mut alice, json!({ "type": "change_mode", "mode": "screenshare_host" })).await;

    // then: the issuer gets mode_changed, the rest get the roster view
    let mine = recv_type(&mut alice, "mode_changed").await;
    assert_eq!(mine["old"], "observer");
    assert_eq!(mine["new"], "screenshare_host");

    let theirs = recv_type(&mut bob, "participant_mode_changed").await;
    assert_eq!(theirs["participantId"], alice_id.as_str());
    assert_eq!(theirs["new"], "screenshare_host");
    let sharers = theirs["screenSharers"].as_array().unwrap();
    assert_eq!(sharers.len(), 1);
    assert_eq!(sharers[0], alice_id.as_str());
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "observer").await;
    let mut bob = connect(addr, "movie-night").await;
    let welcome = join(&mut bob, "bob", "observer").await;
    let bob_id = welcome["participantId"].as_str().unwrap().to_string();
    recv_type(&mut alice, "user_joined").await;

    // when: bob's socket drops
    drop(bob);

    // then:
    let left = recv_type(&mut alice, "user_left").await;
    assert_eq!(left["participantId"], bob_id.as_str());
    assert_eq!(left["name"], "bob");
}

#[tokio::test]
async fn test_signal_relay_reaches_only_the_target() {
    // given: a host and two viewers
    let addr = spawn_server(test_config(5)).await;
    let mut host = connect(addr, "movie-night").await;
    let welcome = join(&mut host, "host", "screenshare_host").await;
    let host_id = welcome["participantId"].as_str().unwrap().to_string();
    let mut viewer = connect(addr, "movie-night").await;
    let viewer_welcome = join(&mut viewer, "viewer", "screenshare_viewer").await;
    let viewer_id = viewer_welcome["participantId"].as_str().unwrap().to_string();

    // when: the host offers to the viewer
    send(
        &mut host,
        json!({ "type": "screenshare_offer", "target": viewer_id, "payload": { "sdp": "offer" } }),
    )
    .await;

    // then: the viewer receives the opaque payload with the sender id
    let offer = recv_type(&mut viewer, "screenshare_offer").await;
    assert_eq!(offer["from"], host_id.as_str());
    assert_eq!(offer["payload"]["sdp"], "offer");

    // and: answering back works the same way
    send(
        &mut viewer,
        json!({ "type": "screenshare_answer", "target": host_id, "payload": { "sdp": "answer" } }),
    )
    .await;
    let answer = recv_type(&mut host, "screenshare_answer").await;
    assert_eq!(answer["from"], viewer_id.as_str());
}

#[tokio::test]
async fn test_file_upload_progress_and_completion() {
    // given:
    let addr = spawn_server(test_config(5)).await;
    let mut alice = connect(addr, "movie-night").await;
    join(&mut alice, "alice", "localplay").await;
    let mut bob = connect(addr, "movie-night").await;
    join(&mut bob, "bob", "observer").await;

    // when: alice uploads a two-chunk file
    send(
        &mut alice,
        json!({
            "type": "file_upload",
            "name": "subs.srt",
            "size": 2048,
            "fileType": "text/plain",
            "chunkCount": 2
        }),
    )
    .await;
    let started = recv_type(&mut alice, "file_upload_started").await;
    let file_id = started["fileId"].as_str().unwrap().to_string();

    send(&mut alice, json!({ "type": "file_chunk", "fileId": file_id, "index": 0 })).await;
    send(&mut alice, json!({ "type": "file_chunk", "fileId": file_id, "index": 1 })).await;

    // then: everyone sees progress and the terminal availability marker
    let progress = recv_type(&mut bob, "file_upload_progress").await;
    assert_eq!(progress["chunkCount"], 2);
    let available = recv_type(&mut bob, "file_available").await;
    assert_eq!(available["fileId"], file_id.as_str());
    assert_eq!(available["name"], "subs.srt");

    // and: bob can now request the download, switching his mode
    send(&mut bob, json!({ "type": "file_download_request", "fileId": file_id })).await;
    let ready = recv_type(&mut bob, "file_download_ready").await;
    assert_eq!(ready["fileId"], file_id.as_str());
    let mode_change = recv_type(&mut alice, "participant_mode_changed").await;
    assert_eq!(mode_change["new"], "file_download");
}
