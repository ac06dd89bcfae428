//! CineSync CLI client.
//!
//! Joins a channel, keeps a local VLC instance reconciled against the
//! channel's authoritative playback state and offers an interactive prompt
//! for issuing commands.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin cinesync-client -- --channel movie-night --name alice
//! ```

use std::sync::Arc;
use std::time::Duration;

use cinesync_client::error::ClientError;
use cinesync_client::player::PlayerDriver;
use cinesync_client::session::{SessionOptions, UserCommand, run_session};
use cinesync_client::vlc::VlcPlayer;
use cinesync_shared::logger::setup_logger;
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "cinesync-client")]
#[command(about = "Synchronized playback client", long_about = None)]
struct Args {
    /// WebSocket URL of the sync server
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Channel to join
    #[arg(short, long, default_value = "default")]
    channel: String,

    /// Display name
    #[arg(short, long)]
    name: String,

    /// Initial mode (localplay, screenshare_host, screenshare_viewer,
    /// file_download, observer)
    #[arg(short, long, default_value = "localplay")]
    mode: String,

    /// Media file to load into VLC on startup
    #[arg(long)]
    media: Option<String>,

    /// VLC HTTP interface host
    #[arg(long, default_value = "127.0.0.1")]
    vlc_host: String,

    /// VLC HTTP interface port
    #[arg(long, default_value = "9090")]
    vlc_port: u16,

    /// VLC HTTP interface password
    #[arg(long, default_value = "vlcpassword")]
    vlc_password: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,
}

/// Parse one prompt line into a command; `None` for empty or unrecognized
/// input (with a usage hint on stderr).
fn parse_line(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?;
    match command {
        "play" => Some(UserCommand::Play),
        "pause" => Some(UserCommand::Pause),
        "seek" => match parts.next().and_then(|raw| raw.parse::<f64>().ok()) {
            Some(position) if position >= 0.0 => Some(UserCommand::Seek(position)),
            _ => {
                eprintln!("usage: seek <seconds>");
                None
            }
        },
        "mode" => match parts.next() {
            Some(mode) => Some(UserCommand::Mode(mode.to_string())),
            None => {
                eprintln!("usage: mode <localplay|screenshare_host|screenshare_viewer|file_download|observer>");
                None
            }
        },
        "status" => Some(UserCommand::Status),
        "quit" | "exit" => Some(UserCommand::Quit),
        _ => {
            eprintln!("commands: play, pause, seek <s>, mode <m>, status, quit");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    let vlc = Arc::new(VlcPlayer::new(
        &args.vlc_host,
        args.vlc_port,
        args.vlc_password.clone(),
    ));

    if let Some(media) = &args.media {
        match vlc.open_file(media).await {
            Ok(()) => tracing::info!("Loaded {} into VLC", media),
            Err(e) => tracing::warn!("Could not load media into VLC: {}", e),
        }
    }

    let options = SessionOptions {
        url: args.url,
        channel: args.channel,
        name: args.name,
        mode: args.mode,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        max_reconnect_attempts: 5,
        reconnect_delay: Duration::from_secs(1),
    };

    // Bridge the blocking readline prompt into the async session
    let (input_tx, input_rx) = mpsc::unbounded_channel::<UserCommand>();
    let _readline_handle = std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {e}");
                return;
            }
        };

        loop {
            match rl.readline("> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    rl.add_history_entry(line).ok();
                    if let Some(command) = parse_line(line) {
                        let quit = command == UserCommand::Quit;
                        if input_tx.send(command).is_err() || quit {
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    let _ = input_tx.send(UserCommand::Quit);
                    break;
                }
                Err(e) => {
                    eprintln!("Readline error: {e}");
                    break;
                }
            }
        }
    });

    let player: Arc<dyn PlayerDriver> = vlc;
    match run_session(options, player, input_rx).await {
        Ok(()) => tracing::info!("Session ended"),
        Err(e @ ClientError::ReconnectExhausted(_)) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Session error: {}", e);
            std::process::exit(1);
        }
    }
}
