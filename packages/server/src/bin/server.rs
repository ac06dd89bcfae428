//! CineSync synchronization server binary.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin cinesync-server
//! cargo run --bin cinesync-server -- --host 0.0.0.0 --port 3000
//! ```

use std::time::Duration;

use cinesync_server::runner::run_server;
use cinesync_server::session::SessionConfig;
use cinesync_server::state::ServerConfig;
use cinesync_server::timesource::HttpTimeSource;
use cinesync_shared::logger::setup_logger;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cinesync-server")]
#[command(about = "Synchronized playback server", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// Maximum participants per channel
    #[arg(long, default_value = "5")]
    capacity: usize,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Consecutive missed heartbeats before eviction
    #[arg(long, default_value = "3")]
    max_missed: u32,

    /// Rejoin grace window in seconds
    #[arg(long, default_value = "60")]
    rejoin_grace_secs: u64,

    /// Run without external time sources (offset stays zero)
    #[arg(long)]
    no_time_sync: bool,
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    let config = ServerConfig {
        channel_capacity: args.capacity,
        session: SessionConfig {
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            max_missed_heartbeats: args.max_missed,
            rejoin_grace: Duration::from_secs(args.rejoin_grace_secs),
        },
    };
    let time_sources = if args.no_time_sync {
        Vec::new()
    } else {
        HttpTimeSource::defaults()
    };

    if let Err(e) = run_server(args.host, args.port, config, time_sources).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
