//! Server execution logic.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handler::{get_channels, health_check, websocket_handler};
use crate::signal::shutdown_signal;
use crate::state::{AppState, ServerConfig};
use crate::timesource::{RESYNC_INTERVAL, TimeSource};

/// Build the application router over a fresh state.
pub fn build_app(config: ServerConfig, time_sources: Vec<Box<dyn TimeSource>>) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(config, time_sources));
    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/health", get(health_check))
        .route("/api/channels", get(get_channels))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    (app, state)
}

/// Run the synchronization server.
///
/// # Arguments
///
/// * `host` - The host address to bind to (e.g., "127.0.0.1")
/// * `port` - The port number to bind to (e.g., 8080)
/// * `config` - Capacity and session tuning
/// * `time_sources` - Ordered reference time sources; empty disables
///   external clock sync (offset stays zero)
pub async fn run_server(
    host: String,
    port: u16,
    config: ServerConfig,
    time_sources: Vec<Box<dyn TimeSource>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (app, state) = build_app(config, time_sources);

    // Background clock refresh against the reference sources
    let sync_task = if state.time_sources.is_empty() {
        tracing::warn!("No time sources configured, running on the local clock");
        None
    } else {
        Some(
            state
                .server_clock
                .clone()
                .spawn_periodic(state.time_sources.clone(), RESYNC_INTERVAL),
        )
    };

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(
        "CineSync server listening on {}",
        listener.local_addr()?
    );
    tracing::info!("Connect to: ws://{}/ws?channel=<channel-id>", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = sync_task {
        task.abort();
    }
    tracing::info!("Server shutdown complete");

    Ok(())
}
