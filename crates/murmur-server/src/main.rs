//! # murmur-server
//!
//! Realtime one-to-one chat hub.
//!
//! This binary provides:
//! - **Chat sockets**: one WebSocket per logged-in user carrying messages,
//!   typing indicators, delivery acks and presence changes
//! - **REST API** (axum) for login/logout, user search and conversation
//!   history
//! - **In-memory state**: presence, conversation logs and sessions live for
//!   the lifetime of the process

mod api;
mod client;
mod config;
mod error;
mod hub;
mod session;
mod table;

use std::sync::Arc;
use std::time::Duration;

use murmur_shared::constants::APP_NAME;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::session::SessionStore;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting {} chat server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let hub = Hub::spawn();
    let sessions = SessionStore::new(config.session_ttl);
    let http_addr = config.http_addr;

    let app_state = AppState {
        hub,
        sessions: sessions.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic session cleanup (every 10 minutes)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            sessions.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
