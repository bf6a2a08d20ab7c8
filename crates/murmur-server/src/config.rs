//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use murmur_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_PING_INTERVAL_SECS, DEFAULT_PONG_TIMEOUT_SECS,
    DEFAULT_SEND_QUEUE_CAPACITY, DEFAULT_SESSION_TTL_SECS, DEFAULT_WRITE_TIMEOUT_SECS,
    MAX_FRAME_SIZE, MAX_SESSION_TTL_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"murmur"`
    pub instance_name: String,

    /// Capacity of each connection's outbound queue. A full queue
    /// disconnects the connection.
    /// Env: `SEND_QUEUE_CAPACITY`
    /// Default: `256`
    pub send_queue_capacity: usize,

    /// Interval between liveness pings.
    /// Env: `PING_INTERVAL_SECS`
    /// Default: `54`
    pub ping_interval: Duration,

    /// Read deadline; any received frame (pong included) refreshes it.
    /// Env: `PONG_TIMEOUT_SECS`
    /// Default: `60`
    pub pong_timeout: Duration,

    /// Deadline for a single write to the socket.
    /// Env: `WRITE_TIMEOUT_SECS`
    /// Default: `10`
    pub write_timeout: Duration,

    /// Maximum inbound frame size in bytes.
    /// Env: `MAX_FRAME_BYTES`
    /// Default: 512 KiB
    pub max_frame_bytes: usize,

    /// Lifetime of a login session.
    /// Env: `SESSION_TTL_SECS`
    /// Default: 24 hours
    pub session_ttl: Duration,

    /// Whether the session cookie carries the `Secure` attribute.
    /// Env: `COOKIE_SECURE` (true/false)
    /// Default: `false`
    pub cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "murmur".to_string(),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            max_frame_bytes: MAX_FRAME_SIZE,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            cookie_secure: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(n) = parse_positive(&lookup, "SEND_QUEUE_CAPACITY") {
            config.send_queue_capacity = n as usize;
        }
        if let Some(secs) = parse_positive(&lookup, "PING_INTERVAL_SECS") {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, "PONG_TIMEOUT_SECS") {
            config.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, "WRITE_TIMEOUT_SECS") {
            config.write_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive(&lookup, "MAX_FRAME_BYTES") {
            config.max_frame_bytes = n as usize;
        }
        if let Some(secs) = parse_positive(&lookup, "SESSION_TTL_SECS") {
            if secs > MAX_SESSION_TTL_SECS {
                tracing::warn!(
                    value = secs,
                    max = MAX_SESSION_TTL_SECS,
                    "SESSION_TTL_SECS too large, clamping"
                );
            }
            config.session_ttl = Duration::from_secs(secs.min(MAX_SESSION_TTL_SECS));
        }

        if let Some(val) = lookup("COOKIE_SECURE") {
            config.cookie_secure = val == "true" || val == "1";
        }

        // Pings must arrive before the peer's read deadline expires.
        if config.ping_interval >= config.pong_timeout {
            let clamped = config.pong_timeout * 9 / 10;
            tracing::warn!(
                ping = ?config.ping_interval,
                pong = ?config.pong_timeout,
                clamped = ?clamped,
                "PING_INTERVAL_SECS must be below PONG_TIMEOUT_SECS, clamping"
            );
            config.ping_interval = clamped;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Expected a positive integer, using default");
            None
        }
    }
}
