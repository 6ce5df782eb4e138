//! Server configuration.
//!
//! Every tunable has a compiled-in default. `ServerConfig::from_env` overlays
//! `COLLAB_SYNC_*` environment variables on top of those defaults; a value that
//! fails to parse is logged and ignored rather than aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Port used when `COLLAB_SYNC_PORT` is unset.
pub const DEFAULT_PORT: u16 = 1234;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host or IP to bind to
    pub host: String,
    /// TCP port (0 = ephemeral, useful in tests)
    pub port: u16,
    /// Persistence storage path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Delay between the first unflushed merge and its flush.
    /// `Duration::ZERO` disables timer flushes (detach and shutdown still flush).
    pub flush_debounce: Duration,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// WebSocket ping interval
    pub heartbeat_interval: Duration,
    /// Close sessions with no inbound traffic for this long
    pub idle_timeout: Duration,
    /// Deadline for the connect payload after the handshake
    pub auth_timeout: Duration,
    /// Deadline for a single outbound socket write
    pub send_timeout: Duration,
    /// Upper bound on waiting for sessions and flushes during `stop()`
    pub shutdown_timeout: Duration,
    /// Largest accepted WebSocket message
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            storage_path: None,
            flush_debounce: Duration::from_millis(2000),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            auth_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            max_message_bytes: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl ServerConfig {
    /// Load configuration from `COLLAB_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Split out from `from_env` so tests do not have to mutate the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("COLLAB_SYNC_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parse_var(&lookup, "COLLAB_SYNC_PORT") {
            config.port = port;
        }
        if let Some(path) = lookup("COLLAB_SYNC_STORAGE_PATH").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COLLAB_SYNC_FLUSH_DEBOUNCE_MS") {
            config.flush_debounce = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "COLLAB_SYNC_BROADCAST_CAPACITY") {
            if capacity == 0 {
                log::warn!("COLLAB_SYNC_BROADCAST_CAPACITY must be positive, keeping {}", config.broadcast_capacity);
            } else {
                config.broadcast_capacity = capacity;
            }
        }
        if let Some(secs) = parse_var(&lookup, "COLLAB_SYNC_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "COLLAB_SYNC_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "COLLAB_SYNC_AUTH_TIMEOUT_SECS") {
            config.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "COLLAB_SYNC_SEND_TIMEOUT_SECS") {
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "COLLAB_SYNC_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var(&lookup, "COLLAB_SYNC_MAX_MESSAGE_BYTES") {
            config.max_message_bytes = bytes;
        }

        config
    }

    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Config for tests: ephemeral port, no timer flushes, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            flush_debounce: Duration::ZERO,
            broadcast_capacity: 64,
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {name}={raw:?}: {e}");
            None
        }
    }
}
