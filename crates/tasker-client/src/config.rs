//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a development build starts with zero
//! configuration.

use std::time::Duration;

use tasker_net::SessionConfig;
use tasker_shared::constants::{
    DEFAULT_PAGE_SIZE, MAX_AUTO_RECONNECTS, PENDING_SEND_TIMEOUT_MS, RECONNECT_DELAY_MS,
    REQUEST_TIMEOUT_MS, TOAST_DURATION_MS, TYPING_TTL_MS,
};

/// Client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    /// Env: `TASKER_API_URL`
    /// Default: `http://localhost:8000/api`
    pub api_url: String,

    /// Realtime socket endpoint.
    /// Env: `TASKER_SOCKET_URL`
    /// Default: `ws://localhost:8000/ws`
    pub socket_url: String,

    /// Env: `TASKER_RECONNECT_DELAY_MS`
    pub reconnect_delay: Duration,

    /// Env: `TASKER_TOAST_DURATION_MS`
    pub toast_duration: Duration,

    /// Notification page size.
    /// Env: `TASKER_PAGE_SIZE`
    pub page_size: u32,

    /// A counterpart typing indicator older than this is cleared.
    /// Env: `TASKER_TYPING_TTL_MS`
    pub typing_ttl: Duration,

    /// An unacknowledged send older than this is marked failed.
    /// Env: `TASKER_PENDING_TIMEOUT_MS`
    pub pending_timeout: Duration,

    /// REST request and socket connect timeout.
    /// Env: `TASKER_REQUEST_TIMEOUT_MS`
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            socket_url: "ws://localhost:8000/ws".to_string(),
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            toast_duration: Duration::from_millis(TOAST_DURATION_MS),
            page_size: DEFAULT_PAGE_SIZE,
            typing_ttl: Duration::from_millis(TYPING_TTL_MS),
            pending_timeout: Duration::from_millis(PENDING_SEND_TIMEOUT_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("TASKER_API_URL").filter(|v| !v.trim().is_empty()) {
            config.api_url = url;
        }

        if let Some(url) = lookup("TASKER_SOCKET_URL").filter(|v| !v.trim().is_empty()) {
            config.socket_url = url;
        }

        read_millis(&lookup, "TASKER_RECONNECT_DELAY_MS", &mut config.reconnect_delay);
        read_millis(&lookup, "TASKER_TOAST_DURATION_MS", &mut config.toast_duration);
        read_millis(&lookup, "TASKER_TYPING_TTL_MS", &mut config.typing_ttl);
        read_millis(&lookup, "TASKER_PENDING_TIMEOUT_MS", &mut config.pending_timeout);
        read_millis(&lookup, "TASKER_REQUEST_TIMEOUT_MS", &mut config.request_timeout);

        if let Some(val) = lookup("TASKER_PAGE_SIZE") {
            match val.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid TASKER_PAGE_SIZE, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reconnect_delay: self.reconnect_delay,
            max_auto_reconnects: MAX_AUTO_RECONNECTS,
            ..SessionConfig::default()
        }
    }
}

fn read_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let Some(val) = lookup(key) else {
        return;
    };
    match val.trim().parse::<u64>() {
        Ok(ms) => *target = Duration::from_millis(ms),
        Err(_) => tracing::warn!(key, value = %val, "Invalid duration, using default"),
    }
}
