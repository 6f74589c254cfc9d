use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Client configuration.
///
/// Defaults follow common realtime clients: 30s heartbeat, 10s join timeout,
/// reconnect backoff starting at 1s and doubling up to a 30s cap (jitter is
/// applied by the connection manager).
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address (host:port for the TCP transport)
    pub url: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("RIPPLE_URL").unwrap_or_else(|_| "127.0.0.1:4000".to_string()),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl ClientConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RIPPLE_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.heartbeat_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RIPPLE_JOIN_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.join_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RIPPLE_RECONNECT_INITIAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.reconnect_initial_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RIPPLE_RECONNECT_MAX_MS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.reconnect_max_ms = n;
            }
        }

        cfg
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
