//! # Configuration Module for Bastion Core
//!
//! This module provides the tuning knobs for the forwarding engine, the SSH
//! connection pool and the HTTP audit pipeline. Every field maps 1:1 to a
//! configuration name; values can be overridden from an optional JSON file
//! (`BASTION_CONFIG` path) or individual environment variables carrying the
//! field name in upper case (e.g. `MAX_SESSION_CONNECTIONS`).
//!
//! ## Usage
//!
//! Settings are loaded once at startup with [`init`] and read through
//! [`Settings::current`]. Components copy the values they need at
//! construction time, so tests can build components with custom settings
//! without touching the global cell.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the core. Defaults match production values.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory for the core log file; empty logs to stderr
    pub log_dir: String,

    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// Hard cap on concurrent connections per session
    pub max_session_connections: usize,

    /// Initial copy buffer size in bytes
    pub forward_buffer_size: usize,

    /// Whether forwarded HTTP traffic is audited at all
    pub audit_enabled: bool,

    /// Capacity of the audit message queue (drop-on-full)
    pub audit_queue_size: usize,

    /// Maximum number of retained HTTP logs
    pub max_http_logs: usize,

    /// How often the pair matcher reaps unanswered requests
    pub http_pair_cleanup_interval_minutes: u64,

    /// Age at which an unanswered request is reaped as a pair with no response
    pub http_pair_max_age_minutes: u64,

    /// Interval of the periodic health monitor log line
    pub task_monitor_interval_seconds: u64,

    /// Read deadline during SOCKS5/HTTP handshakes
    pub socks5_handshake_read_timeout_seconds: u64,

    /// Write deadline during SOCKS5/HTTP handshakes
    pub socks5_handshake_write_timeout_seconds: u64,

    /// Per-read deadline on the transfer path (0 disables)
    pub transfer_read_timeout_seconds: u64,

    /// Per-write deadline on the transfer path (0 disables)
    pub transfer_write_timeout_seconds: u64,

    /// Idle ceiling for a forwarded connection
    pub session_idle_timeout_hours: u64,

    /// TCP + SSH handshake timeout per hop
    pub ssh_connect_timeout_seconds: u64,

    /// Transport-level keepalive interval handed to the SSH client config
    pub ssh_keepalive_interval_seconds: u64,

    /// Attempts per hop before the chain dial fails
    pub ssh_connect_max_retries: u32,

    /// Delay between per-hop retries
    pub ssh_connect_retry_delay_seconds: u64,

    /// Maximum number of pooled SSH chain clients
    pub ssh_pool_max_conns: usize,

    /// Idle age after which an unused chain client is closed
    pub ssh_pool_idle_timeout_seconds: u64,

    /// Probe interval for pooled chain clients
    pub ssh_pool_keepalive_interval_seconds: u64,

    /// Probe timeout
    pub ssh_pool_keepalive_timeout_ms: u64,

    /// Cap on decompressed gzip preview bytes
    pub http_gzip_decode_max_bytes: usize,

    /// Wall-time budget for one gzip preview decode
    pub http_gzip_decode_timeout_ms: u64,

    /// Sliding TTL of the gzip preview cache (0 disables caching)
    pub http_gzip_decode_cache_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_dir: "/var/log/bastion".to_string(),
            log_level: "info".to_string(),
            max_session_connections: 1000,
            forward_buffer_size: 32768,
            audit_enabled: true,
            audit_queue_size: 1000,
            max_http_logs: 1000,
            http_pair_cleanup_interval_minutes: 5,
            http_pair_max_age_minutes: 10,
            task_monitor_interval_seconds: 30,
            socks5_handshake_read_timeout_seconds: 30,
            socks5_handshake_write_timeout_seconds: 30,
            transfer_read_timeout_seconds: 86400,
            transfer_write_timeout_seconds: 86400,
            session_idle_timeout_hours: 24,
            ssh_connect_timeout_seconds: 15,
            ssh_keepalive_interval_seconds: 30,
            ssh_connect_max_retries: 3,
            ssh_connect_retry_delay_seconds: 2,
            ssh_pool_max_conns: 64,
            ssh_pool_idle_timeout_seconds: 900,
            ssh_pool_keepalive_interval_seconds: 30,
            ssh_pool_keepalive_timeout_ms: 500,
            http_gzip_decode_max_bytes: 1_048_576,
            http_gzip_decode_timeout_ms: 500,
            http_gzip_decode_cache_seconds: 60,
        }
    }
}

impl Settings {
    /// Snapshot of the process-wide settings.
    pub fn current() -> Settings {
        SETTINGS.read().expect("settings cell poisoned").clone()
    }

    pub fn handshake_read_timeout(&self) -> Duration {
        Duration::from_secs(self.socks5_handshake_read_timeout_seconds)
    }

    pub fn handshake_write_timeout(&self) -> Duration {
        Duration::from_secs(self.socks5_handshake_write_timeout_seconds)
    }

    pub fn transfer_read_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_read_timeout_seconds)
    }

    pub fn transfer_write_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_write_timeout_seconds)
    }
}

lazy_static::lazy_static! {
    static ref SETTINGS: RwLock<Settings> = RwLock::new(Settings::default());
}

/// Load settings from the optional JSON file named by `BASTION_CONFIG`,
/// then apply single-field environment overrides. Called once at startup,
/// before the logger is up, so problems go to stderr.
pub fn init() {
    let mut settings = Settings::default();

    if let Ok(path) = std::env::var("BASTION_CONFIG") {
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Settings>(&raw) {
                Ok(parsed) => settings = parsed,
                Err(e) => eprintln!("[config] Failed to parse {}: {}", path, e),
            },
            Err(e) => eprintln!("[config] Failed to read {}: {}", path, e),
        }
    }

    apply_env_overrides(&mut settings);

    *SETTINGS.write().expect("settings cell poisoned") = settings;
}

/// Replace the process-wide settings. Intended for embedding callers.
pub fn replace(settings: Settings) {
    *SETTINGS.write().expect("settings cell poisoned") = settings;
}

fn apply_env_overrides(settings: &mut Settings) {
    // Serialize to a JSON map, patch matching env vars back in, re-parse.
    let Ok(serde_json::Value::Object(mut map)) = serde_json::to_value(&*settings) else {
        return;
    };
    let mut touched = false;
    for (key, slot) in map.iter_mut() {
        let env_key = key.to_uppercase();
        if let Ok(raw) = std::env::var(&env_key) {
            // numbers and bools arrive as JSON literals, anything else is a string
            *slot = serde_json::from_str::<serde_json::Value>(&raw)
                .unwrap_or(serde_json::Value::String(raw));
            touched = true;
        }
    }
    if touched {
        if let Ok(parsed) = serde_json::from_value(serde_json::Value::Object(map)) {
            *settings = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.log_level, "info");
        assert_eq!(s.max_session_connections, 1000);
        assert_eq!(s.forward_buffer_size, 32768);
        assert_eq!(s.audit_queue_size, 1000);
        assert_eq!(s.max_http_logs, 1000);
        assert_eq!(s.transfer_read_timeout_seconds, 86400);
        assert_eq!(s.ssh_pool_max_conns, 64);
        assert_eq!(s.http_gzip_decode_max_bytes, 1_048_576);
        assert!(s.audit_enabled);
    }

    #[test]
    fn file_values_round_trip() {
        let raw = r#"{"max_session_connections": 5, "audit_enabled": false}"#;
        let parsed: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.max_session_connections, 5);
        assert!(!parsed.audit_enabled);
        // untouched fields keep defaults
        assert_eq!(parsed.ssh_pool_max_conns, 64);
    }
}
