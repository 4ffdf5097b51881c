//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PILLARCTL_LISTEN`, `PILLARCTL_REDIS_URL`
//!    (or `REDIS_URL`), `PILLARCTL_FRONTEND_ORIGIN`
//! 2. **Config file** — path via `--config <path>`, or `pillarctl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3001"
//! frontend_origin = "http://localhost:3000"
//! heartbeat_interval_secs = 30
//!
//! [session]
//! ttl_secs = 10200              # 2 h 50 min
//! sweep_interval_secs = 300
//! cookie_name = "ssh_session"
//! allow_memory_fallback = true
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"  # omit to run memory-only
//! connect_attempts = 3
//! backoff_cap_ms = 3000
//!
//! [ssh]
//! connect_attempts = 3
//! backoff_cap_ms = 3000
//! connect_timeout_secs = 30
//!
//! [logs]
//! tail_lines = 50
//!
//! [status]
//! unit_patterns = ["*eth*", "*pillar*"]
//! default_interval_ms = 5000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3001`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Allowed CORS origin for the browser dashboard.
    #[serde(default = "default_frontend_origin")]
    pub frontend_origin: String,
    /// Seconds between connection-count heartbeat log lines (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Session registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle TTL in seconds before a session expires (default 10200).
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// Seconds between expiry sweeps (default 300).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Name of the HTTP-only session cookie (default `ssh_session`).
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Whether the in-memory store may stand in for an unreachable Redis
    /// (default true). When false, Redis failures surface as
    /// `STORAGE_UNAVAILABLE` instead of degrading.
    #[serde(default = "default_allow_memory_fallback")]
    pub allow_memory_fallback: bool,
}

/// Durable session backend settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisConfig {
    /// Redis connection URL. `None` disables Redis entirely (memory-only).
    pub url: Option<String>,
    /// Connection attempts before falling back to memory (default 3).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Cap on the exponential reconnect backoff in milliseconds (default 3000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

/// SSH transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Transport connect attempts before giving up (default 3).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Cap on the exponential connect backoff in milliseconds (default 3000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Timeout for a single TCP+handshake attempt in seconds (default 30).
    #[serde(default = "default_ssh_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Log tail settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// Lines of history requested when a tail starts (default 50).
    #[serde(default = "default_tail_lines")]
    pub tail_lines: u64,
}

/// Status polling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// systemd unit glob patterns queried in one batched round trip.
    #[serde(default = "default_unit_patterns")]
    pub unit_patterns: Vec<String>,
    /// Poll interval when the client does not specify one (default 5000 ms).
    #[serde(default = "default_status_interval_ms")]
    pub default_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_frontend_origin() -> String {
    "http://localhost:3000".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_session_ttl() -> u64 {
    10200
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_cookie_name() -> String {
    "ssh_session".to_string()
}
fn default_allow_memory_fallback() -> bool {
    true
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_backoff_cap_ms() -> u64 {
    3000
}
fn default_ssh_connect_timeout() -> u64 {
    30
}
fn default_tail_lines() -> u64 {
    50
}
fn default_unit_patterns() -> Vec<String> {
    vec!["*eth*".to_string(), "*pillar*".to_string()]
}
fn default_status_interval_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            frontend_origin: default_frontend_origin(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            cookie_name: default_cookie_name(),
            allow_memory_fallback: default_allow_memory_fallback(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            backoff_cap_ms: default_backoff_cap_ms(),
            connect_timeout_secs: default_ssh_connect_timeout(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            unit_patterns: default_unit_patterns(),
            default_interval_ms: default_status_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            redis: RedisConfig::default(),
            ssh: SshConfig::default(),
            logs: LogsConfig::default(),
            status: StatusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `pillarctl.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("pillarctl.toml").exists() {
            let content =
                std::fs::read_to_string("pillarctl.toml").expect("Failed to read pillarctl.toml");
            toml::from_str(&content).expect("Failed to parse pillarctl.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("PILLARCTL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) =
            std::env::var("PILLARCTL_REDIS_URL").or_else(|_| std::env::var("REDIS_URL"))
        {
            if !url.is_empty() {
                config.redis.url = Some(url);
            }
        }
        if let Ok(origin) = std::env::var("PILLARCTL_FRONTEND_ORIGIN") {
            config.server.frontend_origin = origin;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.ttl_secs, 10200);
        assert_eq!(config.session.sweep_interval_secs, 300);
        assert_eq!(config.status.default_interval_ms, 5000);
        assert!(config.session.allow_memory_fallback);
        assert!(config.redis.url.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [session]
            ttl_secs = 60

            [redis]
            url = "redis://localhost:6379"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.ttl_secs, 60);
        assert_eq!(config.session.cookie_name, "ssh_session");
        assert_eq!(config.redis.url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.ssh.connect_attempts, 3);
    }
}
