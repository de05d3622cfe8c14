//! Configuration management for the webterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webterm/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::HeaderName;

use crate::network::WebSocketSettings;
use crate::router::SessionDefaults;
use crate::session::{OwnershipPolicy, SessionSettings};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 127.0.0.1:8022, got {0}")]
    InvalidListenAddr(String),

    #[error("heartbeat_interval_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("history_limit must be greater than 0, got {0}")]
    InvalidHistoryLimit(usize),

    #[error("channel_capacity must be greater than 0, got {0}")]
    InvalidChannelCapacity(usize),

    #[error("max_send_timeouts must be greater than 0, got {0}")]
    InvalidMaxSendTimeouts(u32),

    #[error("identity_header is not a valid HTTP header name: {0:?}")]
    InvalidIdentityHeader(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the webterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Per-connection delivery configuration.
    pub client: ClientConfig,

    /// Identity and ownership settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: String,

    /// Seconds between heartbeat pings on each connection.
    pub heartbeat_interval_secs: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Terminal columns when a request omits them.
    pub default_cols: u16,

    /// Terminal rows when a request omits them.
    pub default_rows: u16,

    /// Working directory for new sessions.
    pub default_cwd: Option<PathBuf>,

    /// Extra environment variables for every session.
    pub env: BTreeMap<String, String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Seconds a session may sit without clients (0 = close on last detach).
    pub idle_timeout_secs: u64,

    /// Output history kept per session, in bytes.
    pub history_limit: usize,

    /// Seconds a closed session is remembered.
    pub closed_retention_secs: u64,

    /// Milliseconds between SIGHUP and SIGKILL on close.
    pub terminate_grace_ms: u64,
}

/// Per-connection delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound queue length per connection.
    pub channel_capacity: usize,

    /// Longest a single delivery may wait for queue space, in milliseconds.
    pub send_timeout_ms: u64,

    /// Consecutive timed-out deliveries before a client is dropped.
    pub max_send_timeouts: u32,
}

/// Identity and ownership settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Header set by the authenticating proxy.
    pub identity_header: String,

    /// Refuse attaches from anyone but the session owner.
    pub strict_ownership: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8022".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        Self {
            default_shell: crate::session::pty::detect_shell(),
            default_cols: 80,
            default_rows: 24,
            default_cwd: None,
            env,
            max_sessions: 64,
            idle_timeout_secs: 300,
            history_limit: crate::session::DEFAULT_HISTORY_LIMIT,
            closed_retention_secs: 3600,
            terminate_grace_ms: 2000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            send_timeout_ms: 250,
            max_send_timeouts: 3,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            identity_header: "X-Forwarded-User".to_string(),
            strict_ownership: false,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webterm")
        .join("config.toml")
}

/// Reads a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Reads and parses a non-empty environment variable, ignoring bad values.
fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env_value(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring unparseable environment override");
            None
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty or unparseable values are ignored. Supported variables:
    /// - WEBTERM_LISTEN_ADDR
    /// - WEBTERM_LOG_LEVEL
    /// - WEBTERM_DEFAULT_SHELL
    /// - WEBTERM_DEFAULT_COLS / WEBTERM_DEFAULT_ROWS
    /// - WEBTERM_IDLE_TIMEOUT (seconds)
    /// - WEBTERM_HISTORY_LIMIT (bytes)
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_value("WEBTERM_LISTEN_ADDR") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.server.listen_addr = addr;
        }

        if let Some(level) = env_value("WEBTERM_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = env_value("WEBTERM_DEFAULT_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(cols) = env_parsed("WEBTERM_DEFAULT_COLS") {
            self.session.default_cols = cols;
        }

        if let Some(rows) = env_parsed("WEBTERM_DEFAULT_ROWS") {
            self.session.default_rows = rows;
        }

        if let Some(secs) = env_parsed("WEBTERM_IDLE_TIMEOUT") {
            self.session.idle_timeout_secs = secs;
        }

        if let Some(limit) = env_parsed("WEBTERM_HISTORY_LIMIT") {
            self.session.history_limit = limit;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        if !(1..=3600).contains(&self.server.heartbeat_interval_secs) {
            return Err(ConfigError::InvalidHeartbeatInterval(
                self.server.heartbeat_interval_secs,
            ));
        }

        if !(1..=10_000).contains(&self.session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.history_limit == 0 {
            return Err(ConfigError::InvalidHistoryLimit(self.session.history_limit));
        }

        if self.client.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity(
                self.client.channel_capacity,
            ));
        }

        if self.client.max_send_timeouts == 0 {
            return Err(ConfigError::InvalidMaxSendTimeouts(
                self.client.max_send_timeouts,
            ));
        }

        if HeaderName::from_bytes(self.security.identity_header.as_bytes()).is_err() {
            return Err(ConfigError::InvalidIdentityHeader(
                self.security.identity_header.clone(),
            ));
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    /// Per-session behaviour derived from `[session]`, `[client]` and
    /// `[security]`.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            history_limit: self.session.history_limit,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            terminate_grace: Duration::from_millis(self.session.terminate_grace_ms),
            send_timeout: Duration::from_millis(self.client.send_timeout_ms),
            max_send_timeouts: self.client.max_send_timeouts,
            policy: if self.security.strict_ownership {
                OwnershipPolicy::Strict
            } else {
                OwnershipPolicy::Shared
            },
        }
    }

    /// Values applied to create requests that leave fields out.
    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            shell: self.session.default_shell.clone(),
            cols: self.session.default_cols,
            rows: self.session.default_rows,
            cwd: self.session.default_cwd.clone(),
            env: self.session.env.clone(),
        }
    }

    /// Transport settings.
    pub fn websocket_settings(&self) -> WebSocketSettings {
        WebSocketSettings {
            identity_header: self.security.identity_header.clone(),
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs),
            channel_capacity: self.client.channel_capacity,
        }
    }

    /// How long closed sessions are remembered.
    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.session.closed_retention_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
