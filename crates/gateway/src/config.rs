//! Configuration management for the streamgate gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/streamgate/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{Dimensions, SessionLimits};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminate_grace_ms must be between 1 and 60000, got {0}")]
    InvalidTerminateGrace(u64),

    #[error("drain_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidDrainTimeout(u64),

    #[error("max_session_secs must be greater than 0 when set")]
    InvalidMaxSessionSecs,

    #[error("read_buffer_size must be between 1 and 1048576, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("max_line_bytes must be between 1 and 16777216, got {0}")]
    InvalidMaxLine(usize),

    #[error("default terminal size must be non-zero, got {rows}x{cols}")]
    InvalidDimensions { rows: u16, cols: u16 },

    #[error("bind must be a socket address like 127.0.0.1:7777, got {0}")]
    InvalidBindAddress(String),

    #[error("action_log capacity must be greater than 0")]
    InvalidActionLogCapacity,

    #[error("targets.program must not be empty")]
    EmptyProgram,

    #[error("targets.{0} must reference {{id}}")]
    MissingIdPlaceholder(&'static str),

    #[error("targets.exec must reference {{command}} or {{args}}")]
    MissingCommandPlaceholder,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Streaming session configuration.
    pub session: SessionConfig,

    /// Commands launched for each kind of session.
    pub targets: TargetsConfig,

    /// Action log configuration.
    pub action_log: ActionLogConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to log to, rotated daily, in addition to stderr.
    pub log_file: Option<PathBuf>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: String,

    /// Interval between keep-alive comments on event streams, in seconds.
    pub keep_alive_secs: u64,
}

/// Streaming session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Time between the polite termination signal and SIGKILL.
    pub terminate_grace_ms: u64,

    /// How long process output may keep draining once a session is closing.
    pub drain_timeout_ms: u64,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Optional hard limit on session lifetime. Unset means sessions live as
    /// long as both the process and the client connection.
    pub max_session_secs: Option<u64>,

    /// Read buffer size for terminal output, in bytes.
    pub read_buffer_size: usize,

    /// Longest line forwarded as a single exec envelope or event.
    pub max_line_bytes: usize,

    /// Terminal rows when the client does not send a size.
    pub default_rows: u16,

    /// Terminal columns when the client does not send a size.
    pub default_cols: u16,
}

/// Launch command templates.
///
/// Arguments may contain `{id}` (the target identifier), `{command}` (the
/// exec command as a single argument) and `{args}` (the exec command split on
/// whitespace, spliced in as separate arguments).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetsConfig {
    /// Program launched for every session.
    pub program: String,

    /// Arguments for interactive terminals.
    pub terminal: Vec<String>,

    /// Arguments for one-shot exec.
    pub exec: Vec<String>,

    /// Arguments for log follows.
    pub follow: Vec<String>,

    /// Arguments for the backend health check.
    pub status: Vec<String>,
}

/// Action log configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionLogConfig {
    /// Maximum number of retained entries.
    pub capacity: usize,

    /// Commands containing any of these are only logged when they fail.
    pub noisy_patterns: Vec<String>,
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
            bind: "127.0.0.1:7777".to_string(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            terminate_grace_ms: 3000,
            drain_timeout_ms: 2000,
            max_sessions: 64,
            max_session_secs: None,
            read_buffer_size: crate::session::launcher::DEFAULT_READ_BUFFER_SIZE,
            max_line_bytes: protocol::DEFAULT_MAX_LINE,
            default_rows: 24,
            default_cols: 80,
        }
    }
}

impl Default for TargetsConfig {
    fn default() -> Self {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            program: "container".to_string(),
            terminal: args(&["exec", "-it", "{id}", "/bin/sh"]),
            exec: args(&["exec", "{id}", "{args}"]),
            follow: args(&["logs", "-f", "{id}"]),
            status: args(&["system", "status"]),
        }
    }
}

impl Default for ActionLogConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            noisy_patterns: ["ls --all", "image list", "top", "stats"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SessionConfig {
    /// Returns the limits applied to each new session.
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_duration: self.max_session_secs.map(Duration::from_secs),
            read_buffer_size: self.read_buffer_size,
            max_line: self.max_line_bytes,
        }
    }

    /// Returns the terminal size used when the client does not send one.
    pub fn default_dimensions(&self) -> Dimensions {
        Dimensions::new(self.default_rows, self.default_cols)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("streamgate")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - STREAMGATE_BIND: Override the listen address
    /// - STREAMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - STREAMGATE_PROGRAM: Override the launched program
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("STREAMGATE_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("STREAMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(program) = std::env::var("STREAMGATE_PROGRAM") {
            if !program.is_empty() {
                tracing::info!("Overriding targets.program from environment: {}", program);
                self.targets.program = program;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if !(1..=60_000).contains(&session.terminate_grace_ms) {
            return Err(ConfigError::InvalidTerminateGrace(session.terminate_grace_ms));
        }

        if !(1..=60_000).contains(&session.drain_timeout_ms) {
            return Err(ConfigError::InvalidDrainTimeout(session.drain_timeout_ms));
        }

        if session.max_session_secs == Some(0) {
            return Err(ConfigError::InvalidMaxSessionSecs);
        }

        if !(1..=1024 * 1024).contains(&session.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(session.read_buffer_size));
        }

        if !(1..=16 * 1024 * 1024).contains(&session.max_line_bytes) {
            return Err(ConfigError::InvalidMaxLine(session.max_line_bytes));
        }

        if session.default_rows == 0 || session.default_cols == 0 {
            return Err(ConfigError::InvalidDimensions {
                rows: session.default_rows,
                cols: session.default_cols,
            });
        }

        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        if self.action_log.capacity == 0 {
            return Err(ConfigError::InvalidActionLogCapacity);
        }

        let targets = &self.targets;
        if targets.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        for (name, args) in [
            ("terminal", &targets.terminal),
            ("exec", &targets.exec),
            ("follow", &targets.follow),
        ] {
            if !args.iter().any(|arg| arg.contains("{id}")) {
                return Err(ConfigError::MissingIdPlaceholder(name));
            }
        }
        if !targets
            .exec
            .iter()
            .any(|arg| arg.contains("{command}") || arg == "{args}")
        {
            return Err(ConfigError::MissingCommandPlaceholder);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Resolves the launched program on `PATH`.
    ///
    /// A missing program is not a configuration error: the gateway still
    /// serves, and the status endpoint reports the backend as offline.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        which::which(&self.targets.program).ok()
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
