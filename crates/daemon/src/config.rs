//! Configuration management for the Shellcast daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellcast/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{ActivityPolicy, SessionSettings, TmuxOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("scrollback_bytes must be greater than 0, got {0}")]
    InvalidScrollback(usize),

    #[error("client_buffer must be greater than 0, got {0}")]
    InvalidClientBuffer(usize),

    #[error("heartbeat_interval_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("quiet_window_ms must be greater than 0, got {0}")]
    InvalidQuietWindow(u64),

    #[error("bind_addr is not a valid socket address: {0}")]
    InvalidBindAddr(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Shellcast daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP and push transport configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Activity classifier tunables.
    pub activity: ActivityConfig,

    /// tmux backend settings.
    pub tmux: TmuxConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rotated log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,

    /// Shared secret required on every route but `/health`. Unset disables
    /// authentication.
    pub auth_token: Option<String>,

    /// Seconds between heartbeat probes on the push transport.
    pub heartbeat_interval_secs: u64,

    /// Queue capacity per attached client before it is evicted as too slow.
    pub client_buffer: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Maximum number of concurrently running sessions.
    pub max_sessions: usize,

    /// Scrollback retained per session, in bytes.
    pub scrollback_bytes: usize,

    /// Milliseconds allowed for in-flight output after the process exits.
    pub exit_grace_ms: u64,
}

/// Activity classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActivityConfig {
    /// Silence, in milliseconds, before a busy session turns idle.
    pub quiet_window_ms: u64,

    /// Treat a prompt-like output tail as a hint that the command finished.
    pub prompt_detection: bool,

    /// Shorter quiet window used after a prompt-like tail.
    pub prompt_settle_ms: u64,
}

/// tmux backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TmuxConfig {
    /// tmux binary.
    pub command: String,

    /// Kill tmux sessions on daemon shutdown instead of detaching.
    pub kill_on_shutdown: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7681".to_string(),
            auth_token: None,
            heartbeat_interval_secs: 25,
            client_buffer: 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 10,
            scrollback_bytes: 256 * 1024,
            exit_grace_ms: 250,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        let policy = ActivityPolicy::default();
        Self {
            quiet_window_ms: policy.quiet_window.as_millis() as u64,
            prompt_detection: policy.prompt_detection,
            prompt_settle_ms: policy.prompt_settle.as_millis() as u64,
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        let options = TmuxOptions::default();
        Self {
            command: options.command,
            kill_on_shutdown: options.kill_on_shutdown,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellcast")
        .join("config.toml")
}

/// Returns the login shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLCAST_BIND_ADDR: Override the HTTP bind address
    /// - SHELLCAST_AUTH_TOKEN: Override the shared secret
    /// - SHELLCAST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SHELLCAST_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(token) = std::env::var("SHELLCAST_AUTH_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Overriding auth_token from environment");
                self.server.auth_token = Some(token);
            }
        }

        if let Ok(level) = std::env::var("SHELLCAST_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.scrollback_bytes == 0 {
            return Err(ConfigError::InvalidScrollback(self.session.scrollback_bytes));
        }

        if self.server.client_buffer == 0 {
            return Err(ConfigError::InvalidClientBuffer(self.server.client_buffer));
        }

        let heartbeat = self.server.heartbeat_interval_secs;
        if !(1..=3600).contains(&heartbeat) {
            return Err(ConfigError::InvalidHeartbeatInterval(heartbeat));
        }

        if self.activity.quiet_window_ms == 0 {
            return Err(ConfigError::InvalidQuietWindow(self.activity.quiet_window_ms));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
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
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_addr))
    }

    /// Heartbeat period for the push transport.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_interval_secs)
    }

    /// Per-session settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            default_shell: self.session.default_shell.clone(),
            scrollback_bytes: self.session.scrollback_bytes,
            client_buffer: self.server.client_buffer,
            exit_grace: Duration::from_millis(self.session.exit_grace_ms),
            activity: ActivityPolicy {
                quiet_window: Duration::from_millis(self.activity.quiet_window_ms),
                prompt_detection: self.activity.prompt_detection,
                prompt_settle: Duration::from_millis(self.activity.prompt_settle_ms),
            },
            tmux: TmuxOptions {
                command: self.tmux.command.clone(),
                kill_on_shutdown: self.tmux.kill_on_shutdown,
            },
        }
    }

    /// Base URL for talking to a daemon started with this configuration.
    ///
    /// A wildcard bind address is reached through loopback.
    pub fn local_url(&self) -> String {
        match self.server.bind_addr.parse::<SocketAddr>() {
            Ok(addr) if addr.ip().is_unspecified() => {
                format!("http://127.0.0.1:{}", addr.port())
            }
            Ok(addr) => format!("http://{addr}"),
            Err(_) => format!("http://{}", self.server.bind_addr),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.server.bind_addr, "127.0.0.1:7681");
        assert!(config.server.auth_token.is_none());
        assert_eq!(config.server.heartbeat_interval_secs, 25);
        assert_eq!(config.server.client_buffer, 1024);
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.session.scrollback_bytes, 256 * 1024);
        assert_eq!(config.session.exit_grace_ms, 250);
        assert_eq!(config.activity.quiet_window_ms, 1500);
        assert!(config.activity.prompt_detection);
        assert_eq!(config.activity.prompt_settle_ms, 150);
        assert_eq!(config.tmux.command, "tmux");
        assert!(!config.tmux.kill_on_shutdown);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
bind_addr = "0.0.0.0:9000"
auth_token = "hunter2"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.auth_token.as_deref(), Some("hunter2"));
        assert_eq!(config.server.heartbeat_interval_secs, 25);
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.daemon, DaemonConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_dir = "/var/log/shellcast"

[server]
bind_addr = "127.0.0.1:8080"
heartbeat_interval_secs = 10
client_buffer = 64

[session]
default_shell = "/bin/zsh"
max_sessions = 20
scrollback_bytes = 1024
exit_grace_ms = 500

[activity]
quiet_window_ms = 3000
prompt_detection = false
prompt_settle_ms = 50

[tmux]
command = "/usr/local/bin/tmux"
kill_on_shutdown = true
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/shellcast")));
        assert_eq!(config.server.heartbeat_interval_secs, 10);
        assert_eq!(config.server.client_buffer, 64);
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.scrollback_bytes, 1024);
        assert_eq!(config.activity.quiet_window_ms, 3000);
        assert!(!config.activity.prompt_detection);
        assert_eq!(config.tmux.command, "/usr/local/bin/tmux");
        assert!(config.tmux.kill_on_shutdown);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[daemon\nlog_level = \"debug\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.auth_token = Some("s3cret".to_string());
        original.session.max_sessions = 42;
        original.tmux.kill_on_shutdown = true;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[activity]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.scrollback_bytes = 4096;

        original.save(&config_path).unwrap();
        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("shellcast"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_session_settings() {
        let mut config = valid_config();
        config.session.scrollback_bytes = 100;
        config.server.client_buffer = 7;
        config.activity.quiet_window_ms = 2000;
        config.activity.prompt_detection = false;
        config.tmux.kill_on_shutdown = true;

        let settings = config.session_settings();
        assert_eq!(settings.default_shell, "/bin/sh");
        assert_eq!(settings.scrollback_bytes, 100);
        assert_eq!(settings.client_buffer, 7);
        assert_eq!(settings.exit_grace, Duration::from_millis(250));
        assert_eq!(settings.activity.quiet_window, Duration::from_millis(2000));
        assert!(!settings.activity.prompt_detection);
        assert!(settings.tmux.kill_on_shutdown);
    }

    #[test]
    fn test_local_url() {
        let mut config = Config::default();
        assert_eq!(config.local_url(), "http://127.0.0.1:7681");

        config.server.bind_addr = "0.0.0.0:9000".to_string();
        assert_eq!(config.local_url(), "http://127.0.0.1:9000");
    }

    #[test]
    #[serial]
    fn test_env_override_bind_addr_and_token() {
        std::env::set_var("SHELLCAST_BIND_ADDR", "127.0.0.1:9999");
        std::env::set_var("SHELLCAST_AUTH_TOKEN", "from-env");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.server.auth_token.as_deref(), Some("from-env"));

        std::env::remove_var("SHELLCAST_BIND_ADDR");
        std::env::remove_var("SHELLCAST_AUTH_TOKEN");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("SHELLCAST_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("SHELLCAST_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLCAST_BIND_ADDR", "");
        std::env::set_var("SHELLCAST_AUTH_TOKEN", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.bind_addr, "127.0.0.1:7681");
        assert!(config.server.auth_token.is_none());

        std::env::remove_var("SHELLCAST_BIND_ADDR");
        std::env::remove_var("SHELLCAST_AUTH_TOKEN");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("SHELLCAST_LOG_LEVEL");

        let mut config = Config::default();
        config.daemon.log_level = "warn".to_string();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_scrollback_and_buffer() {
        let mut config = valid_config();
        config.session.scrollback_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidScrollback(0)));

        let mut config = valid_config();
        config.server.client_buffer = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidClientBuffer(0)));
    }

    #[test]
    fn test_validate_heartbeat_interval() {
        let mut config = valid_config();
        config.server.heartbeat_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHeartbeatInterval(0)));

        config.server.heartbeat_interval_secs = 3601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeatInterval(3601))
        );
    }

    #[test]
    fn test_validate_quiet_window() {
        let mut config = valid_config();
        config.activity.quiet_window_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQuietWindow(0)));
    }

    #[test]
    fn test_validate_bind_addr() {
        let mut config = valid_config();
        config.server.bind_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddr("localhost".to_string()))
        );
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.session.default_shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.default_shell = "shellcast-no-such-shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        for level in ["trace", "debug", "info", "warn", "error", "INFO"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{level} should be accepted");
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
