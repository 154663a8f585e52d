//! Shellcast Daemon
//!
//! Headless service exposing persistent shell sessions over HTTP and
//! WebSocket.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::{HealthResponse, SessionInfo, SessionStatus};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Shellcast Daemon - persistent shell sessions, streamed to any viewer.
#[derive(Parser, Debug)]
#[command(name = "shellcast-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the Shellcast daemon
    Start {
        /// Address to bind, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Show daemon status
    Status {
        /// Daemon base URL (defaults to the configured bind address)
        #[arg(long)]
        url: Option<String>,
    },

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill a session
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Signal to send, by name or number (default: backend's normal termination)
        #[arg(long, short)]
        signal: Option<String>,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.validate()?;

            tracing::info!("Shellcast daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Status { url } => {
            let client = ApiClient::new(url.unwrap_or_else(|| config.local_url()), &config)?;
            match client.health().await {
                Ok(health) => {
                    println!("Daemon Status: {}", health.status);
                    println!("  Version:  {}", health.version);
                    println!("  Uptime:   {}", format_duration(health.uptime_secs));
                    println!("  Sessions: {}", health.sessions);
                }
                Err(e) => {
                    println!("Daemon Status: stopped");
                    tracing::debug!("Health check failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(command) => {
            let client = ApiClient::new(config.local_url(), &config)?;
            match command {
                SessionsCommands::List { json } => {
                    let sessions = client.list_sessions().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                SessionsCommands::Kill { session_id, signal } => {
                    client.kill_session(&session_id, signal.as_deref()).await?;
                    println!("Session {} killed", session_id);
                }
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Sets up stderr logging plus an optional daily rotated file.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "shellcast-daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Thin REST client for the CLI subcommands.
struct ApiClient {
    base: url::Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(base: String, config: &Config) -> anyhow::Result<Self> {
        let base = url::Url::parse(&base).with_context(|| format!("Invalid daemon URL: {base}"))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base,
            token: config.server.auth_token.clone(),
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let url = self.base.join(path).context("Failed to build request URL")?;
        let builder = self.http.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn health(&self) -> anyhow::Result<HealthResponse> {
        let response = self.request(reqwest::Method::GET, "/health")?.send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let response = self
            .request(reqwest::Method::GET, "/api/sessions")?
            .send()
            .await
            .context("Daemon is not running (cannot connect)")?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn kill_session(&self, session_id: &str, signal: Option<&str>) -> anyhow::Result<()> {
        let mut request = self.request(
            reqwest::Method::DELETE,
            &format!("/api/sessions/{session_id}"),
        )?;
        if let Some(signal) = signal {
            request = request.query(&[("signal", signal)]);
        }
        let response = request
            .send()
            .await
            .context("Daemon is not running (cannot connect)")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to kill session ({}): {}", status, body);
        }
        Ok(())
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_width$}  {:<6}  {:<8}  {:>7}  {:>12}  COMMAND",
        "ID", "KIND", "STATUS", "CLIENTS", "CREATED",
    );
    println!("{}", "-".repeat(id_width + 52));

    for session in sessions {
        let status = match (session.status, session.exit_code) {
            (SessionStatus::Running, _) => "running".to_string(),
            (SessionStatus::Exited, Some(code)) => format!("exit {code}"),
            (SessionStatus::Exited, None) => "exited".to_string(),
        };
        println!(
            "{:<id_width$}  {:<6}  {:<8}  {:>7}  {:>12}  {}",
            session.id,
            format!("{:?}", session.backend).to_lowercase(),
            status,
            session.clients,
            format_relative_time(session.created_at / 1000),
            truncate_str(&session.command, 32),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(timestamp);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until SIGINT or SIGTERM.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Listening on http://{}", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["shellcast-daemon", "start"]).unwrap();
        match cli.command {
            Commands::Start { bind } => assert!(bind.is_none()),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_bind() {
        let cli =
            Cli::try_parse_from(["shellcast-daemon", "start", "--bind", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Start { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "shellcast-daemon",
            "status",
            "--verbose",
            "--config",
            "/tmp/shellcast.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/shellcast.toml")));
        assert!(matches!(cli.command, Commands::Status { url: None }));
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["shellcast-daemon", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected sessions list command"),
        }
    }

    #[test]
    fn test_sessions_kill_with_signal() {
        let cli =
            Cli::try_parse_from(["shellcast-daemon", "sessions", "kill", "abc", "-s", "KILL"])
                .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill { session_id, signal }) => {
                assert_eq!(session_id, "abc");
                assert_eq!(signal.as_deref(), Some("KILL"));
            }
            _ => panic!("Expected sessions kill command"),
        }
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["shellcast-daemon", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["shellcast-daemon"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-command", 10), "a-very-...");
    }
}
