//! tmux-backed sessions.
//!
//! Instead of spawning a shell directly, the backend runs
//! `tmux new-session -A -s <name>` on a PTY, which creates the named tmux
//! session or attaches to it if it already exists. Resize and kill are
//! translated to tmux's control interface; the PTY only carries the attached
//! client.

use std::collections::BTreeMap;
use std::process::Output;

use tokio::process::Command;

use super::pty::{self, PtyBackend, PtyCommand, Spawned};
use super::SessionError;

/// Fallback when no tmux binary is configured.
const DEFAULT_TMUX_COMMAND: &str = "tmux";

/// How tmux sessions are driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxOptions {
    /// tmux binary.
    pub command: String,
    /// Kill tmux sessions on daemon shutdown instead of detaching from them.
    pub kill_on_shutdown: bool,
}

impl Default for TmuxOptions {
    fn default() -> Self {
        Self {
            command: DEFAULT_TMUX_COMMAND.to_string(),
            kill_on_shutdown: false,
        }
    }
}

impl TmuxOptions {
    fn resolve_command(&self) -> &str {
        let command = self.command.trim();
        if command.is_empty() {
            DEFAULT_TMUX_COMMAND
        } else {
            command
        }
    }
}

/// A PTY attached to a named tmux session.
pub struct TmuxBackend {
    name: String,
    options: TmuxOptions,
    client: PtyBackend,
}

/// Builds the `new-session -A` invocation for `name`.
pub fn attach_command(
    options: &TmuxOptions,
    name: &str,
    cwd: Option<&str>,
) -> (String, Vec<String>) {
    let mut args = vec![
        "new-session".to_string(),
        "-A".to_string(),
        "-s".to_string(),
        name.to_string(),
    ];
    if let Some(dir) = cwd {
        args.push("-c".to_string());
        args.push(dir.to_string());
    }
    (options.resolve_command().to_string(), args)
}

/// Creates or attaches to the tmux session `name`.
///
/// The output channel and exit notification belong to the attached client:
/// they close when the client detaches or the tmux session ends.
pub fn spawn(
    options: &TmuxOptions,
    name: &str,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    size: Option<(u16, u16)>,
) -> Result<Spawned<TmuxBackend>, SessionError> {
    let (program, args) = attach_command(options, name, cwd.as_deref());
    let spawned = pty::spawn(
        PtyCommand {
            program,
            args,
            cwd,
            env,
            size,
        },
        name,
    )?;

    Ok(spawned.map(|client| TmuxBackend {
        name: name.to_string(),
        options: options.clone(),
        client,
    }))
}

impl TmuxBackend {
    /// Process ID of the attached tmux client.
    pub fn pid(&self) -> Option<u32> {
        self.client.pid()
    }

    /// Returns whether the attached client is still running.
    pub fn is_running(&self) -> bool {
        self.client.is_running()
    }

    /// Writes input through the attached client.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.client.write(data).await
    }

    /// Resizes the client PTY and the tmux window.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        self.client.resize(cols, rows).await?;

        let (cols, rows) = (cols.to_string(), rows.to_string());
        let output = self
            .run_tmux(&["resize-window", "-t", &self.name, "-x", &cols, "-y", &rows])
            .await
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        if !output.status.success() {
            tracing::warn!(
                session_id = %self.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "tmux resize-window failed"
            );
        }
        Ok(())
    }

    /// Kills the tmux session, then the attached client.
    ///
    /// `signal` only applies to the client; the tmux session itself is always
    /// ended with `kill-session`.
    pub async fn kill(&self, signal: Option<i32>) -> Result<(), SessionError> {
        if self.has_session().await {
            let output = self
                .run_tmux(&["kill-session", "-t", &self.name])
                .await
                .map_err(|e| SessionError::KillFailed(e.to_string()))?;
            if !output.status.success() {
                return Err(SessionError::KillFailed(format!(
                    "tmux kill-session {} failed: {}",
                    self.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        self.client.kill(signal).await
    }

    /// Ends the attached client and leaves the tmux session running.
    pub async fn detach(&self) -> Result<(), SessionError> {
        self.client.kill(None).await
    }

    /// SIGKILLs the attached client. The tmux server is in another
    /// process group and is not touched.
    pub async fn force_kill(&self) -> Result<(), SessionError> {
        self.client.force_kill().await
    }

    /// Drops the client PTY.
    pub async fn release(&self) {
        self.client.release().await;
    }

    /// Whether tmux still knows this session.
    pub async fn has_session(&self) -> bool {
        self.run_tmux(&["has-session", "-t", &self.name])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Returns whether sessions should be killed on daemon shutdown.
    pub fn kill_on_shutdown(&self) -> bool {
        self.options.kill_on_shutdown
    }

    async fn run_tmux(&self, args: &[&str]) -> std::io::Result<Output> {
        Command::new(self.options.resolve_command())
            .args(args)
            .output()
            .await
    }
}
