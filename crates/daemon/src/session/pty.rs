//! PTY backend.
//!
//! Spawns a process on a pseudo-terminal and exposes its input, resize and
//! kill controls. Output and exit are not handled here: [`spawn`] hands back
//! an output channel and an exit notification, which the session wires into
//! its output pump.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::SessionError;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the reader -> pump channel.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Geometry used when the caller did not ask for one.
pub const DEFAULT_COLS: u16 = 80;
/// Geometry used when the caller did not ask for one.
pub const DEFAULT_ROWS: u16 = 24;

/// What to run on the PTY.
#[derive(Debug, Clone, Default)]
pub struct PtyCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Initial geometry, defaults to 80x24.
    pub size: Option<(u16, u16)>,
}

/// Handles produced by a successful spawn.
pub struct Spawned<B> {
    /// Control handle kept by the session.
    pub backend: B,
    /// Output chunks, closed at EOF.
    pub output_rx: mpsc::Receiver<Bytes>,
    /// Exit code of the child, sent once it has been reaped.
    pub exit_rx: oneshot::Receiver<i32>,
}

impl<B> Spawned<B> {
    /// Wraps the control handle, keeping the channels.
    pub fn map<T>(self, f: impl FnOnce(B) -> T) -> Spawned<T> {
        Spawned {
            backend: f(self.backend),
            output_rx: self.output_rx,
            exit_rx: self.exit_rx,
        }
    }
}

/// Handles of a plain PTY spawn.
pub type SpawnedPty = Spawned<PtyBackend>;

/// The master side of a running PTY process.
struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

/// Control handle for a process running on a PTY.
pub struct PtyBackend {
    io: Mutex<Option<PtyIo>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
}

/// Spawns `command` on a fresh PTY and starts its reader and waiter.
///
/// The reader forwards output chunks until EOF; the waiter reaps the child
/// and reports its exit code. Both run on the blocking pool.
pub fn spawn(command: PtyCommand, session_id: &str) -> Result<SpawnedPty, SessionError> {
    if let Some(ref dir) = command.cwd {
        if !Path::new(dir).is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {dir}"
            )));
        }
    }
    resolve_program(&command.program)?;

    let (cols, rows) = command.size.unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.args(&command.args);
    if let Some(ref dir) = command.cwd {
        cmd.cwd(dir);
    }
    if std::env::var_os("TERM").is_none() && !command.env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    // Only the child may hold the slave side, otherwise the reader never sees EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let running = Arc::new(AtomicBool::new(true));
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    start_reader(reader, output_tx, session_id.to_string());
    start_waiter(child, exit_tx, Arc::clone(&running), session_id.to_string());

    tracing::debug!(
        session_id = %session_id,
        program = %command.program,
        pid = ?pid,
        cols = cols,
        rows = rows,
        "Spawned PTY process"
    );

    Ok(SpawnedPty {
        backend: PtyBackend {
            io: Mutex::new(Some(PtyIo {
                master: pair.master,
                writer,
            })),
            killer: Mutex::new(killer),
            running,
            pid,
        },
        output_rx,
        exit_rx,
    })
}

impl PtyBackend {
    /// Process ID of the child, if the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the child has not been reaped yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes raw input to the process.
    ///
    /// Writing after the process has exited is a no-op: viewers racing the
    /// exit is expected.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        let mut io = self.io.lock().await;
        let Some(io) = io.as_mut() else {
            return Ok(());
        };
        io.writer
            .write_all(data)
            .and_then(|()| io.writer.flush())
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Resizes the PTY. A no-op once the process is gone.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let io = self.io.lock().await;
        let Some(io) = io.as_ref() else {
            return Ok(());
        };
        io.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Terminates the process.
    ///
    /// With an explicit signal the signal is delivered to the child's pid,
    /// otherwise the PTY's own killer is used.
    pub async fn kill(&self, signal: Option<i32>) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        if let (Some(signal), Some(pid)) = (signal, self.pid) {
            return send_signal(pid, signal);
        }

        let mut killer = self.killer.lock().await;
        match killer.kill() {
            Ok(()) => Ok(()),
            // Reaped between the check and the kill.
            Err(_) if !self.is_running() => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }

    /// Sends SIGKILL to the child's process group.
    ///
    /// The child leads its own session on the PTY, so this also reaches
    /// anything it started in the foreground.
    pub async fn force_kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => kill_group(pid),
            None => self
                .killer
                .lock()
                .await
                .kill()
                .map_err(|e| SessionError::KillFailed(e.to_string())),
        }
    }

    /// Drops the master side of the PTY.
    pub async fn release(&self) {
        self.io.lock().await.take();
    }
}

/// Checks that `program` can be executed.
fn resolve_program(program: &str) -> Result<(), SessionError> {
    if program.is_empty() {
        return Err(SessionError::SpawnFailed("empty command".to_string()));
    }
    if program.contains('/') {
        if Path::new(program).is_file() {
            return Ok(());
        }
        return Err(SessionError::SpawnFailed(format!(
            "command not found: {program}"
        )));
    }
    which::which(program)
        .map(|_| ())
        .map_err(|_| SessionError::SpawnFailed(format!("command not found: {program}")))
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), SessionError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = Signal::try_from(signal)
        .map_err(|e| SessionError::KillFailed(format!("invalid signal {signal}: {e}")))?;
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::KillFailed(e.to_string())),
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> Result<(), SessionError> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Not a group leader after all: fall back to the process itself.
        Err(nix::errno::Errno::ESRCH) => match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        },
        Err(e) => Err(SessionError::KillFailed(e.to_string())),
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) -> Result<(), SessionError> {
    Err(SessionError::KillFailed(format!(
        "process groups are not supported on this platform: {pid}"
    )))
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: i32) -> Result<(), SessionError> {
    Err(SessionError::KillFailed(format!(
        "signals are not supported on this platform: {signal}"
    )))
}

/// Forwards PTY output to the pump until EOF or a read error.
fn start_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>, session_id: String) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(session_id = %session_id, "PTY EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        tracing::debug!(session_id = %session_id, "Output pump gone, reader stopping");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the child side is closed.
                    tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                    break;
                }
            }
        }
    });
}

/// Reaps the child and reports its exit code.
fn start_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    tx: oneshot::Sender<i32>,
    running: Arc<AtomicBool>,
    session_id: String,
) {
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to wait for child");
                -1
            }
        };
        running.store(false, Ordering::SeqCst);
        tracing::debug!(session_id = %session_id, code = code, "Child reaped");
        let _ = tx.send(code);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> PtyCommand {
        PtyCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    async fn collect_output(rx: &mut mpsc::Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), rx.recv()).await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).to_string()
    }

    /// Polls until no process is left in `pid`'s group.
    #[cfg(unix)]
    async fn group_gone(pid: u32) -> bool {
        let group = nix::unistd::Pid::from_raw(pid as i32);
        for _ in 0..50 {
            if nix::sys::signal::killpg(group, None) == Err(nix::errno::Errno::ESRCH) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program("/bin/sh").is_ok());
        assert!(resolve_program("sh").is_ok());
        assert!(resolve_program("").is_err());
        assert!(resolve_program("/definitely/not/here").is_err());
        assert!(resolve_program("shellcast-no-such-binary").is_err());
    }

    #[tokio::test]
    async fn test_spawn_echo_and_exit_code() {
        let mut spawned = spawn(sh("echo hi; exit 3"), "test").unwrap();
        assert!(spawned.backend.pid().is_some());

        let output = collect_output(&mut spawned.output_rx).await;
        assert!(output.contains("hi"), "unexpected output: {output:?}");

        let code = timeout(Duration::from_secs(5), spawned.exit_rx).await.unwrap().unwrap();
        assert_eq!(code, 3);
        assert!(!spawned.backend.is_running());
    }

    #[tokio::test]
    async fn test_spawn_missing_cwd_fails() {
        let command = PtyCommand {
            cwd: Some("/definitely/not/a/dir".to_string()),
            ..sh("true")
        };
        assert!(matches!(spawn(command, "test"), Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_unknown_command_fails() {
        let command = PtyCommand {
            program: "shellcast-no-such-binary".to_string(),
            ..Default::default()
        };
        assert!(matches!(spawn(command, "test"), Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = sh("echo \"$SHELLCAST_TEST_VAR\"; pwd");
        command.cwd = Some(dir.path().to_string_lossy().to_string());
        command
            .env
            .insert("SHELLCAST_TEST_VAR".to_string(), "test_value".to_string());

        let mut spawned = spawn(command, "test").unwrap();
        let output = collect_output(&mut spawned.output_rx).await;
        assert!(output.contains("test_value"));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(output.contains(&dir_name));
    }

    #[tokio::test]
    async fn test_write_reaches_process() {
        let mut spawned = spawn(sh("read line; echo got:$line"), "test").unwrap();
        spawned.backend.write(b"marker\n").await.unwrap();
        let output = collect_output(&mut spawned.output_rx).await;
        assert!(output.contains("got:marker"), "unexpected output: {output:?}");
    }

    #[tokio::test]
    async fn test_resize_running_process() {
        let spawned = spawn(sh("sleep 5"), "test").unwrap();
        assert!(spawned.backend.resize(120, 40).await.is_ok());
        spawned.backend.kill(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_then_write_and_resize_are_noops() {
        let spawned = spawn(sh("sleep 30"), "test").unwrap();
        spawned.backend.kill(None).await.unwrap();
        timeout(Duration::from_secs(5), spawned.exit_rx).await.unwrap().unwrap();

        assert!(spawned.backend.write(b"ignored\n").await.is_ok());
        spawned.backend.release().await;
        assert!(spawned.backend.resize(100, 50).await.is_ok());
        assert!(spawned.backend.kill(None).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_kill_reaches_hup_ignoring_child() {
        let spawned = spawn(sh("trap '' HUP; while :; do sleep 1; done"), "test").unwrap();
        let pid = spawned.backend.pid().unwrap();

        spawned.backend.kill(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(spawned.backend.is_running());

        spawned.backend.force_kill().await.unwrap();
        timeout(Duration::from_secs(5), spawned.exit_rx).await.unwrap().unwrap();

        assert!(group_gone(pid).await, "process group {pid} survived SIGKILL");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_with_signal() {
        let spawned = spawn(sh("sleep 30"), "test").unwrap();
        spawned.backend.kill(Some(15)).await.unwrap();
        let code = timeout(Duration::from_secs(5), spawned.exit_rx).await.unwrap().unwrap();
        assert_ne!(code, 0);
    }
}
