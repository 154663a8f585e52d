//! A single session and its output pump.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::{
    ActivityState, BackendKind, CreateSessionRequest, OutputResponse, ServerMessage, SessionInfo,
    SessionStatus,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::activity::{ActivityPolicy, ActivityTracker};
use super::multiplexer::{ClientStats, ClientSubscription, SessionOutputBroadcaster, DEFAULT_CHANNEL_CAPACITY};
use super::pty::{self, PtyBackend, PtyCommand, Spawned};
use super::scrollback::{ScrollbackBuffer, ScrollbackRead};
use super::tmux::{self, TmuxBackend, TmuxOptions};
use super::{unix_millis, OutputObserver, SessionError, SessionId};

/// Default scrollback ceiling in bytes.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;

/// Default time allowed for output still in flight when the process exits.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(250);

/// What to run for a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSpec {
    /// Program to run, defaults to the configured shell.
    pub command: Option<String>,
    /// Arguments for the program.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Initial geometry.
    pub size: Option<(u16, u16)>,
    /// Create or attach to this tmux session instead of spawning a program.
    pub tmux_session: Option<String>,
}

impl SessionSpec {
    /// Runs `program` with `args`.
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: Some(program.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }
}

impl From<CreateSessionRequest> for SessionSpec {
    fn from(req: CreateSessionRequest) -> Self {
        let size = match (req.cols, req.rows) {
            (Some(cols), Some(rows)) => Some((cols, rows)),
            _ => None,
        };
        Self {
            command: req.command,
            args: req.args,
            cwd: req.cwd,
            env: req.env,
            size,
            tmux_session: req.tmux_session,
        }
    }
}

/// Per-session tunables, derived from the daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Program used when a `SessionSpec` names none.
    pub default_shell: String,
    /// Scrollback ceiling in bytes.
    pub scrollback_bytes: usize,
    /// Per-client queue capacity.
    pub client_buffer: usize,
    /// Time allowed for in-flight output after exit.
    pub exit_grace: Duration,
    /// Activity classification policy.
    pub activity: ActivityPolicy,
    /// tmux settings.
    pub tmux: TmuxOptions,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            client_buffer: DEFAULT_CHANNEL_CAPACITY,
            exit_grace: DEFAULT_EXIT_GRACE,
            activity: ActivityPolicy::default(),
            tmux: TmuxOptions::default(),
        }
    }
}

/// What a client gets when it attaches.
#[derive(Debug)]
pub struct Attachment {
    /// The `attached` message to send first.
    pub handshake: ServerMessage,
    /// Scrollback to replay right after the handshake.
    pub replay: ScrollbackRead,
    /// Exit code if the session had already exited; no subscription then.
    pub exit_code: Option<i32>,
    /// Live output, for running sessions.
    pub subscription: Option<ClientSubscription>,
}

enum Backend {
    Pty(PtyBackend),
    Tmux(TmuxBackend),
}

impl Backend {
    fn pid(&self) -> Option<u32> {
        match self {
            Backend::Pty(b) => b.pid(),
            Backend::Tmux(b) => b.pid(),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        match self {
            Backend::Pty(b) => b.write(data).await,
            Backend::Tmux(b) => b.write(data).await,
        }
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self {
            Backend::Pty(b) => b.resize(cols, rows).await,
            Backend::Tmux(b) => b.resize(cols, rows).await,
        }
    }

    async fn kill(&self, signal: Option<i32>) -> Result<(), SessionError> {
        match self {
            Backend::Pty(b) => b.kill(signal).await,
            Backend::Tmux(b) => b.kill(signal).await,
        }
    }

    async fn force_kill(&self) -> Result<(), SessionError> {
        match self {
            Backend::Pty(b) => b.force_kill().await,
            Backend::Tmux(b) => b.force_kill().await,
        }
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        match self {
            Backend::Pty(b) => b.kill(None).await,
            Backend::Tmux(b) if b.kill_on_shutdown() => b.kill(None).await,
            Backend::Tmux(b) => b.detach().await,
        }
    }

    async fn release(&self) {
        match self {
            Backend::Pty(b) => b.release().await,
            Backend::Tmux(b) => b.release().await,
        }
    }
}

/// Mutable session state, guarded by the session lock.
struct SessionState {
    status: SessionStatus,
    exit_code: Option<i32>,
    geometry: Option<(u16, u16)>,
    last_activity: u64,
    scrollback: ScrollbackBuffer,
    activity: ActivityTracker,
    clients: SessionOutputBroadcaster,
}

/// A live (or exited) session.
pub struct Session {
    id: SessionId,
    kind: BackendKind,
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
    created_at: u64,
    pid: Option<u32>,
    backend: Backend,
    state: Mutex<SessionState>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl Session {
    /// Spawns the backend described by `spec` and starts the output pump.
    pub fn spawn(
        id: SessionId,
        spec: SessionSpec,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, SessionError> {
        let SessionSpec {
            command,
            args,
            cwd,
            env,
            size,
            tmux_session,
        } = spec;

        let (kind, command, args, spawned) = match tmux_session {
            Some(name) => {
                let (program, args) = tmux::attach_command(&settings.tmux, &name, cwd.as_deref());
                let spawned = tmux::spawn(&settings.tmux, &name, cwd.clone(), env, size)?
                    .map(Backend::Tmux);
                (BackendKind::Tmux, program, args, spawned)
            }
            None => {
                let program = command.unwrap_or_else(|| settings.default_shell.clone());
                let spawned = pty::spawn(
                    PtyCommand {
                        program: program.clone(),
                        args: args.clone(),
                        cwd: cwd.clone(),
                        env,
                        size,
                    },
                    &id,
                )?
                .map(Backend::Pty);
                (BackendKind::Pty, program, args, spawned)
            }
        };

        let Spawned {
            backend,
            output_rx,
            exit_rx,
        } = spawned;
        let now = unix_millis();
        let (exit_tx, _) = watch::channel(None);

        let session = Arc::new(Session {
            kind,
            command,
            args,
            cwd,
            created_at: now,
            pid: backend.pid(),
            backend,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                exit_code: None,
                geometry: size,
                last_activity: now,
                scrollback: ScrollbackBuffer::new(settings.scrollback_bytes),
                activity: ActivityTracker::new(settings.activity),
                clients: SessionOutputBroadcaster::new(id.clone(), settings.client_buffer),
            }),
            exit_tx,
            id,
        });

        tokio::spawn(run_pump(
            Arc::clone(&session),
            output_rx,
            exit_rx,
            settings.exit_grace,
        ));

        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the backend kind.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns the process ID of the backend child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the session has not exited yet.
    pub fn is_running(&self) -> bool {
        self.exit_tx.borrow().is_none()
    }

    /// Returns the exit code once the session has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    /// Waits until the session has exited and returns its exit code.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.exit_tx.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        match result {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        }
    }

    /// Current geometry, `None` until known.
    pub async fn geometry(&self) -> Option<(u16, u16)> {
        self.state.lock().await.geometry
    }

    /// Number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.client_count()
    }

    /// Snapshot of the session for the API.
    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id.clone(),
            backend: self.kind,
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            cols: state.geometry.map(|(cols, _)| cols),
            rows: state.geometry.map(|(_, rows)| rows),
            status: state.status,
            exit_code: state.exit_code,
            activity: state.activity.reported(),
            created_at: self.created_at,
            last_activity: state.last_activity,
            clients: state.clients.client_count(),
            start_offset: state.scrollback.start_offset(),
            offset: state.scrollback.end_offset(),
        }
    }

    /// Forwards raw input to the backend. A no-op once the session has exited.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            tracing::trace!(session_id = %self.id, "Dropping input for exited session");
            return Ok(());
        }
        self.backend.write(data).await
    }

    /// Resizes the terminal.
    ///
    /// Both dimensions must be positive. The stored geometry only changes if
    /// the backend accepted the new size; after exit this is a no-op.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }
        if !self.is_running() {
            return Ok(());
        }

        self.backend.resize(cols, rows).await?;

        let mut state = self.state.lock().await;
        if state.status == SessionStatus::Running {
            state.geometry = Some((cols, rows));
        }
        tracing::debug!(session_id = %self.id, cols = cols, rows = rows, "Resized session");
        Ok(())
    }

    /// Attaches a client.
    ///
    /// The replay and the live subscription are taken under one lock, so the
    /// client sees every byte exactly once: replay up to `end_offset`, then
    /// live output from there on.
    pub async fn attach(&self, client_id: &str) -> Attachment {
        let mut state = self.state.lock().await;
        let replay = state.scrollback.snapshot();
        let handshake = ServerMessage::Attached {
            session_id: self.id.clone(),
            offset: replay.start_offset,
            end_offset: replay.end_offset,
            truncated: replay.truncated,
            status: state.status,
            cols: state.geometry.map(|(cols, _)| cols),
            rows: state.geometry.map(|(_, rows)| rows),
        };

        let subscription = match state.status {
            SessionStatus::Running => Some(state.clients.add_client(client_id.to_string())),
            SessionStatus::Exited => None,
        };

        tracing::debug!(
            session_id = %self.id,
            client_id = %client_id,
            replay_bytes = replay.data.len(),
            truncated = replay.truncated,
            "Client attached"
        );

        Attachment {
            handshake,
            replay,
            exit_code: state.exit_code,
            subscription,
        }
    }

    /// Detaches a client. Returns its statistics if it was still attached.
    pub async fn detach(&self, client_id: &str) -> Option<ClientStats> {
        let stats = self.state.lock().await.clients.remove_client(client_id);
        if stats.is_some() {
            tracing::debug!(session_id = %self.id, client_id = %client_id, "Client detached");
        }
        stats
    }

    /// Reads output from `offset` onward, for catch-up polling.
    ///
    /// The text is cut at character boundaries; while the session runs, a
    /// character whose bytes have not all arrived is left for the next poll.
    pub async fn read_output(&self, offset: u64) -> OutputResponse {
        let state = self.state.lock().await;
        let running = state.status == SessionStatus::Running;
        let read = state.scrollback.read_from(offset).align_to_chars(running);
        OutputResponse {
            output: String::from_utf8_lossy(&read.data).into_owned(),
            offset: read.end_offset,
            start_offset: read.start_offset,
            truncated: read.truncated,
            status: state.status,
            exit_code: state.exit_code,
        }
    }

    /// Current activity classification.
    pub async fn activity(&self) -> ActivityState {
        self.state.lock().await.activity.reported()
    }

    /// Terminates the backend. A no-op once the session has exited.
    pub async fn kill(&self, signal: Option<i32>) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        tracing::info!(session_id = %self.id, signal = ?signal, "Killing session");
        self.backend.kill(signal).await
    }

    /// Kills the backend's process group outright, for processes that
    /// ignored a polite termination.
    pub async fn force_kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        tracing::warn!(session_id = %self.id, pid = ?self.pid(), "Sending SIGKILL to session");
        self.backend.force_kill().await
    }

    /// Stops the backend for daemon shutdown.
    ///
    /// tmux sessions are left running unless configured otherwise.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        self.backend.shutdown().await
    }

    /// Appends a chunk and fans it out.
    async fn dispatch_output(&self, chunk: Bytes) {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        if guard.status == SessionStatus::Exited {
            return;
        }

        let state = &mut *guard;
        state.last_activity = unix_millis();
        let observers: [&mut dyn OutputObserver; 3] =
            [&mut state.scrollback, &mut state.activity, &mut state.clients];
        for observer in observers {
            observer.on_output(&chunk, now);
        }

        if let Some(activity) = state.activity.poll_transition(now) {
            state
                .clients
                .send_message(&ServerMessage::Activity { state: activity });
        }
    }

    /// Re-evaluates activity after a quiet period.
    async fn poll_activity(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(activity) = state.activity.poll_transition(Instant::now()) {
            tracing::trace!(session_id = %self.id, activity = ?activity, "Activity changed");
            state
                .clients
                .send_message(&ServerMessage::Activity { state: activity });
        }
    }

    async fn next_activity_deadline(&self) -> Option<Instant> {
        self.state.lock().await.activity.next_deadline()
    }

    /// Marks the session exited. Only the first call has any effect.
    pub(crate) async fn finalize(&self, code: i32) {
        {
            let mut guard = self.state.lock().await;
            if guard.status == SessionStatus::Exited {
                return;
            }

            let state = &mut *guard;
            state.status = SessionStatus::Exited;
            state.exit_code = Some(code);
            state.scrollback.on_exit(code);
            state.activity.on_exit(code);
            if let Some(activity) = state.activity.poll_transition(Instant::now()) {
                state
                    .clients
                    .send_message(&ServerMessage::Activity { state: activity });
            }
            state.clients.on_exit(code);
            self.exit_tx.send_replace(Some(code));
        }

        self.backend.release().await;
        tracing::info!(session_id = %self.id, code = code, "Session exited");
    }
}

/// Drives one session's output and exit handling.
///
/// Chunks are dispatched one at a time, in order. Once the child has been
/// reaped, output still in flight is drained for at most `grace` before the
/// session is finalized.
async fn run_pump(
    session: Arc<Session>,
    mut output_rx: mpsc::Receiver<Bytes>,
    mut exit_rx: oneshot::Receiver<i32>,
    grace: Duration,
) {
    let mut reader_done = false;

    let code = loop {
        let deadline = session.next_activity_deadline().await;

        tokio::select! {
            biased;

            chunk = output_rx.recv(), if !reader_done => match chunk {
                Some(chunk) => session.dispatch_output(chunk).await,
                None => reader_done = true,
            },
            result = &mut exit_rx => break result.unwrap_or(-1),
            _ = sleep_until(deadline), if deadline.is_some() => session.poll_activity().await,
        }
    };

    if !reader_done {
        let drain_deadline = tokio::time::Instant::now() + grace;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(drain_deadline, output_rx.recv()).await {
            session.dispatch_output(chunk).await;
        }
    }

    session.finalize(code).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
