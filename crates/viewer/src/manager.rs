//! Viewer-side connection manager.
//!
//! Keeps one push connection to a session alive. Two loops run side by side:
//!
//! - a liveness loop polling `/health`, independent of the push transport;
//! - a push loop that connects, pumps frames, and on failure waits
//!   `min(base * 2^attempts, cap)` before trying again.
//!
//! A successful health check while disconnected resets the backoff and wakes
//! the push loop, so recovery after an outage does not wait out a long delay.
//! The push loop gives up for good when the session is gone (close 4004),
//! the credential is rejected (HTTP 401) or the session exits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ActivityState, ClientMessage, ServerMessage, SessionStatus, CLOSE_SESSION_NOT_FOUND,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, DEFAULT_BASE, DEFAULT_CAP};
use crate::catchup::CatchUpClient;
use crate::cursor::{OffsetCursor, Replay};
use crate::error::{Result, ViewerError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default period of the `/health` liveness check.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the event and outgoing message queues.
const QUEUE_CAPACITY: usize = 1024;

/// Connection status as seen by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No usable connection.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The daemon is reachable and the push transport is up.
    Connected,
}

/// Why the manager stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The session does not exist.
    SessionNotFound,
    /// The daemon rejected the credential.
    Unauthorized,
    /// The session's process exited.
    SessionExited {
        /// Exit code.
        code: i32,
    },
}

/// Events delivered to the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Status changed.
    Status(ConnectionStatus),
    /// A push connection attached.
    Attached {
        /// Offset of the first replayed byte.
        offset: u64,
        /// Offset just past the last replayed byte.
        end_offset: u64,
        /// Session status at attach time.
        status: SessionStatus,
        /// Geometry, if known.
        size: Option<(u16, u16)>,
    },
    /// Terminal output not delivered before.
    Output(Bytes),
    /// Output between `from` and `to` was evicted before the viewer saw it.
    Truncated {
        /// First missing offset.
        from: u64,
        /// First offset available again.
        to: u64,
    },
    /// The session's output stream started over (for example a tmux session
    /// re-created under the same name); discard what was rendered before.
    Restarted {
        /// Offset the viewer had reached in the old stream.
        previous: u64,
    },
    /// Activity classification changed.
    Activity(ActivityState),
    /// The session's process exited.
    Exit {
        /// Exit code.
        code: i32,
    },
    /// The daemon reported an error.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// The manager stopped and will not reconnect.
    Stopped(StopReason),
}

/// Settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Daemon base URL, e.g. `http://127.0.0.1:7681`.
    pub base_url: String,
    /// Session to attach to.
    pub session_id: String,
    /// Shared secret, if the daemon requires one.
    pub token: Option<String>,
    /// Period of the `/health` check.
    pub health_interval: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_cap: Duration,
}

impl ViewerConfig {
    /// Settings with default timings.
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_id: session_id.into(),
            token: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            backoff_base: DEFAULT_BASE,
            backoff_cap: DEFAULT_CAP,
        }
    }

    /// Sets the shared secret.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the health check period.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Sets the reconnect backoff bounds.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }
}

/// How one push connection ended.
enum Ending {
    /// Reconnect after backoff.
    Lost,
    /// Never reconnect.
    Stop(StopReason),
}

struct Inner {
    config: ViewerConfig,
    http: CatchUpClient,
    status: watch::Sender<ConnectionStatus>,
    backoff: Mutex<Backoff>,
    cursor: Mutex<OffsetCursor>,
    wake: Notify,
    events: mpsc::Sender<ViewerEvent>,
    outgoing: mpsc::Sender<ClientMessage>,
    shutdown: CancellationToken,
}

impl Inner {
    async fn emit(&self, event: ViewerEvent) {
        let _ = self.events.send(event).await;
    }

    async fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::debug!(session_id = %self.config.session_id, status = ?status, "Connection status changed");
            self.emit(ViewerEvent::Status(status)).await;
        }
    }

    async fn stop(&self, reason: StopReason) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(session_id = %self.config.session_id, reason = ?reason, "Viewer stopped");
        self.shutdown.cancel();
        self.set_status(ConnectionStatus::Disconnected).await;
        self.emit(ViewerEvent::Stopped(reason)).await;
    }
}

/// Maintains a push connection to one session.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    outgoing_rx: std::sync::Mutex<Option<mpsc::Receiver<ClientMessage>>>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<ViewerEvent>>>,
}

impl ConnectionManager {
    /// Creates a manager. Nothing connects until [`start`](Self::start).
    pub fn new(config: ViewerConfig) -> Result<Self> {
        protocol::validate_session_id(&config.session_id)?;
        let http = CatchUpClient::new(&config.base_url, config.token.clone())?;
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(QUEUE_CAPACITY);
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                status,
                backoff: Mutex::new(backoff),
                cursor: Mutex::new(OffsetCursor::new()),
                wake: Notify::new(),
                events: events_tx,
                outgoing: outgoing_tx,
                shutdown: CancellationToken::new(),
            }),
            outgoing_rx: std::sync::Mutex::new(Some(outgoing_rx)),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// Starts both loops and returns the event stream.
    ///
    /// Returns `None` if the manager was already started.
    pub fn start(&self) -> Option<mpsc::Receiver<ViewerEvent>> {
        let outgoing_rx = self.outgoing_rx.lock().ok()?.take()?;
        let events_rx = self.events_rx.lock().ok()?.take()?;

        tokio::spawn(health_loop(Arc::clone(&self.inner)));
        tokio::spawn(push_loop(Arc::clone(&self.inner), outgoing_rx));
        Some(events_rx)
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watches status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Offset just past the last byte delivered as [`ViewerEvent::Output`].
    pub async fn position(&self) -> u64 {
        self.inner.cursor.lock().await.position()
    }

    /// Current consecutive failure count.
    pub async fn attempts(&self) -> u32 {
        self.inner.backoff.lock().await.attempts()
    }

    /// The HTTP client, for catch-up polling.
    pub fn http(&self) -> &CatchUpClient {
        &self.inner.http
    }

    /// Sends input to the shell.
    pub async fn send_input(&self, data: impl Into<String>) -> Result<()> {
        self.send(ClientMessage::Input { data: data.into() }).await
    }

    /// Resizes the terminal.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(ClientMessage::Resize { cols, rows }).await
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ViewerError::NotConnected);
        }
        self.inner
            .outgoing
            .send(message)
            .await
            .map_err(|_| ViewerError::NotConnected)
    }

    /// Stops both loops and closes the push connection.
    pub async fn stop(&self) {
        self.inner.stop(StopReason::Requested).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn health_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.health_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let status = *inner.status.borrow();
        match inner.http.health().await {
            Ok(_) if status == ConnectionStatus::Disconnected => {
                tracing::debug!(session_id = %inner.config.session_id, "Daemon reachable again");
                inner.backoff.lock().await.reset();
                inner.set_status(ConnectionStatus::Connected).await;
                inner.wake.notify_one();
            }
            Ok(_) => {}
            Err(e) if status == ConnectionStatus::Connected => {
                tracing::warn!(session_id = %inner.config.session_id, error = %e, "Health check failed");
                inner.set_status(ConnectionStatus::Disconnected).await;
            }
            Err(e) => {
                tracing::trace!(error = %e, "Health check failed");
            }
        }
    }
}

async fn push_loop(inner: Arc<Inner>, mut outgoing: mpsc::Receiver<ClientMessage>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        if *inner.status.borrow() == ConnectionStatus::Disconnected {
            inner.set_status(ConnectionStatus::Connecting).await;
        }

        let ending = match connect(&inner).await {
            Ok(stream) => {
                inner.backoff.lock().await.reset();
                inner.set_status(ConnectionStatus::Connected).await;
                tracing::info!(session_id = %inner.config.session_id, "Push transport connected");
                run_connection(&inner, stream, &mut outgoing).await
            }
            Err(ViewerError::Unauthorized) => Ending::Stop(StopReason::Unauthorized),
            Err(e) => {
                tracing::debug!(session_id = %inner.config.session_id, error = %e, "Push connect failed");
                Ending::Lost
            }
        };

        if let Ending::Stop(reason) = ending {
            inner.stop(reason).await;
            break;
        }
        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.set_status(ConnectionStatus::Disconnected).await;
        let delay = inner.backoff.lock().await.next_delay();
        tracing::info!(session_id = %inner.config.session_id, "Reconnecting in {:?}", delay);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = inner.wake.notified() => {}
        }
    }
}

async fn connect(inner: &Inner) -> Result<WsStream> {
    let url = inner.http.push_url(&inner.config.session_id)?;
    let (stream, _) = connect_async(url.as_str()).await?;
    Ok(stream)
}

/// Pumps one push connection until it ends.
async fn run_connection(
    inner: &Inner,
    stream: WsStream,
    outgoing: &mut mpsc::Receiver<ClientMessage>,
) -> Ending {
    let (mut sink, mut stream) = stream.split();
    let mut exit_code = None;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ending::Stop(StopReason::Requested);
            }

            Some(message) = outgoing.recv() => {
                let sent = match message.to_json() {
                    Ok(json) => sink.send(WsMessage::Text(json)).await.is_ok(),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode message");
                        true
                    }
                };
                if !sent {
                    return lost_or_exit(exit_code);
                }
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %inner.config.session_id, error = %e, "Push transport error");
                        return lost_or_exit(exit_code);
                    }
                    None => return lost_or_exit(exit_code),
                };

                match frame {
                    WsMessage::Binary(data) => {
                        let fresh = inner.cursor.lock().await.accept(&data).to_vec();
                        if !fresh.is_empty() {
                            inner.emit(ViewerEvent::Output(Bytes::from(fresh))).await;
                        }
                    }
                    WsMessage::Text(text) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Ping { timestamp }) => {
                            let pong = ClientMessage::Pong { timestamp: Some(timestamp) };
                            if let Ok(json) = pong.to_json() {
                                if sink.send(WsMessage::Text(json)).await.is_err() {
                                    return lost_or_exit(exit_code);
                                }
                            }
                        }
                        Ok(message) => {
                            if let Some(code) = handle_message(inner, message).await {
                                exit_code = Some(code);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring malformed message");
                        }
                    },
                    WsMessage::Close(frame) => {
                        let code = frame.map(|f| u16::from(f.code));
                        tracing::debug!(session_id = %inner.config.session_id, code = ?code, "Push transport closed");
                        if code == Some(CLOSE_SESSION_NOT_FOUND) {
                            return Ending::Stop(StopReason::SessionNotFound);
                        }
                        return lost_or_exit(exit_code);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Handles a non-ping server message. Returns the exit code on `exit`.
async fn handle_message(inner: &Inner, message: ServerMessage) -> Option<i32> {
    match message {
        ServerMessage::Attached {
            offset,
            end_offset,
            status,
            cols,
            rows,
            ..
        } => {
            let replay = inner.cursor.lock().await.begin_replay(offset, end_offset);
            match replay {
                Replay::Continuous => {}
                Replay::Gap(gap) => {
                    inner
                        .emit(ViewerEvent::Truncated {
                            from: gap.from,
                            to: gap.to,
                        })
                        .await;
                }
                Replay::Restarted { previous } => {
                    tracing::warn!(
                        session_id = %inner.config.session_id,
                        previous = previous,
                        end_offset = end_offset,
                        "Session output started over"
                    );
                    inner.emit(ViewerEvent::Restarted { previous }).await;
                }
            }
            inner
                .emit(ViewerEvent::Attached {
                    offset,
                    end_offset,
                    status,
                    size: cols.zip(rows),
                })
                .await;
            None
        }
        ServerMessage::Exit { code } => {
            inner.emit(ViewerEvent::Exit { code }).await;
            Some(code)
        }
        ServerMessage::Error { message } => {
            inner.emit(ViewerEvent::Error { message }).await;
            None
        }
        ServerMessage::Activity { state } => {
            inner.emit(ViewerEvent::Activity(state)).await;
            None
        }
        ServerMessage::Ping { .. } => None,
    }
}

fn lost_or_exit(exit_code: Option<i32>) -> Ending {
    match exit_code {
        Some(code) => Ending::Stop(StopReason::SessionExited { code }),
        None => Ending::Lost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ViewerConfig::new("http://127.0.0.1:7681", "main")
            .with_token("s3cret")
            .with_health_interval(Duration::from_secs(1))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(100));

        assert_eq!(config.token.as_deref(), Some("s3cret"));
        assert_eq!(config.health_interval, Duration::from_secs(1));
        assert_eq!(config.backoff_base, Duration::from_millis(10));
        assert_eq!(config.backoff_cap, Duration::from_millis(100));
    }

    #[test]
    fn test_new_validates_inputs() {
        assert!(ConnectionManager::new(ViewerConfig::new("http://127.0.0.1:1", "bad id")).is_err());
        assert!(ConnectionManager::new(ViewerConfig::new("nope", "main")).is_err());
    }

    #[tokio::test]
    async fn test_starts_disconnected_and_rejects_input() {
        let manager =
            ConnectionManager::new(ViewerConfig::new("http://127.0.0.1:1", "main")).unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            manager.send_input("ls\n").await,
            Err(ViewerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_backs_off() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ViewerConfig::new(format!("http://{addr}"), "main")
            .with_health_interval(Duration::from_secs(60))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40));
        let manager = ConnectionManager::new(config).unwrap();
        let mut events = manager.start().unwrap();
        assert!(manager.start().is_none());

        let mut saw_connecting = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.attempts().await < 3 && tokio::time::Instant::now() < deadline {
            if let Ok(Some(ViewerEvent::Status(ConnectionStatus::Connecting))) =
                tokio::time::timeout(Duration::from_millis(50), events.recv()).await
            {
                saw_connecting = true;
            }
        }

        assert!(saw_connecting);
        assert!(manager.attempts().await >= 3);
        assert_ne!(manager.status(), ConnectionStatus::Connected);

        manager.stop().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
