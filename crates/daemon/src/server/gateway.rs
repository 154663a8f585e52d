//! Push transport: one WebSocket per attached viewer at `/ws/{sessionId}`.
//!
//! After the upgrade the gateway sends, in order, the `attached` handshake,
//! the scrollback replay as a single binary frame, and then live output as
//! binary frames interleaved with JSON control messages. Inbound text frames
//! carry [`ClientMessage`]s; inbound binary frames are raw input.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ClientMessage, ServerMessage, CLOSE_CLIENT_TOO_SLOW, CLOSE_GOING_AWAY,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, CLOSE_SESSION_NOT_FOUND,
};
use uuid::Uuid;

use super::error::ApiError;
use super::heartbeat::{self, Heartbeat, HeartbeatAction};
use super::AppState;
use crate::session::{ClientSubscription, Outbound, Session, SessionRegistry};

/// Outbound half of a viewer socket.
///
/// Every send is bounded by `send_timeout`. A peer that stalls past it is
/// treated as gone.
struct Peer {
    sink: SplitSink<WebSocket, Message>,
    send_timeout: Duration,
}

impl Peer {
    fn new(sink: SplitSink<WebSocket, Message>, send_timeout: Duration) -> Self {
        Self { sink, send_timeout }
    }

    /// Sends one frame. Returns false if the peer is gone or stalled.
    async fn send(&mut self, message: Message) -> bool {
        match tokio::time::timeout(self.send_timeout, self.sink.send(message)).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                tracing::info!(timeout = ?self.send_timeout, "Viewer stopped reading, dropping it");
                false
            }
        }
    }

    async fn send_message(&mut self, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(Message::Text(json)).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode message");
                true
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        if self.send(Message::Close(Some(frame))).await {
            let _ = tokio::time::timeout(self.send_timeout, self.sink.close()).await;
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// We close with this code and reason.
    Close(u16, &'static str),
    /// The peer went away; nothing left to send.
    Gone,
}

/// `GET /ws/{id}`: validates the id, then upgrades.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    protocol::validate_session_id(&session_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (sink, receiver) = socket.split();
    let mut peer = Peer::new(sink, state.heartbeat_interval);

    let session = match state.registry.get(&session_id) {
        Ok(session) => session,
        Err(_) => {
            tracing::debug!(session_id = %session_id, "Push attach to unknown session");
            let notice = ServerMessage::Error {
                message: format!("session not found: {session_id}"),
            };
            if peer.send_message(&notice).await {
                peer.close(CLOSE_SESSION_NOT_FOUND, "session not found").await;
            }
            return;
        }
    };

    let client_id = Uuid::new_v4().to_string();
    let attachment = session.attach(&client_id).await;

    let mut greeted = peer.send_message(&attachment.handshake).await;
    if greeted && !attachment.replay.data.is_empty() {
        greeted = peer
            .send(Message::Binary(attachment.replay.data.to_vec()))
            .await;
    }

    let ending = match (greeted, attachment.subscription) {
        (false, _) => Ending::Gone,
        (true, None) => {
            // Already exited: the client still learns the exit code.
            let code = attachment.exit_code.unwrap_or(-1);
            if peer.send_message(&ServerMessage::Exit { code }).await {
                Ending::Close(CLOSE_NORMAL, "session exited")
            } else {
                Ending::Gone
            }
        }
        (true, Some(subscription)) => {
            tracing::info!(session_id = %session_id, client_id = %client_id, "Viewer connected");
            pump(&state, &session, subscription, &mut peer, receiver).await
        }
    };

    if let Ending::Close(code, reason) = ending {
        peer.close(code, reason).await;
    }

    if let Some(stats) = session.detach(&client_id).await {
        tracing::info!(
            session_id = %session_id,
            client_id = %client_id,
            messages_sent = stats.messages_sent,
            bytes_sent = stats.bytes_sent,
            ending = ?ending,
            "Viewer disconnected"
        );
    } else {
        tracing::info!(session_id = %session_id, client_id = %client_id, ending = ?ending, "Viewer disconnected");
    }
}

/// Moves data both ways until either side ends the connection.
async fn pump(
    state: &AppState,
    session: &Arc<Session>,
    mut subscription: ClientSubscription,
    peer: &mut Peer,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
) -> Ending {
    let mut heartbeat = Heartbeat::new();
    let mut ticker = heartbeat::interval(state.heartbeat_interval);

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                return Ending::Close(CLOSE_GOING_AWAY, "daemon shutting down");
            }

            _ = subscription.evicted.cancelled() => {
                let notice = ServerMessage::Error {
                    message: "client too slow".to_string(),
                };
                if !peer.send_message(&notice).await {
                    return Ending::Gone;
                }
                return Ending::Close(CLOSE_CLIENT_TOO_SLOW, "client too slow");
            }

            item = subscription.rx.recv() => {
                let sent = match item {
                    Some(Outbound::Output(data)) => peer.send(Message::Binary(data.to_vec())).await,
                    Some(Outbound::Message(message)) => peer.send_message(&message).await,
                    None => return Ending::Close(CLOSE_NORMAL, "session exited"),
                };
                if !sent {
                    return Ending::Gone;
                }
            }

            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else {
                    return Ending::Gone;
                };
                heartbeat.record_activity();
                match frame {
                    Message::Text(text) => handle_text(session, &mut heartbeat, &text).await,
                    Message::Binary(data) => {
                        if let Err(e) = session.write(&data).await {
                            tracing::warn!(session_id = %session.id(), error = %e, "Failed to write input");
                        }
                    }
                    Message::Pong(_) => heartbeat.record_pong(Instant::now()),
                    Message::Ping(_) => {}
                    Message::Close(_) => return Ending::Gone,
                }
            }

            _ = ticker.tick() => {
                match heartbeat.on_tick() {
                    HeartbeatAction::Probe { timestamp } => {
                        let probed = peer
                            .send(Message::Ping(timestamp.to_be_bytes().to_vec()))
                            .await
                            && peer.send_message(&ServerMessage::Ping { timestamp }).await;
                        if !probed {
                            return Ending::Gone;
                        }
                    }
                    HeartbeatAction::Evict => {
                        tracing::info!(
                            session_id = %session.id(),
                            client_id = %subscription.client_id,
                            "Viewer missed heartbeat"
                        );
                        return Ending::Close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                    }
                }
            }
        }
    }
}

async fn handle_text(session: &Session, heartbeat: &mut Heartbeat, text: &str) {
    match ClientMessage::parse(text) {
        Ok(Some(ClientMessage::Input { data })) => {
            if let Err(e) = session.write(data.as_bytes()).await {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to write input");
            }
        }
        Ok(Some(ClientMessage::Resize { cols, rows })) => {
            if let Err(e) = session.resize(cols, rows).await {
                tracing::debug!(session_id = %session.id(), error = %e, "Ignored resize");
            }
        }
        Ok(Some(ClientMessage::Pong { .. })) => heartbeat.record_pong(Instant::now()),
        Ok(None) => {
            tracing::trace!(session_id = %session.id(), "Ignored unknown message type");
        }
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "Dropped malformed message");
        }
    }
}
