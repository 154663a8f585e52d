//! Session output multiplexer.
//!
//! This module fans a session's output out to every attached client. Each
//! client has its own bounded channel fed with `try_send`, so one slow client
//! never holds up the others. A client whose channel fills up is evicted and
//! told so through its eviction token; it can reconnect and resync from
//! offsets instead of silently missing bytes.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::OutputObserver;

/// Unique identifier for a client.
pub type ClientId = String;

/// Default channel capacity for client output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An item queued for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw terminal output.
    Output(Bytes),
    /// A JSON control message.
    Message(ServerMessage),
}

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total items queued successfully.
    pub messages_sent: u64,
    /// Total output bytes queued.
    pub bytes_sent: u64,
    /// Whether the client was evicted for falling behind.
    pub evicted: bool,
}

/// The receiving side handed to whoever serves a client.
#[derive(Debug)]
pub struct ClientSubscription {
    /// Client identifier.
    pub client_id: ClientId,
    /// Queued output and control messages. Ends when the client is removed
    /// or the session exits.
    pub rx: mpsc::Receiver<Outbound>,
    /// Cancelled if the client is evicted for falling behind.
    pub evicted: CancellationToken,
}

enum SendOutcome {
    Sent,
    Full,
    Closed,
}

/// A handle representing a connected client that receives output.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Outbound>,
    evicted: CancellationToken,
    stats: ClientStats,
}

impl ClientHandle {
    /// Creates a new client handle with a specific channel capacity.
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, ClientSubscription) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evicted = CancellationToken::new();
        let handle = ClientHandle {
            id: id.clone(),
            tx,
            evicted: evicted.clone(),
            stats: ClientStats::default(),
        };
        let subscription = ClientSubscription {
            client_id: id,
            rx,
            evicted,
        };
        (handle, subscription)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns a clone of the current statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    fn try_send(&mut self, item: Outbound) -> SendOutcome {
        let len = match &item {
            Outbound::Output(data) => data.len() as u64,
            Outbound::Message(_) => 0,
        };
        match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += len;
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn evict(&mut self) {
        self.stats.evicted = true;
        self.evicted.cancel();
    }
}

/// Broadcasts a session's output to its attached clients.
///
/// The broadcaster lives inside the session state and is only touched under
/// the session lock, which keeps attach (snapshot, then subscribe) atomic
/// with respect to output.
pub struct SessionOutputBroadcaster {
    session_id: String,
    clients: HashMap<ClientId, ClientHandle>,
    capacity: usize,
}

impl SessionOutputBroadcaster {
    /// Creates a broadcaster whose clients get `capacity`-item channels.
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            clients: HashMap::new(),
            capacity,
        }
    }

    /// Registers a client.
    ///
    /// Registering an id that is already present replaces the previous
    /// registration; the old subscription's stream ends.
    pub fn add_client(&mut self, client_id: ClientId) -> ClientSubscription {
        let (handle, subscription) = ClientHandle::with_capacity(client_id.clone(), self.capacity);
        if self.clients.insert(client_id.clone(), handle).is_some() {
            tracing::debug!(
                session_id = %self.session_id,
                client_id = %client_id,
                "Replaced existing client registration"
            );
        } else {
            tracing::debug!(
                session_id = %self.session_id,
                client_id = %client_id,
                clients = self.clients.len(),
                "Added client to broadcaster"
            );
        }
        subscription
    }

    /// Removes a client. Returns its statistics if it was registered.
    pub fn remove_client(&mut self, client_id: &str) -> Option<ClientStats> {
        self.clients.remove(client_id).map(|h| h.stats())
    }

    /// Returns the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns statistics for a specific client.
    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.clients.get(client_id).map(|h| h.stats())
    }

    /// Sends output to every client. Returns how many accepted it.
    pub fn broadcast(&mut self, data: &Bytes) -> usize {
        self.fan_out(|| Outbound::Output(data.clone()))
    }

    /// Sends a control message to every client. Returns how many accepted it.
    pub fn send_message(&mut self, message: &ServerMessage) -> usize {
        self.fan_out(|| Outbound::Message(message.clone()))
    }

    /// Drops every client, ending their streams.
    pub fn close_all(&mut self) {
        self.clients.clear();
    }

    fn fan_out(&mut self, item: impl Fn() -> Outbound) -> usize {
        let mut gone = Vec::new();
        let mut delivered = 0;

        for (client_id, handle) in self.clients.iter_mut() {
            match handle.try_send(item()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Full => {
                    handle.evict();
                    tracing::warn!(
                        session_id = %self.session_id,
                        client_id = %client_id,
                        sent = handle.stats.messages_sent,
                        "Client fell behind, evicting"
                    );
                    gone.push(client_id.clone());
                }
                SendOutcome::Closed => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        client_id = %client_id,
                        "Client channel closed"
                    );
                    gone.push(client_id.clone());
                }
            }
        }

        for client_id in gone {
            self.clients.remove(&client_id);
        }

        delivered
    }
}

impl OutputObserver for SessionOutputBroadcaster {
    fn on_output(&mut self, chunk: &Bytes, _at: Instant) {
        self.broadcast(chunk);
    }

    fn on_exit(&mut self, code: i32) {
        let notified = self.send_message(&ServerMessage::Exit { code });
        tracing::debug!(
            session_id = %self.session_id,
            clients = notified,
            code = code,
            "Delivered exit notice"
        );
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_client_handle_creation() {
        let (handle, sub) = ClientHandle::with_capacity("client-1".to_string(), 4);
        assert_eq!(handle.id(), "client-1");
        assert_eq!(sub.client_id, "client-1");
        assert_eq!(handle.stats(), ClientStats::default());
        assert!(!sub.evicted.is_cancelled());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client_in_order() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 16);
        let mut subs: Vec<_> = (0..3)
            .map(|i| broadcaster.add_client(format!("client-{i}")))
            .collect();

        assert_eq!(broadcaster.broadcast(&chunk("one")), 3);
        assert_eq!(broadcaster.broadcast(&chunk("two")), 3);

        for sub in &mut subs {
            assert_eq!(sub.rx.recv().await, Some(Outbound::Output(chunk("one"))));
            assert_eq!(sub.rx.recv().await, Some(Outbound::Output(chunk("two"))));
        }
    }

    #[tokio::test]
    async fn test_slow_client_is_evicted_without_affecting_others() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 2);
        let slow = broadcaster.add_client("slow".to_string());
        let mut fast = broadcaster.add_client("fast".to_string());

        for _ in 0..2 {
            broadcaster.broadcast(&chunk("x"));
            assert!(fast.rx.recv().await.is_some());
        }
        // The slow client has not read anything; its channel is now full.
        assert_eq!(broadcaster.broadcast(&chunk("y")), 1);

        assert!(slow.evicted.is_cancelled());
        assert_eq!(broadcaster.client_count(), 1);
        assert_eq!(fast.rx.recv().await, Some(Outbound::Output(chunk("y"))));
    }

    #[test]
    fn test_closed_client_is_removed() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 4);
        let sub = broadcaster.add_client("gone".to_string());
        drop(sub);
        assert_eq!(broadcaster.broadcast(&chunk("x")), 0);
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[tokio::test]
    async fn test_re_adding_replaces_registration() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 4);
        let mut first = broadcaster.add_client("c".to_string());
        let mut second = broadcaster.add_client("c".to_string());
        assert_eq!(broadcaster.client_count(), 1);

        broadcaster.broadcast(&chunk("x"));
        assert_eq!(first.rx.recv().await, None);
        assert_eq!(second.rx.recv().await, Some(Outbound::Output(chunk("x"))));
    }

    #[tokio::test]
    async fn test_exit_is_delivered_once_then_stream_ends() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 4);
        let mut sub = broadcaster.add_client("c".to_string());

        broadcaster.on_exit(7);
        broadcaster.on_exit(7);

        assert_eq!(
            sub.rx.recv().await,
            Some(Outbound::Message(ServerMessage::Exit { code: 7 }))
        );
        assert_eq!(sub.rx.recv().await, None);
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn test_stats_track_bytes() {
        let mut broadcaster = SessionOutputBroadcaster::new("s1", 4);
        let _sub = broadcaster.add_client("c".to_string());
        broadcaster.broadcast(&chunk("hello"));
        broadcaster.send_message(&ServerMessage::Ping { timestamp: 1 });

        let stats = broadcaster.client_stats("c").unwrap();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 5);
        assert!(!stats.evicted);
        assert_eq!(broadcaster.remove_client("c"), Some(stats));
        assert_eq!(broadcaster.remove_client("c"), None);
    }
}
