//! Per-connection heartbeat.
//!
//! Every interval the gateway asks [`Heartbeat::on_tick`] what to do. The
//! first tick after any inbound traffic sends a probe (a WebSocket Ping frame
//! plus a `{"type":"ping"}` message, so that an intermediary stripping one
//! still lets the other through) and clears the liveness flag. Any inbound
//! frame sets it again. A tick that finds the flag still cleared evicts the
//! connection: that is how half-open connections, which never produce a
//! close event, get cleaned up.

use std::time::{Duration, Instant};

use tokio::time::{interval_at, Interval, MissedTickBehavior};

use crate::session::unix_millis;

/// Default probe interval, comfortably under common proxy idle timeouts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// What the gateway should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send both probe kinds carrying this timestamp.
    Probe {
        /// Unix milliseconds.
        timestamp: u64,
    },
    /// The client missed a whole interval; close and deregister it.
    Evict,
}

/// Liveness state of one connection.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    alive: bool,
    last_pong: Option<Instant>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// New connections start alive.
    pub fn new() -> Self {
        Self {
            alive: true,
            last_pong: None,
        }
    }

    /// Returns whether inbound traffic was seen since the last probe.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// When the last pong (of either kind) arrived.
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Called on every interval tick.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        if !self.alive {
            return HeartbeatAction::Evict;
        }
        self.alive = false;
        HeartbeatAction::Probe {
            timestamp: unix_millis(),
        }
    }

    /// Any inbound frame counts as a sign of life.
    pub fn record_activity(&mut self) {
        self.alive = true;
    }

    /// A transport-level or application-level pong arrived.
    pub fn record_pong(&mut self, at: Instant) {
        self.alive = true;
        self.last_pong = Some(at);
    }
}

/// Interval whose first tick fires one period from now.
pub fn interval(period: Duration) -> Interval {
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
