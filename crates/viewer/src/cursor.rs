//! Stream offset bookkeeping across reconnects.
//!
//! Every attach replays scrollback starting at the `attached` message's
//! `offset`. After a reconnect that replay overlaps what the viewer has
//! already rendered; [`OffsetCursor`] trims the overlap, reports a gap when
//! the daemon no longer retains bytes the viewer never saw, and notices when
//! the stream has started over (a session re-created under the same name).

/// A discontinuity: bytes in `from..to` were evicted before the viewer saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// First missing offset.
    pub from: u64,
    /// First offset available again.
    pub to: u64,
}

/// How a new connection's replay relates to what the viewer already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The replay continues the stream, possibly overlapping it.
    Continuous,
    /// Bytes between what was seen and the replay were evicted.
    Gap(Gap),
    /// The stream is shorter than what was seen: it is a new stream.
    Restarted {
        /// Where the viewer was in the old stream.
        previous: u64,
    },
}

/// Tracks how far into a session's output stream the viewer has rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCursor {
    /// Offset just past the last byte handed to the viewer.
    seen: u64,
    /// Offset of the next byte the daemon will send on this connection.
    incoming: u64,
}

impl OffsetCursor {
    /// A cursor that has seen nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset just past the last byte handed to the viewer.
    pub fn position(&self) -> u64 {
        self.seen
    }

    /// Starts a new connection whose replay covers `start_offset..end_offset`.
    ///
    /// Offsets only grow within one stream, so an `end_offset` below what
    /// was already seen means the daemon is serving a different stream; the
    /// cursor then starts over and every replayed byte is delivered.
    pub fn begin_replay(&mut self, start_offset: u64, end_offset: u64) -> Replay {
        self.incoming = start_offset;
        if end_offset < self.seen {
            let previous = self.seen;
            self.seen = start_offset;
            return Replay::Restarted { previous };
        }
        if start_offset > self.seen {
            let gap = Gap {
                from: self.seen,
                to: start_offset,
            };
            self.seen = start_offset;
            return Replay::Gap(gap);
        }
        Replay::Continuous
    }

    /// Accepts one output frame, returning the part not seen before.
    pub fn accept<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let start = self.incoming;
        self.incoming += chunk.len() as u64;

        let skip = self.seen.saturating_sub(start).min(chunk.len() as u64) as usize;
        self.seen = self.seen.max(self.incoming);
        &chunk[skip..]
    }
}
