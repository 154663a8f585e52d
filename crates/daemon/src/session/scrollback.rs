//! Bounded scrollback buffer.
//!
//! Every session keeps its most recent output in a [`ScrollbackBuffer`] so
//! that newly attached viewers can be replayed what they missed, and so that
//! polling viewers can catch up from a byte offset.
//!
//! Offsets count bytes since the session started. `end_offset` only ever
//! grows; `start_offset` advances as the oldest bytes are evicted.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::OutputObserver;

/// Result of reading a range of the scrollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollbackRead {
    /// Stream offset of the first byte in `data`.
    pub start_offset: u64,
    /// Stream offset just past the last byte in `data`.
    pub end_offset: u64,
    /// The bytes themselves.
    pub data: Bytes,
    /// The requested offset was not retained, so `data` starts later than asked.
    pub truncated: bool,
}

impl ScrollbackRead {
    /// Narrows the read to whole UTF-8 characters.
    ///
    /// Leading continuation bytes (left over from eviction or an offset that
    /// lands inside a character) are dropped and `start_offset` moves past
    /// them. With `hold_tail`, an unfinished sequence at the end is held
    /// back and `end_offset` points at its first byte, so the next read
    /// starts there and sees the whole character.
    pub fn align_to_chars(self, hold_tail: bool) -> Self {
        let head = orphan_continuations(&self.data);
        let rest = self.data.slice(head..);
        let tail = if hold_tail { unfinished_sequence(&rest) } else { 0 };
        Self {
            start_offset: self.start_offset + head as u64,
            end_offset: self.end_offset - tail as u64,
            data: rest.slice(..rest.len() - tail),
            truncated: self.truncated,
        }
    }
}

/// Number of continuation bytes at the start of `data` (at most three).
fn orphan_continuations(data: &[u8]) -> usize {
    data.iter()
        .take(3)
        .take_while(|&&b| is_continuation(b))
        .count()
}

/// Length of a started but unfinished UTF-8 sequence at the end of `data`.
fn unfinished_sequence(data: &[u8]) -> usize {
    for back in 1..=data.len().min(3) {
        let byte = data[data.len() - back];
        if is_continuation(byte) {
            continue;
        }
        let needed = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Byte-bounded FIFO of output chunks.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<Bytes>,
    capacity: usize,
    len: usize,
    start_offset: u64,
    end_offset: u64,
}

impl ScrollbackBuffer {
    /// Creates an empty buffer that retains at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity: capacity.max(1),
            len: 0,
            start_offset: 0,
            end_offset: 0,
        }
    }

    /// Maximum retained bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently retained bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the oldest retained byte.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Total number of bytes ever appended.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Appends a chunk, evicting the oldest bytes past the ceiling.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        self.end_offset += chunk.len() as u64;

        // A chunk at least as large as the whole buffer replaces everything.
        if chunk.len() >= self.capacity {
            self.chunks.clear();
            let tail = chunk.slice(chunk.len() - self.capacity..);
            self.len = tail.len();
            self.start_offset = self.end_offset - self.len as u64;
            self.chunks.push_back(tail);
            return;
        }

        self.len += chunk.len();
        self.chunks.push_back(chunk);

        while self.len > self.capacity {
            let excess = self.len - self.capacity;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                let dropped = front.len();
                self.chunks.pop_front();
                self.len -= dropped;
                self.start_offset += dropped as u64;
            } else {
                *front = front.slice(excess..);
                self.len -= excess;
                self.start_offset += excess as u64;
            }
        }
    }

    /// Returns everything retained, flagged as truncated if anything was evicted.
    pub fn snapshot(&self) -> ScrollbackRead {
        self.read_from(0)
    }

    /// Returns the retained bytes from `offset` onward.
    ///
    /// If `offset` predates the oldest retained byte, or lies beyond the end
    /// of the stream, the whole buffer is returned with `truncated` set.
    pub fn read_from(&self, offset: u64) -> ScrollbackRead {
        let truncated = offset < self.start_offset || offset > self.end_offset;
        let from = if truncated { self.start_offset } else { offset };

        let mut skip = (from - self.start_offset) as usize;
        let mut data = BytesMut::with_capacity(self.len - skip);
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            data.extend_from_slice(&chunk[skip..]);
            skip = 0;
        }

        ScrollbackRead {
            start_offset: from,
            end_offset: self.end_offset,
            data: data.freeze(),
            truncated,
        }
    }
}

impl OutputObserver for ScrollbackBuffer {
    fn on_output(&mut self, chunk: &Bytes, _at: Instant) {
        self.append(chunk.clone());
    }

    fn on_exit(&mut self, _code: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(capacity: usize, chunks: &[&str]) -> ScrollbackBuffer {
        let mut buffer = ScrollbackBuffer::new(capacity);
        for chunk in chunks {
            buffer.append(Bytes::copy_from_slice(chunk.as_bytes()));
        }
        buffer
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ScrollbackBuffer::new(16);
        assert!(buffer.is_empty());
        let snap = buffer.snapshot();
        assert_eq!(snap.start_offset, 0);
        assert_eq!(snap.end_offset, 0);
        assert!(snap.data.is_empty());
        assert!(!snap.truncated);
    }

    #[test]
    fn test_append_advances_offsets() {
        let buffer = buffer_with(64, &["hello ", "world"]);
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.start_offset(), 0);
        assert_eq!(buffer.end_offset(), 11);
        assert_eq!(&buffer.snapshot().data[..], b"hello world");
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut buffer = buffer_with(8, &["abc"]);
        buffer.append(Bytes::new());
        assert_eq!(buffer.end_offset(), 3);
    }

    #[test]
    fn test_eviction_is_fifo_and_byte_exact() {
        let buffer = buffer_with(8, &["aaaa", "bbbb", "cc"]);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.start_offset(), 2);
        assert_eq!(buffer.end_offset(), 10);

        let snap = buffer.snapshot();
        assert_eq!(&snap.data[..], b"aabbbbcc");
        assert!(snap.truncated);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let buffer = buffer_with(4, &["xy", "0123456789"]);
        assert_eq!(buffer.start_offset(), 8);
        assert_eq!(buffer.end_offset(), 12);
        assert_eq!(&buffer.snapshot().data[..], b"6789");
    }

    #[test]
    fn test_read_from_middle_of_chunk() {
        let buffer = buffer_with(64, &["abc", "def", "ghi"]);
        let read = buffer.read_from(4);
        assert_eq!(read.start_offset, 4);
        assert_eq!(read.end_offset, 9);
        assert_eq!(&read.data[..], b"efghi");
        assert!(!read.truncated);
    }

    #[test]
    fn test_read_from_end_is_empty() {
        let buffer = buffer_with(64, &["abc"]);
        let read = buffer.read_from(3);
        assert!(read.data.is_empty());
        assert!(!read.truncated);
        assert_eq!(read.start_offset, 3);
    }

    #[test]
    fn test_read_from_evicted_offset_flags_truncation() {
        let buffer = buffer_with(4, &["abcd", "efgh"]);
        let read = buffer.read_from(1);
        assert!(read.truncated);
        assert_eq!(read.start_offset, 4);
        assert_eq!(&read.data[..], b"efgh");
    }

    #[test]
    fn test_read_from_future_offset_flags_truncation() {
        let buffer = buffer_with(64, &["abc"]);
        let read = buffer.read_from(100);
        assert!(read.truncated);
        assert_eq!(read.start_offset, 0);
        assert_eq!(&read.data[..], b"abc");
    }

    #[test]
    fn test_read_then_later_chunks_reconstruct_stream() {
        let mut buffer = buffer_with(64, &["one ", "two "]);
        let read = buffer.read_from(2);
        buffer.append(Bytes::from_static(b"three"));

        let later = buffer.read_from(read.end_offset);
        let mut stream = read.data.to_vec();
        stream.extend_from_slice(&later.data);
        assert_eq!(stream, b"e two three");
    }

    #[test]
    fn test_align_holds_split_character_until_complete() {
        // U+20AC is E2 82 AC.
        let mut buffer = ScrollbackBuffer::new(64);
        buffer.append(Bytes::from_static(b"price: \xE2\x82"));

        let first = buffer.read_from(0).align_to_chars(true);
        assert_eq!(&first.data[..], b"price: ");
        assert_eq!(first.end_offset, 7);

        buffer.append(Bytes::from_static(b"\xAC!"));
        let second = buffer.read_from(first.end_offset).align_to_chars(true);
        assert_eq!(second.start_offset, 7);
        assert_eq!(second.end_offset, 11);

        let mut text = String::from_utf8(first.data.to_vec()).unwrap();
        text.push_str(std::str::from_utf8(&second.data).unwrap());
        assert_eq!(text, "price: \u{20AC}!");
    }

    #[test]
    fn test_align_skips_orphans_left_by_eviction() {
        let mut buffer = ScrollbackBuffer::new(4);
        buffer.append(Bytes::from_static("a\u{20AC}bc".as_bytes()));
        // Eviction cut into the euro sign: 82 AC 62 63 remain.
        assert_eq!(buffer.start_offset(), 2);

        let read = buffer.read_from(0).align_to_chars(true);
        assert!(read.truncated);
        assert_eq!(read.start_offset, 4);
        assert_eq!(read.end_offset, 6);
        assert_eq!(&read.data[..], b"bc");
    }

    #[test]
    fn test_align_releases_tail_when_not_holding() {
        let mut buffer = buffer_with(64, &["ok"]);
        buffer.append(Bytes::from_static(b"\xF0\x9F"));

        let held = buffer.read_from(0).align_to_chars(true);
        assert_eq!(held.end_offset, 2);

        let flushed = buffer.read_from(0).align_to_chars(false);
        assert_eq!(flushed.end_offset, 4);
        assert_eq!(flushed.data.len(), 4);
    }

    #[test]
    fn test_align_leaves_invalid_bytes_alone() {
        let mut buffer = ScrollbackBuffer::new(64);
        buffer.append(Bytes::from_static(b"x\xFF"));
        let read = buffer.read_from(0).align_to_chars(true);
        assert_eq!(read.end_offset, 2);
        assert_eq!(&read.data[..], b"x\xFF");
    }

    #[test]
    fn test_observer_appends() {
        let mut buffer = ScrollbackBuffer::new(16);
        buffer.on_output(&Bytes::from_static(b"hi\r\n"), Instant::now());
        buffer.on_exit(0);
        assert_eq!(&buffer.snapshot().data[..], b"hi\r\n");
    }
}
