//! Per-connection receive buffer
//!
//! A growing byte buffer with a valid-length cursor separate from its
//! allocated capacity. Incoming TCP segments are appended at the cursor;
//! after the frame loop consumes a prefix, `compact` shifts the remainder
//! to the front. Capacity only ever grows, so steady-state traffic
//! allocates nothing.

/// Starting capacity; covers the handshake and typical frames outright.
const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct ConnBuffer {
    data: Vec<u8>,
    len: usize,
}

impl Default for ConnBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; INITIAL_CAPACITY],
            len: 0,
        }
    }

    /// The valid bytes received so far and not yet consumed.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Appends incoming bytes after the valid region, growing to
    /// `max(2 × capacity, needed)` when they do not fit.
    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.len + bytes.len();
        if needed > self.data.len() {
            let new_capacity = (self.data.len() * 2).max(needed);
            self.data.resize(new_capacity, 0);
        }
        self.data[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
    }

    /// Discards the first `consumed` valid bytes, shifting the tail to
    /// offset zero. Consuming everything (or more) just resets the
    /// cursor without copying.
    pub fn compact(&mut self, consumed: usize) {
        if consumed >= self.len {
            self.len = 0;
            return;
        }
        self.data.copy_within(consumed..self.len, 0);
        self.len -= consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty_at_initial_capacity() {
        let buf = ConnBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn test_append_then_compact_preserves_tail() {
        let mut buf = ConnBuffer::new();
        buf.append(b"abcdefgh");
        buf.compact(3);
        assert_eq!(buf.as_slice(), b"defgh");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_compact_everything_resets_cursor() {
        let mut buf = ConnBuffer::new();
        buf.append(b"abc");
        buf.compact(3);
        assert!(buf.is_empty());
        buf.append(b"xy");
        assert_eq!(buf.as_slice(), b"xy");
    }

    #[test]
    fn test_compact_past_end_is_safe() {
        let mut buf = ConnBuffer::new();
        buf.append(b"abc");
        buf.compact(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_growth_doubles_and_keeps_prefix() {
        let mut buf = ConnBuffer::new();
        let first = vec![7u8; 3000];
        let second = vec![9u8; 3000];
        buf.append(&first);
        buf.append(&second);
        assert_eq!(buf.capacity(), INITIAL_CAPACITY * 2);
        assert_eq!(&buf.as_slice()[..3000], first.as_slice());
        assert_eq!(&buf.as_slice()[3000..], second.as_slice());
    }

    #[test]
    fn test_growth_jumps_straight_to_needed_size() {
        let mut buf = ConnBuffer::new();
        let big = vec![1u8; 20_000];
        buf.append(&big);
        assert_eq!(buf.capacity(), 20_000);
        assert_eq!(buf.as_slice(), big.as_slice());
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let mut buf = ConnBuffer::new();
        buf.append(&vec![0u8; 10_000]);
        let grown = buf.capacity();
        buf.compact(10_000);
        assert_eq!(buf.capacity(), grown);
    }

    #[test]
    fn test_steady_state_append_compact_cycle() {
        let mut buf = ConnBuffer::new();
        for round in 0..100u32 {
            let chunk = round.to_be_bytes();
            buf.append(&chunk);
            assert_eq!(buf.as_slice(), chunk);
            buf.compact(chunk.len());
        }
        assert_eq!(buf.capacity(), INITIAL_CAPACITY);
    }
}
