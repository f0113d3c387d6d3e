//! Bounded scrollback ring for raw terminals
//!
//! Multiplexed terminals get their scrollback from the multiplexer on
//! demand. Raw terminals have no durability substrate, so the backend keeps
//! a small in-memory byte ring for them instead.

use std::collections::VecDeque;

/// Byte ring holding the most recent output
#[derive(Debug)]
pub struct ScrollbackRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ScrollbackRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    /// Append a chunk, dropping the oldest bytes past capacity
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            // Chunk alone fills the ring
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.cap..]);
            return;
        }

        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(chunk);
    }

    /// Copy of the current contents, oldest first
    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read_back() {
        let mut ring = ScrollbackRing::new(16);
        ring.push(b"hello ");
        ring.push(b"world");
        assert_eq!(ring.contents(), b"hello world");
    }

    #[test]
    fn test_drops_oldest_past_capacity() {
        let mut ring = ScrollbackRing::new(8);
        ring.push(b"abcdefgh");
        ring.push(b"ij");
        assert_eq!(ring.contents(), b"cdefghij");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut ring = ScrollbackRing::new(4);
        ring.push(b"0123456789");
        assert_eq!(ring.contents(), b"6789");
    }

    #[test]
    fn test_empty() {
        let ring = ScrollbackRing::new(8);
        assert!(ring.is_empty());
        assert!(ring.contents().is_empty());
    }
}
