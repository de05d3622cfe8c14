//! Bounded output history.
//!
//! Every session keeps the most recent output so that a client attaching
//! later can repaint its screen. The cap is a byte count; the oldest bytes
//! are evicted first.

use std::collections::VecDeque;

/// Default history cap (256 KiB).
pub const DEFAULT_HISTORY_LIMIT: usize = 256 * 1024;

/// Byte-capped FIFO of terminal output.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
}

impl HistoryBuffer {
    /// Creates an empty buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(DEFAULT_HISTORY_LIMIT)),
            limit,
        }
    }

    /// Appends a chunk, evicting the oldest bytes beyond the cap.
    ///
    /// A chunk larger than the cap replaces the whole buffer with its own
    /// tail.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.limit == 0 {
            return;
        }

        if chunk.len() >= self.limit {
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.limit..]);
            return;
        }

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(chunk);
    }

    /// Copies the retained output, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Configured cap in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
