//! Bounded scrollback of session output.
//!
//! Keeps the most recent bytes the CLI printed so a terminal that attaches
//! later (first connect, page refresh, reconnect after a voice command) sees
//! what it missed instead of a blank screen.

use std::collections::VecDeque;

/// Fixed-capacity byte history; the oldest bytes fall off the front.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Bytes ever written, including ones since evicted.
    total_written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if self.capacity == 0 {
            return;
        }
        let data = &data[data.len().saturating_sub(self.capacity)..];
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    /// Everything held, oldest first.
    ///
    /// Once bytes have been evicted the front may start inside a UTF-8
    /// sequence; those orphaned continuation bytes are skipped.
    pub fn snapshot(&self) -> Vec<u8> {
        let skip = if self.has_wrapped() {
            self.buf
                .iter()
                .take(3)
                .take_while(|&&b| b & 0xC0 == 0x80)
                .count()
        } else {
            0
        };
        self.buf.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn has_wrapped(&self) -> bool {
        self.total_written > self.buf.len() as u64
    }
}
