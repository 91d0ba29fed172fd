//! Ring position tracking for streaming consumers.
//!
//! The coprocessor exposes a free-running 32-bit byte counter. Consumers
//! need a monotonic position, so every wraparound of the raw counter is
//! counted and folded back in as the high word of a 64-bit total.

use serde::{Deserialize, Serialize};

const WRAP: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Absolute counter value at open; the first reported position is 0.
    hw_ptr_base: u64,
    /// Absolute counter value at the last observation.
    prev_consumed: u64,
    overflow_count: u32,
    buffer_size: u64,
    last_position: u64,
}

impl StreamPosition {
    /// Start tracking at `raw`. `buffer_size` is the consumer's ring size in
    /// bytes; a size of 0 is treated as 1.
    pub fn open(raw: u32, buffer_size: u64) -> Self {
        Self {
            hw_ptr_base: raw as u64,
            prev_consumed: raw as u64,
            overflow_count: 0,
            buffer_size: buffer_size.max(1),
            last_position: 0,
        }
    }

    /// Restart at `raw`, keeping the buffer size.
    pub fn reopen(&mut self, raw: u32) {
        *self = Self::open(raw, self.buffer_size);
    }

    #[inline]
    fn prev_low32(&self) -> u32 {
        self.prev_consumed as u32
    }

    /// Fold in a new raw reading and return the position within the buffer.
    pub fn advance(&mut self, raw: u32) -> u64 {
        if raw == self.prev_low32() {
            return self.last_position;
        }
        if raw < self.prev_low32() {
            self.overflow_count = self.overflow_count.wrapping_add(1);
            log::trace!("stream counter wrapped ({} total)", self.overflow_count);
        }
        self.prev_consumed = raw as u64 + self.overflow_count as u64 * WRAP;
        self.last_position = self.prev_consumed.wrapping_sub(self.hw_ptr_base) % self.buffer_size;
        self.last_position
    }

    /// Like [`advance`](Self::advance) but `None` when the counter did not
    /// move, so callers can skip signalling a period that has not elapsed.
    pub fn poll(&mut self, raw: u32) -> Option<u64> {
        (raw != self.prev_low32()).then(|| self.advance(raw))
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    /// Bytes consumed since open.
    pub fn consumed_bytes(&self) -> u64 {
        self.prev_consumed.wrapping_sub(self.hw_ptr_base)
    }

    pub fn position(&self) -> u64 {
        self.last_position
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }
}
