use std::sync::atomic::{AtomicU64, Ordering};

/// Outbound notification to the coprocessor.
///
/// Rung after every successful write so the coprocessor re-reads the
/// service's counters. The doorbell carries no data of its own.
pub trait Doorbell: Send + Sync {
    fn ring(&self, service_index: usize);
}

/// Mailbox-style doorbell: one pending bit per service plus a ring counter.
///
/// Bits are set by the host and consumed by the coprocessor side (the
/// simulator, or a platform shim forwarding them to a hardware mailbox).
/// Services with an index of 64 or more only bump the counter.
pub struct Mailbox {
    pending: AtomicU64,
    rings: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            rings: AtomicU64::new(0),
        }
    }

    /// Pending bits without clearing them.
    #[inline]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Atomically fetch and clear the pending bits.
    pub fn take_pending(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Total number of rings since creation.
    pub fn rings(&self) -> u64 {
        self.rings.load(Ordering::Relaxed)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Doorbell for Mailbox {
    fn ring(&self, service_index: usize) {
        if service_index < 64 {
            // Release: data written before the ring is visible to whoever
            // observes the bit.
            self.pending
                .fetch_or(1u64 << service_index, Ordering::Release);
        }
        self.rings.fetch_add(1, Ordering::Relaxed);
        log::trace!("doorbell: service {}", service_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_sets_pending_bit() {
        let mailbox = Mailbox::new();
        mailbox.ring(0);
        mailbox.ring(5);
        mailbox.ring(5);
        assert_eq!(mailbox.pending(), 0b10_0001);
        assert_eq!(mailbox.rings(), 3);
        assert_eq!(mailbox.take_pending(), 0b10_0001);
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn test_high_index_only_counts() {
        let mailbox = Mailbox::new();
        mailbox.ring(70);
        assert_eq!(mailbox.pending(), 0);
        assert_eq!(mailbox.rings(), 1);
    }
}
