//! Channel I/O
//!
//! Blocking and non-blocking reads and writes against one service's message
//! slots or ring. Each service owns a mutex + condition variable pair; the
//! notification path only bumps a wakeup counter and wakes everyone, and
//! blocked callers re-check availability under the lock. Checking under the
//! same lock the notifier takes means a wakeup can never slip in between the
//! check and the wait.

use crate::doorbell::Doorbell;
use crate::layout::{REGION_RX, REGION_TX, SLOT_HEADER_SIZE, slot_stride};
use crate::region::{RegionError, SharedRegion};
use crate::table::{Direction, Region, ServiceDescriptor};
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("service has no slots in this direction")]
    DirectionUnsupported,

    #[error("buffer of {got} bytes cannot hold a {needed}-byte message slot")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("message of {len} bytes exceeds the {max}-byte slot")]
    MessageTooLarge { len: usize, max: usize },

    #[error("operation would block")]
    WouldBlock,

    #[error("only {0} bytes were accepted")]
    ShortWrite(usize),

    #[error("coprocessor went offline")]
    Disconnected,

    #[error("wait was cancelled")]
    Interrupted,

    #[error("shared memory: {0}")]
    Region(#[from] RegionError),
}

/// Cancels blocking channel operations.
///
/// Cloning shares the token. Once cancelled it stays cancelled; any blocking
/// call waiting on it returns [`IoError::Interrupted`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Weak<ServiceChannel>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel and wake every channel a holder of this token is blocked on.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let watchers = std::mem::take(
            &mut *self
                .inner
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for channel in watchers.iter().filter_map(Weak::upgrade) {
            channel.notify();
        }
    }

    fn watch(&self, channel: &Arc<ServiceChannel>) {
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|w| w.strong_count() > 0);
        if !watchers.iter().any(|w| w.as_ptr() == Arc::as_ptr(channel)) {
            watchers.push(Arc::downgrade(channel));
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// How a call behaves when the channel has nothing to offer.
#[derive(Clone, Copy)]
enum Wait<'a> {
    NonBlocking,
    Blocking(Option<&'a CancelToken>),
}

struct WaitState {
    disconnected: bool,
    wakeups: u64,
}

/// Host side of one discovered service.
pub struct ServiceChannel {
    desc: ServiceDescriptor,
    bulk: Arc<SharedRegion>,
    doorbell: Arc<dyn Doorbell>,
    wait: Mutex<WaitState>,
    cond: Condvar,
}

impl ServiceChannel {
    pub fn new(desc: ServiceDescriptor, bulk: Arc<SharedRegion>, doorbell: Arc<dyn Doorbell>) -> Self {
        Self {
            desc,
            bulk,
            doorbell,
            wait: Mutex::new(WaitState {
                disconnected: false,
                wakeups: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.desc
    }

    pub fn index(&self) -> usize {
        self.desc.index
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    fn lock_wait(&self) -> MutexGuard<'_, WaitState> {
        self.wait.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Data or space may have changed: wake every waiter so it re-checks.
    pub fn notify(&self) {
        let mut state = self.lock_wait();
        state.wakeups = state.wakeups.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Permanently fail this channel and wake every waiter.
    pub fn disconnect(&self) {
        let mut state = self.lock_wait();
        state.disconnected = true;
        self.cond.notify_all();
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock_wait().disconnected
    }

    /// Number of notifications delivered so far.
    pub fn wakeups(&self) -> u64 {
        self.lock_wait().wakeups
    }

    // ========== COUNTERS ==========

    fn load_counter(&self, region: &Region, field: u64) -> Result<u32, IoError> {
        let value = self.bulk.load_32(region.desc_offset + field)?;
        // Pairs with the producer's release before it bumped the counter.
        fence(Ordering::Acquire);
        Ok(value)
    }

    fn store_counter(&self, region: &Region, field: u64, value: u32) -> Result<(), IoError> {
        // Data must be visible before the counter that publishes it.
        fence(Ordering::Release);
        self.bulk.store_32(region.desc_offset + field, value)?;
        Ok(())
    }

    /// Live `(tx, rx)` counters of one direction.
    pub fn counters(&self, dir: Direction) -> Result<(u32, u32), IoError> {
        let region = self.desc.region(dir);
        Ok((
            self.load_counter(region, REGION_TX)?,
            self.load_counter(region, REGION_RX)?,
        ))
    }

    /// Messages (or ring bytes) waiting to be read.
    pub fn readable(&self) -> Result<u32, IoError> {
        let up = &self.desc.up;
        if !up.is_usable() {
            return Err(IoError::DirectionUnsupported);
        }
        let (tx, rx) = self.counters(Direction::Up)?;
        let pending = tx.wrapping_sub(rx);
        Ok(if up.is_ring {
            pending.min(up.slot_size)
        } else {
            pending.min(up.slots)
        })
    }

    /// Free slots (or ring bytes) available for writing.
    pub fn writable(&self) -> Result<u32, IoError> {
        let down = &self.desc.down;
        if !down.is_usable() {
            return Err(IoError::DirectionUnsupported);
        }
        let (tx, rx) = self.counters(Direction::Down)?;
        let used = tx.wrapping_sub(rx);
        Ok(if down.is_ring {
            down.slot_size.saturating_sub(used)
        } else {
            down.slots.saturating_sub(used)
        })
    }

    /// Discard everything the coprocessor has produced but the host has not
    /// read. Returns the number of messages or bytes dropped.
    pub fn flush_read(&self) -> Result<u32, IoError> {
        let up = &self.desc.up;
        if !up.is_usable() {
            return Err(IoError::DirectionUnsupported);
        }
        let state = self.lock_wait();
        if state.disconnected {
            return Err(IoError::Disconnected);
        }
        let tx = self.load_counter(up, REGION_TX)?;
        let rx = self.load_counter(up, REGION_RX)?;
        self.store_counter(up, REGION_RX, tx)?;
        let dropped = tx.wrapping_sub(rx);
        log::debug!("{}: flushed {} pending", self.desc.name, dropped);
        Ok(dropped)
    }

    // ========== TRANSFER PRIMITIVES (called with the wait lock held) ==========

    fn try_read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let up = &self.desc.up;
        let tx = self.load_counter(up, REGION_TX)?;
        let mut rx = self.load_counter(up, REGION_RX)?;
        let pending = tx.wrapping_sub(rx);
        if pending == 0 {
            return Err(IoError::WouldBlock);
        }

        if up.is_ring {
            let size = up.slot_size;
            if pending > size {
                log::warn!(
                    "{}: producer overran ring by {} bytes",
                    self.desc.name,
                    pending - size
                );
                rx = tx.wrapping_sub(size);
            }
            let n = (tx.wrapping_sub(rx) as usize).min(buf.len());
            self.ring_copy_out(up, rx, &mut buf[..n])?;
            self.store_counter(up, REGION_RX, rx.wrapping_add(n as u32))?;
            return Ok(n);
        }

        let slot = (rx % up.slots) as u64;
        let slot_off = up.offset as u64 + slot * slot_stride(up.slot_size);
        let mut header = [0u8; SLOT_HEADER_SIZE];
        self.bulk.read_bytes(slot_off, &mut header)?;
        let mut len = u32::from_le_bytes(header) as usize;
        if len > up.slot_size as usize {
            log::warn!(
                "{}: message length {} exceeds slot size {}, truncating",
                self.desc.name,
                len,
                up.slot_size
            );
            len = up.slot_size as usize;
        }
        self.bulk
            .read_bytes(slot_off + SLOT_HEADER_SIZE as u64, &mut buf[..len])?;
        self.store_counter(up, REGION_RX, rx.wrapping_add(1))?;
        Ok(len)
    }

    fn try_write(&self, buf: &[u8]) -> Result<usize, IoError> {
        let down = &self.desc.down;
        let tx = self.load_counter(down, REGION_TX)?;
        let rx = self.load_counter(down, REGION_RX)?;
        let used = tx.wrapping_sub(rx);

        if down.is_ring {
            let space = down.slot_size.saturating_sub(used) as usize;
            if space == 0 {
                return Err(IoError::WouldBlock);
            }
            let n = space.min(buf.len());
            self.ring_copy_in(down, tx, &buf[..n])?;
            self.store_counter(down, REGION_TX, tx.wrapping_add(n as u32))?;
            return Ok(n);
        }

        if used >= down.slots {
            return Err(IoError::WouldBlock);
        }
        let slot = (tx % down.slots) as u64;
        let slot_off = down.offset as u64 + slot * slot_stride(down.slot_size);
        self.bulk
            .write_bytes(slot_off, &(buf.len() as u32).to_le_bytes())?;
        self.bulk.write_bytes(slot_off + SLOT_HEADER_SIZE as u64, buf)?;
        self.store_counter(down, REGION_TX, tx.wrapping_add(1))?;
        Ok(buf.len())
    }

    fn ring_copy_out(&self, region: &Region, counter: u32, out: &mut [u8]) -> Result<(), IoError> {
        let size = region.slot_size as usize;
        let start = counter as usize % size;
        let first = out.len().min(size - start);
        let base = region.offset as u64;
        self.bulk.read_bytes(base + start as u64, &mut out[..first])?;
        self.bulk.read_bytes(base, &mut out[first..])?;
        Ok(())
    }

    fn ring_copy_in(&self, region: &Region, counter: u32, data: &[u8]) -> Result<(), IoError> {
        let size = region.slot_size as usize;
        let start = counter as usize % size;
        let first = data.len().min(size - start);
        let base = region.offset as u64;
        self.bulk.write_bytes(base + start as u64, &data[..first])?;
        self.bulk.write_bytes(base, &data[first..])?;
        Ok(())
    }

    // ========== PUBLIC I/O ==========

    fn wait_for<T>(
        self: &Arc<Self>,
        wait: Wait<'_>,
        mut op: impl FnMut() -> Result<T, IoError>,
    ) -> Result<T, IoError> {
        if let Wait::Blocking(Some(token)) = wait {
            token.watch(self);
        }
        let mut state = self.lock_wait();
        loop {
            if state.disconnected {
                return Err(IoError::Disconnected);
            }
            match (op(), wait) {
                (Err(IoError::WouldBlock), Wait::Blocking(cancel)) => {
                    if cancel.is_some_and(CancelToken::is_cancelled) {
                        return Err(IoError::Interrupted);
                    }
                }
                (result, _) => return result,
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn read_with(self: &Arc<Self>, buf: &mut [u8], wait: Wait<'_>) -> Result<usize, IoError> {
        let up = &self.desc.up;
        if !up.is_usable() {
            return Err(IoError::DirectionUnsupported);
        }
        if !up.is_ring && buf.len() < up.slot_size as usize {
            return Err(IoError::BufferTooSmall {
                needed: up.slot_size as usize,
                got: buf.len(),
            });
        }
        let n = self.wait_for(wait, || self.try_read(buf))?;
        log::trace!("{}: read {} bytes", self.desc.name, n);
        Ok(n)
    }

    fn write_with(self: &Arc<Self>, buf: &[u8], wait: Wait<'_>) -> Result<usize, IoError> {
        let down = &self.desc.down;
        if !down.is_usable() {
            return Err(IoError::DirectionUnsupported);
        }
        if !down.is_ring && buf.len() > down.slot_size as usize {
            return Err(IoError::MessageTooLarge {
                len: buf.len(),
                max: down.slot_size as usize,
            });
        }
        let n = self.wait_for(wait, || self.try_write(buf))?;
        self.doorbell.ring(self.desc.index);
        log::trace!("{}: wrote {} of {} bytes", self.desc.name, n, buf.len());
        if n < buf.len() {
            return Err(IoError::ShortWrite(n));
        }
        Ok(n)
    }

    /// Read one message (or as many ring bytes as fit in `buf`).
    pub fn read(self: &Arc<Self>, buf: &mut [u8], block: bool) -> Result<usize, IoError> {
        let wait = if block { Wait::Blocking(None) } else { Wait::NonBlocking };
        self.read_with(buf, wait)
    }

    /// Blocking read that returns [`IoError::Interrupted`] once `cancel` fires.
    pub fn read_cancellable(
        self: &Arc<Self>,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, IoError> {
        self.read_with(buf, Wait::Blocking(Some(cancel)))
    }

    /// Write one message (or as many ring bytes as there is space for).
    pub fn write(self: &Arc<Self>, buf: &[u8], block: bool) -> Result<usize, IoError> {
        let wait = if block { Wait::Blocking(None) } else { Wait::NonBlocking };
        self.write_with(buf, wait)
    }

    /// Blocking write that returns [`IoError::Interrupted`] once `cancel` fires.
    pub fn write_cancellable(
        self: &Arc<Self>,
        buf: &[u8],
        cancel: &CancelToken,
    ) -> Result<usize, IoError> {
        self.write_with(buf, Wait::Blocking(Some(cancel)))
    }
}
