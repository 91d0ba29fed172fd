use std::cell::UnsafeCell;
use std::ptr::NonNull;
use thiserror::Error;

/// Shared-window access errors.
///
/// Higher layers map these into their own error families (firmware,
/// discovery, channel I/O) where appropriate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("out-of-bounds shared memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("misaligned shared memory access at {0:#x}")]
    Misaligned(u64),
}

/// One window of memory shared between the host and the coprocessor.
///
/// The transport owns two of these: a small fast window (used for the boot
/// trampoline) and a large bulk window (firmware image, control block,
/// service table and service data areas).
///
/// Offsets passed to the accessors are **byte offsets from the start of the
/// window**, never host or device addresses. Every access is bounds checked
/// through [`SharedRegion::translate`].
///
/// # Safety
///
/// The coprocessor writes its own counters concurrently with host reads, so
/// the backing store lives in an `UnsafeCell` and 32-bit accesses are
/// volatile. The host never writes a word the coprocessor owns, which is the
/// same single-writer-per-word rule real hardware relies on.
pub struct SharedRegion {
    name: &'static str,
    size: usize, // immutable after mapping
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: every word of the window has exactly one writer (host or
// coprocessor) and counter words are accessed with volatile 32-bit loads and
// stores. Bulk byte copies only touch data areas whose ownership is handed
// over through those counters.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map a new zero-initialised window of `size` bytes.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Name used in log output ("fast", "bulk").
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size of the window in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Checked offset translation.
    ///
    /// Returns `None` when `offset` lies at or past the end of the window.
    #[inline]
    pub fn translate(&self, offset: u64) -> Option<NonNull<u8>> {
        let off = usize::try_from(offset).ok()?;
        if off >= self.size {
            return None;
        }
        // SAFETY: `off` is inside the allocation, so the resulting pointer is
        // in bounds and non-null.
        unsafe {
            let base = (*self.data.get()).as_mut_ptr();
            NonNull::new(base.add(off))
        }
    }

    /// Returns true when `[offset, offset + len)` lies entirely in the window.
    #[inline]
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.size as u64,
            None => false,
        }
    }

    fn range_ptr(&self, offset: u64, len: usize) -> Result<NonNull<u8>, RegionError> {
        if len == 0 {
            if offset <= self.size as u64 {
                return Ok(NonNull::dangling());
            }
            return Err(RegionError::OutOfBounds(offset));
        }
        if !self.contains(offset, len as u64) {
            return Err(RegionError::OutOfBounds(offset));
        }
        self.translate(offset).ok_or(RegionError::OutOfBounds(offset))
    }

    // ========== WORD ACCESS ==========

    /// Volatile little-endian 32-bit load.
    #[inline]
    pub fn load_32(&self, offset: u64) -> Result<u32, RegionError> {
        if offset % 4 != 0 {
            return Err(RegionError::Misaligned(offset));
        }
        let ptr = self.range_ptr(offset, 4)?;
        // SAFETY: alignment and bounds checked above.
        let raw = unsafe { std::ptr::read_volatile(ptr.as_ptr() as *const u32) };
        Ok(u32::from_le(raw))
    }

    /// Volatile little-endian 32-bit store.
    #[inline]
    pub fn store_32(&self, offset: u64, value: u32) -> Result<(), RegionError> {
        if offset % 4 != 0 {
            return Err(RegionError::Misaligned(offset));
        }
        let ptr = self.range_ptr(offset, 4)?;
        // SAFETY: alignment and bounds checked above.
        unsafe { std::ptr::write_volatile(ptr.as_ptr() as *mut u32, value.to_le()) };
        Ok(())
    }

    // ========== BULK ACCESS ==========

    /// Copy `buf.len()` bytes out of the window starting at `offset`.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        let src = self.range_ptr(offset, buf.len())?;
        // SAFETY: bounds checked; `buf` is a distinct host allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the window starting at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), RegionError> {
        let dst = self.range_ptr(offset, data.len())?;
        // SAFETY: bounds checked; `data` is a distinct host allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    pub fn zero_range(&self, offset: u64, len: usize) -> Result<(), RegionError> {
        let dst = self.range_ptr(offset, len)?;
        // SAFETY: bounds checked
        unsafe {
            std::ptr::write_bytes(dst.as_ptr(), 0, len);
        }
        Ok(())
    }

    /// Read a range of bytes into a fresh vector.
    pub fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, RegionError> {
        let mut out = vec![0u8; len];
        self.read_bytes(offset, &mut out)?;
        Ok(out)
    }

    /// Copy of the whole window (for snapshots and digests).
    pub fn get_data(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        // SAFETY: whole-window copy, size is immutable.
        unsafe {
            std::ptr::copy_nonoverlapping((*self.data.get()).as_ptr(), out.as_mut_ptr(), self.size);
        }
        out
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
