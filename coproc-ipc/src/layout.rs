//! Shared Memory Layout
//!
//! This module defines the bit-exact layout of everything the host and the
//! coprocessor exchange through the shared windows. All fields are
//! little-endian `u32`.
//!
//! ## Bulk window
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Firmware image               @ firmware_load_offset          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Control Block (24B)          @ control_block_offset          │
//! │   - magic                    @ +0x00                         │
//! │   - fw_version               @ +0x04                         │
//! │   - hw_version               @ +0x08                         │
//! │   - service_count            @ +0x0C                         │
//! │   - service_table_offset     @ +0x10                         │
//! │   - service_entry_size       @ +0x14                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Service table                @ service_table_offset          │
//! │   entry[i] @ table + i * entry_size                          │
//! │     - name[32]               @ +0x00                         │
//! │     - Up region (24B)        @ +0x20                         │
//! │     - Down region (24B)      @ +0x38                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Service data areas           @ region.offset                 │
//! │   message: slots × (len u32 + slot_size bytes)               │
//! │   ring:    slot_size bytes, free-running byte counters       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fast window
//!
//! Offset 0 holds the two-word boot trampoline written by the loader.

// ============================================================================
// Control Block
// ============================================================================

/// Magic value the coprocessor writes once its IPC layer is up.
pub const CONTROL_MAGIC: u32 = 0x434F_4950;

pub const CB_MAGIC: u64 = 0x00;
pub const CB_FW_VERSION: u64 = 0x04;
pub const CB_HW_VERSION: u64 = 0x08;
pub const CB_SERVICE_COUNT: u64 = 0x0C;
pub const CB_SERVICE_TABLE_OFFSET: u64 = 0x10;
pub const CB_SERVICE_ENTRY_SIZE: u64 = 0x14;

/// Size of the control block in bytes.
pub const CONTROL_BLOCK_SIZE: usize = 0x18;

// ============================================================================
// Service descriptors
// ============================================================================

/// Width of the NUL-padded service name field.
pub const SERVICE_NAME_LEN: usize = 32;

/// Offset of the Up (device→host) region descriptor inside an entry.
pub const ENTRY_UP_REGION: u64 = SERVICE_NAME_LEN as u64;
/// Offset of the Down (host→device) region descriptor inside an entry.
pub const ENTRY_DOWN_REGION: u64 = ENTRY_UP_REGION + REGION_DESC_SIZE as u64;

/// Smallest legal `service_entry_size`.
pub const MIN_SERVICE_ENTRY_SIZE: usize = SERVICE_NAME_LEN + 2 * REGION_DESC_SIZE;

// Region descriptor field offsets (relative to the region descriptor)
pub const REGION_OFFSET: u64 = 0x00;
pub const REGION_SLOTS: u64 = 0x04;
pub const REGION_SLOT_SIZE: u64 = 0x08;
pub const REGION_TX: u64 = 0x0C;
pub const REGION_RX: u64 = 0x10;
pub const REGION_FLAGS: u64 = 0x14;

/// Size of one region descriptor in bytes.
pub const REGION_DESC_SIZE: usize = 0x18;

/// Region flag: the data area is a single circular byte buffer.
pub const REGION_FLAG_RING: u32 = 1 << 0;

/// Each message slot starts with a `u32` payload length.
pub const SLOT_HEADER_SIZE: usize = 4;

// ============================================================================
// Fast window
// ============================================================================

/// Offset of the boot trampoline in the fast window.
pub const TRAMPOLINE_OFFSET: u64 = 0;

/// `ldr pc, [pc, #-4]`: jump to the literal word that follows.
pub const TRAMPOLINE_JUMP: u32 = 0xE51F_F004;

/// Size of the trampoline (jump + literal).
pub const TRAMPOLINE_SIZE: usize = 8;

/// Byte offset of entry `index` in a service table.
pub const fn service_entry_offset(table_offset: u64, entry_size: u64, index: u64) -> Option<u64> {
    match index.checked_mul(entry_size) {
        Some(rel) => table_offset.checked_add(rel),
        None => None,
    }
}

/// Bytes occupied by one message slot of `slot_size` payload bytes.
pub const fn slot_stride(slot_size: u32) -> u64 {
    SLOT_HEADER_SIZE as u64 + slot_size as u64
}

/// Size of a region's data area, or `None` if it does not fit in a `u64`.
pub const fn data_area_size(slots: u32, slot_size: u32, ring: bool) -> Option<u64> {
    if ring {
        Some(slot_size as u64)
    } else {
        (slots as u64).checked_mul(slot_stride(slot_size))
    }
}
