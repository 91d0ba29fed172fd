//! Control Block Reader and Online State Machine
//!
//! The coprocessor publishes a fixed-layout control block once its IPC layer
//! is running. The host tracks the link through three states:
//!
//! ```text
//!   Offline ──load_and_boot──▶ Booting ──notify + magic──▶ Online
//!      ▲                                                     │
//!      └──────────────── teardown / crash ───────────────────┘
//! ```
//!
//! Only the host's *observed* copy of the block is ever cleared; the
//! coprocessor's memory is left alone.

use crate::layout::*;
use crate::region::{RegionError, SharedRegion};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

/// Host-side view of the coprocessor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No firmware running, or the link was torn down.
    Offline,
    /// Firmware loaded and reset released; waiting for the control block.
    Booting,
    /// Control block valid and services discovered.
    Online,
}

impl LinkState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => LinkState::Booting,
            2 => LinkState::Online,
            _ => LinkState::Offline,
        }
    }

    fn raw(self) -> u8 {
        match self {
            LinkState::Offline => 0,
            LinkState::Booting => 1,
            LinkState::Online => 2,
        }
    }
}

/// Fixed-layout record written by the coprocessor at bring-up.
///
/// Every field other than `magic` is meaningless unless
/// [`ControlBlock::is_valid`] returns true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBlock {
    pub magic: u32,
    pub fw_version: u32,
    pub hw_version: u32,
    pub service_count: u32,
    pub service_table_offset: u32,
    pub service_entry_size: u32,
}

impl ControlBlock {
    /// Read the block at `offset` of the bulk window.
    pub fn read_from(bulk: &SharedRegion, offset: u64) -> Result<Self, RegionError> {
        // Magic first: nothing else is worth reading without it.
        let magic = bulk.load_32(offset + CB_MAGIC)?;
        if magic != CONTROL_MAGIC {
            return Ok(Self {
                magic,
                ..Self::default()
            });
        }
        Ok(Self {
            magic,
            fw_version: bulk.load_32(offset + CB_FW_VERSION)?,
            hw_version: bulk.load_32(offset + CB_HW_VERSION)?,
            service_count: bulk.load_32(offset + CB_SERVICE_COUNT)?,
            service_table_offset: bulk.load_32(offset + CB_SERVICE_TABLE_OFFSET)?,
            service_entry_size: bulk.load_32(offset + CB_SERVICE_ENTRY_SIZE)?,
        })
    }

    /// Write the block at `offset` (coprocessor side; used by the simulator).
    pub fn write_to(&self, bulk: &SharedRegion, offset: u64) -> Result<(), RegionError> {
        // Magic last, so a reader never sees a valid magic over stale fields.
        bulk.store_32(offset + CB_FW_VERSION, self.fw_version)?;
        bulk.store_32(offset + CB_HW_VERSION, self.hw_version)?;
        bulk.store_32(offset + CB_SERVICE_COUNT, self.service_count)?;
        bulk.store_32(offset + CB_SERVICE_TABLE_OFFSET, self.service_table_offset)?;
        bulk.store_32(offset + CB_SERVICE_ENTRY_SIZE, self.service_entry_size)?;
        bulk.store_32(offset + CB_MAGIC, self.magic)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == CONTROL_MAGIC
    }
}

/// Tracks the link state and the last control block the host observed.
pub struct ControlMonitor {
    offset: u64,
    state: AtomicU8,
    observed: Mutex<ControlBlock>,
}

impl ControlMonitor {
    pub fn new(control_block_offset: u64) -> Self {
        Self {
            offset: control_block_offset,
            state: AtomicU8::new(LinkState::Offline.raw()),
            observed: Mutex::new(ControlBlock::default()),
        }
    }

    /// Current link state.
    #[inline]
    pub fn state(&self) -> LinkState {
        LinkState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// O(1), side-effect free.
    #[inline]
    pub fn is_online(&self) -> bool {
        self.state() == LinkState::Online
    }

    fn transition(&self, from: LinkState, to: LinkState) -> Result<(), LinkState> {
        self.state
            .compare_exchange(from.raw(), to.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| {
                log::info!("coprocessor link: {:?} -> {:?}", from, to);
            })
            .map_err(LinkState::from_raw)
    }

    /// `Offline -> Booting`. Returns the actual state on failure.
    pub fn begin_boot(&self) -> Result<(), LinkState> {
        self.transition(LinkState::Offline, LinkState::Booting)
    }

    /// `Booting -> Offline`, used when the reset sequence fails.
    pub fn abort_boot(&self) -> Result<(), LinkState> {
        self.transition(LinkState::Booting, LinkState::Offline)
    }

    /// `Booting -> Online`. Callers must have validated the table first.
    pub fn mark_online(&self) -> Result<(), LinkState> {
        self.transition(LinkState::Booting, LinkState::Online)
    }

    /// Re-read the control block and remember it as the observed copy.
    pub fn refresh(&self, bulk: &SharedRegion) -> Result<ControlBlock, RegionError> {
        let block = ControlBlock::read_from(bulk, self.offset)?;
        *self.observed.lock().unwrap_or_else(PoisonError::into_inner) = block;
        Ok(block)
    }

    /// Last observed control block.
    pub fn observed(&self) -> ControlBlock {
        *self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the observed block and report `Offline`.
    pub fn force_offline(&self) {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .magic = 0;
        let prev = LinkState::from_raw(self.state.swap(LinkState::Offline.raw(), Ordering::AcqRel));
        if prev != LinkState::Offline {
            log::info!("coprocessor link: {:?} -> Offline", prev);
        }
    }
}
