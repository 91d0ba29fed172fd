//! Service Table discovery and validation.
//!
//! The coprocessor's table is untrusted input. It is parsed into owned
//! [`ServiceDescriptor`]s and validated all-or-nothing: one bad entry fails
//! the whole discovery and nothing is registered.

use crate::control::ControlBlock;
use crate::layout::*;
use crate::region::{RegionError, SharedRegion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("coprocessor control block is not valid")]
    NotOnline,

    #[error("service table is empty")]
    Empty,

    #[error("service entry size {0} is too small or not word-aligned")]
    BadEntrySize(u32),

    #[error("service table offset {0:#x} is not word-aligned")]
    MisalignedTable(u32),

    #[error("service entry {0} lies outside the bulk window")]
    OutOfBounds(usize),

    #[error("service entry {0} has no slots in either direction")]
    Unusable(usize),

    #[error("service entry {0} declares a ring with a slot count other than one")]
    BadRingConfig(usize),

    #[error("service entry {0} has a data area outside the bulk window")]
    RegionOutOfBounds(usize),

    #[error("service entry {0} has an empty, unterminated or unprintable name")]
    BadName(usize),

    #[error("service entries {0} and {1} share a name")]
    DuplicateName(usize, usize),
}

/// Transfer direction, named from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host (host reads).
    Up,
    /// Host to device (host writes).
    Down,
}

impl Direction {
    fn entry_offset(self) -> u64 {
        match self {
            Direction::Up => ENTRY_UP_REGION,
            Direction::Down => ENTRY_DOWN_REGION,
        }
    }
}

/// One directional region of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Bulk offset of the region's data area.
    pub offset: u32,
    pub slots: u32,
    pub slot_size: u32,
    pub tx_count: u32,
    pub rx_count: u32,
    pub is_ring: bool,
    /// Bulk offset of this region's descriptor (where the live counters are).
    pub desc_offset: u64,
}

impl Region {
    pub fn read_from(bulk: &SharedRegion, desc_offset: u64) -> Result<Self, RegionError> {
        let flags = bulk.load_32(desc_offset + REGION_FLAGS)?;
        Ok(Self {
            offset: bulk.load_32(desc_offset + REGION_OFFSET)?,
            slots: bulk.load_32(desc_offset + REGION_SLOTS)?,
            slot_size: bulk.load_32(desc_offset + REGION_SLOT_SIZE)?,
            tx_count: bulk.load_32(desc_offset + REGION_TX)?,
            rx_count: bulk.load_32(desc_offset + REGION_RX)?,
            is_ring: flags & REGION_FLAG_RING != 0,
            desc_offset,
        })
    }

    /// Write this region's descriptor at `desc_offset` (coprocessor side).
    pub fn write_to(&self, bulk: &SharedRegion, desc_offset: u64) -> Result<(), RegionError> {
        let flags = if self.is_ring { REGION_FLAG_RING } else { 0 };
        bulk.store_32(desc_offset + REGION_OFFSET, self.offset)?;
        bulk.store_32(desc_offset + REGION_SLOTS, self.slots)?;
        bulk.store_32(desc_offset + REGION_SLOT_SIZE, self.slot_size)?;
        bulk.store_32(desc_offset + REGION_TX, self.tx_count)?;
        bulk.store_32(desc_offset + REGION_RX, self.rx_count)?;
        bulk.store_32(desc_offset + REGION_FLAGS, flags)
    }

    /// True when the direction carries data at all.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.slots > 0
    }

    /// Size of the data area in bytes; `None` when the declared geometry
    /// overflows.
    pub fn data_size(&self) -> Option<u64> {
        data_area_size(self.slots, self.slot_size, self.is_ring)
    }
}

/// Validated, host-owned copy of one service table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub index: usize,
    pub name: String,
    pub up: Region,
    pub down: Region,
}

impl ServiceDescriptor {
    pub fn region(&self, dir: Direction) -> &Region {
        match dir {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Write this entry at `entry_offset` (coprocessor side).
    pub fn write_to(&self, bulk: &SharedRegion, entry_offset: u64) -> Result<(), RegionError> {
        let mut name = [0u8; SERVICE_NAME_LEN];
        let len = self.name.len().min(SERVICE_NAME_LEN);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        bulk.write_bytes(entry_offset, &name)?;
        self.up
            .write_to(bulk, entry_offset + Direction::Up.entry_offset())?;
        self.down
            .write_to(bulk, entry_offset + Direction::Down.entry_offset())
    }
}

struct RawEntry {
    name: [u8; SERVICE_NAME_LEN],
    up: Region,
    down: Region,
}

fn read_entry(bulk: &SharedRegion, entry_offset: u64) -> Result<RawEntry, RegionError> {
    let mut name = [0u8; SERVICE_NAME_LEN];
    bulk.read_bytes(entry_offset, &mut name)?;
    Ok(RawEntry {
        name,
        up: Region::read_from(bulk, entry_offset + Direction::Up.entry_offset())?,
        down: Region::read_from(bulk, entry_offset + Direction::Down.entry_offset())?,
    })
}

/// Length of a NUL-padded name, or `None` if it is empty, unterminated or
/// contains anything but printable ASCII.
fn name_len(raw: &[u8; SERVICE_NAME_LEN]) -> Option<usize> {
    let len = raw.iter().position(|&b| b == 0)?;
    if len == 0 {
        return None;
    }
    raw[..len]
        .iter()
        .all(|b| (0x20..=0x7e).contains(b))
        .then_some(len)
}

fn check_region(bulk: &SharedRegion, index: usize, region: &Region) -> Result<(), DiscoveryError> {
    if region.is_ring && (region.slots != 1 || region.slot_size == 0) {
        return Err(DiscoveryError::BadRingConfig(index));
    }
    if !region.is_usable() {
        return Ok(());
    }
    match region.data_size() {
        Some(size) if bulk.contains(region.offset as u64, size) => Ok(()),
        _ => Err(DiscoveryError::RegionOutOfBounds(index)),
    }
}

/// Walk and validate the service table described by `block`.
pub fn discover(
    bulk: &SharedRegion,
    block: &ControlBlock,
) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
    if !block.is_valid() {
        return Err(DiscoveryError::NotOnline);
    }
    if block.service_count == 0 {
        return Err(DiscoveryError::Empty);
    }
    let entry_size = block.service_entry_size;
    if (entry_size as usize) < MIN_SERVICE_ENTRY_SIZE || entry_size % 4 != 0 {
        return Err(DiscoveryError::BadEntrySize(entry_size));
    }
    if block.service_table_offset % 4 != 0 {
        return Err(DiscoveryError::MisalignedTable(block.service_table_offset));
    }

    let count = block.service_count as usize;
    let mut raw = Vec::with_capacity(count.min(256));
    for i in 0..count {
        let offset = service_entry_offset(
            block.service_table_offset as u64,
            entry_size as u64,
            i as u64,
        )
        .filter(|&off| bulk.contains(off, entry_size as u64))
        .ok_or(DiscoveryError::OutOfBounds(i))?;
        let entry = read_entry(bulk, offset).map_err(|_| DiscoveryError::OutOfBounds(i))?;

        if !entry.up.is_usable() && !entry.down.is_usable() {
            return Err(DiscoveryError::Unusable(i));
        }
        check_region(bulk, i, &entry.up)?;
        check_region(bulk, i, &entry.down)?;
        raw.push(entry);
    }

    let mut services: Vec<ServiceDescriptor> = Vec::with_capacity(raw.len());
    for (i, entry) in raw.into_iter().enumerate() {
        let len = name_len(&entry.name).ok_or(DiscoveryError::BadName(i))?;
        let name = String::from_utf8_lossy(&entry.name[..len]).into_owned();
        if let Some(prev) = services.iter().find(|s| s.name == name) {
            return Err(DiscoveryError::DuplicateName(prev.index, i));
        }
        services.push(ServiceDescriptor {
            index: i,
            name,
            up: entry.up,
            down: entry.down,
        });
    }

    log::debug!("service table: {} entries validated", services.len());
    Ok(services)
}
