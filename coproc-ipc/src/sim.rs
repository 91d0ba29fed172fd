//! In-process coprocessor model
//!
//! Plays the device side of the shared-memory protocol: publishes a control
//! block and service table into the bulk window, produces into the
//! coprocessor-to-host direction, consumes from the host-to-coprocessor
//! direction, and can crash on request. Used by the tests and the CLI demo.

use crate::control::ControlBlock;
use crate::firmware::BootControl;
use crate::layout::{
    CONTROL_BLOCK_SIZE, CONTROL_MAGIC, ENTRY_DOWN_REGION, ENTRY_UP_REGION,
    MIN_SERVICE_ENTRY_SIZE, REGION_RX, REGION_TX, SLOT_HEADER_SIZE, slot_stride,
};
use crate::region::{RegionError, SharedRegion};
use crate::table::{Direction, Region, ServiceDescriptor};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("no simulated service named \"{0}\"")]
    UnknownService(String),

    #[error("service \"{0}\" has no message slots in that direction")]
    NotMessages(String),

    #[error("service \"{0}\" has no ring in that direction")]
    NotRing(String),

    #[error("message of {len} bytes exceeds the {max}-byte slot")]
    TooLarge { len: usize, max: usize },

    #[error("service layout does not fit in the bulk window")]
    OutOfSpace,

    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Shape of one direction of a simulated service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    None,
    Messages { slots: u32, slot_size: u32 },
    Ring { size: u32 },
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub up: RegionKind,
    pub down: RegionKind,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: RegionKind::None,
            down: RegionKind::None,
        }
    }

    pub fn up(mut self, kind: RegionKind) -> Self {
        self.up = kind;
        self
    }

    pub fn down(mut self, kind: RegionKind) -> Self {
        self.down = kind;
        self
    }
}

const ENTRY_SIZE: u32 = MIN_SERVICE_ENTRY_SIZE as u32;
const DATA_ALIGN: u64 = 64;

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

pub struct CoprocessorModel {
    bulk: Arc<SharedRegion>,
    control_offset: u64,
    services: Vec<ServiceDescriptor>,
}

impl CoprocessorModel {
    pub fn new(bulk: Arc<SharedRegion>, control_block_offset: u64) -> Self {
        Self {
            bulk,
            control_offset: control_block_offset,
            services: Vec::new(),
        }
    }

    /// Bulk offset of the service table the model lays out.
    pub fn table_offset(&self) -> u64 {
        align_up(self.control_offset + CONTROL_BLOCK_SIZE as u64, DATA_ALIGN)
    }

    /// Write the service table and zeroed data areas, without publishing a
    /// control block.
    pub fn layout(&mut self, specs: &[ServiceSpec]) -> Result<&[ServiceDescriptor], SimError> {
        let table = self.table_offset();
        let mut cursor = align_up(table + specs.len() as u64 * ENTRY_SIZE as u64, DATA_ALIGN);

        let mut place = |kind: RegionKind| -> Result<Region, SimError> {
            let (slots, slot_size, is_ring) = match kind {
                RegionKind::None => return Ok(Region::default()),
                RegionKind::Messages { slots, slot_size } => (slots, slot_size, false),
                RegionKind::Ring { size } => (1, size, true),
            };
            let region = Region {
                offset: u32::try_from(cursor).map_err(|_| SimError::OutOfSpace)?,
                slots,
                slot_size,
                is_ring,
                ..Region::default()
            };
            let size = region.data_size().ok_or(SimError::OutOfSpace)?;
            if !self.bulk.contains(cursor, size) {
                return Err(SimError::OutOfSpace);
            }
            self.bulk.zero_range(cursor, size as usize)?;
            cursor = align_up(cursor + size, DATA_ALIGN);
            Ok(region)
        };

        let mut services = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let up = place(spec.up)?;
            let down = place(spec.down)?;
            services.push(ServiceDescriptor {
                index,
                name: spec.name.clone(),
                up,
                down,
            });
        }
        for desc in &mut services {
            let entry = table + desc.index as u64 * ENTRY_SIZE as u64;
            desc.write_to(&self.bulk, entry)?;
            desc.up.desc_offset = entry + ENTRY_UP_REGION;
            desc.down.desc_offset = entry + ENTRY_DOWN_REGION;
        }
        self.services = services;
        Ok(&self.services)
    }

    /// Publish a control block describing the current table.
    pub fn publish(&self, fw_version: u32, hw_version: u32) -> Result<(), SimError> {
        let block = ControlBlock {
            magic: CONTROL_MAGIC,
            fw_version,
            hw_version,
            service_count: self.services.len() as u32,
            service_table_offset: self.table_offset() as u32,
            service_entry_size: ENTRY_SIZE,
        };
        self.write_control_block(&block)
    }

    /// Write an arbitrary control block (for malformed-table scenarios).
    pub fn write_control_block(&self, block: &ControlBlock) -> Result<(), SimError> {
        block.write_to(&self.bulk, self.control_offset)?;
        Ok(())
    }

    /// Lay out `specs` and publish the control block.
    pub fn bring_up(
        &mut self,
        fw_version: u32,
        hw_version: u32,
        specs: &[ServiceSpec],
    ) -> Result<(), SimError> {
        self.layout(specs)?;
        self.publish(fw_version, hw_version)?;
        log::debug!("sim: published {} services", specs.len());
        Ok(())
    }

    /// The coprocessor dies: its control block magic disappears.
    pub fn crash(&self) -> Result<(), SimError> {
        self.bulk.store_32(self.control_offset, 0)?;
        log::debug!("sim: crashed");
        Ok(())
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    fn service(&self, name: &str) -> Result<&ServiceDescriptor, SimError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SimError::UnknownService(name.to_string()))
    }

    fn counters(&self, region: &Region) -> Result<(u32, u32), SimError> {
        let tx = self.bulk.load_32(region.desc_offset + REGION_TX)?;
        let rx = self.bulk.load_32(region.desc_offset + REGION_RX)?;
        fence(Ordering::Acquire);
        Ok((tx, rx))
    }

    fn publish_counter(&self, region: &Region, field: u64, value: u32) -> Result<(), SimError> {
        fence(Ordering::Release);
        self.bulk.store_32(region.desc_offset + field, value)?;
        Ok(())
    }

    /// Live `(tx, rx)` of one direction of `name`.
    pub fn ring_counters(&self, name: &str, dir: Direction) -> Result<(u32, u32), SimError> {
        let desc = self.service(name)?;
        self.counters(desc.region(dir))
    }

    /// Produce one message towards the host. `Ok(false)` when every slot is
    /// still unread.
    pub fn push_up(&self, name: &str, msg: &[u8]) -> Result<bool, SimError> {
        let desc = self.service(name)?;
        let up = desc.up;
        if !up.is_usable() || up.is_ring {
            return Err(SimError::NotMessages(name.to_string()));
        }
        if msg.len() > up.slot_size as usize {
            return Err(SimError::TooLarge {
                len: msg.len(),
                max: up.slot_size as usize,
            });
        }
        let (tx, rx) = self.counters(&up)?;
        if tx.wrapping_sub(rx) >= up.slots {
            return Ok(false);
        }
        let slot = up.offset as u64 + (tx % up.slots) as u64 * slot_stride(up.slot_size);
        self.bulk.write_bytes(slot, &(msg.len() as u32).to_le_bytes())?;
        self.bulk.write_bytes(slot + SLOT_HEADER_SIZE as u64, msg)?;
        self.publish_counter(&up, REGION_TX, tx.wrapping_add(1))?;
        Ok(true)
    }

    /// Consume one message the host wrote.
    pub fn pop_down(&self, name: &str) -> Result<Option<Vec<u8>>, SimError> {
        let desc = self.service(name)?;
        let down = desc.down;
        if !down.is_usable() || down.is_ring {
            return Err(SimError::NotMessages(name.to_string()));
        }
        let (tx, rx) = self.counters(&down)?;
        if tx == rx {
            return Ok(None);
        }
        let slot = down.offset as u64 + (rx % down.slots) as u64 * slot_stride(down.slot_size);
        let header = self.bulk.read_range(slot, SLOT_HEADER_SIZE)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let len = len.min(down.slot_size as usize);
        let msg = self.bulk.read_range(slot + SLOT_HEADER_SIZE as u64, len)?;
        self.publish_counter(&down, REGION_RX, rx.wrapping_add(1))?;
        Ok(Some(msg))
    }

    /// Produce ring bytes towards the host. Returns how many fit.
    pub fn ring_push(&self, name: &str, data: &[u8]) -> Result<usize, SimError> {
        let desc = self.service(name)?;
        let up = desc.up;
        if !up.is_ring {
            return Err(SimError::NotRing(name.to_string()));
        }
        let (tx, rx) = self.counters(&up)?;
        let space = up.slot_size.saturating_sub(tx.wrapping_sub(rx)) as usize;
        let n = space.min(data.len());
        for (i, byte) in data[..n].iter().enumerate() {
            let pos = tx.wrapping_add(i as u32) % up.slot_size;
            self.bulk.write_bytes(up.offset as u64 + pos as u64, &[*byte])?;
        }
        self.publish_counter(&up, REGION_TX, tx.wrapping_add(n as u32))?;
        Ok(n)
    }

    /// Consume up to `max` ring bytes the host wrote.
    pub fn ring_pop(&self, name: &str, max: usize) -> Result<Vec<u8>, SimError> {
        let desc = self.service(name)?;
        let down = desc.down;
        if !down.is_ring {
            return Err(SimError::NotRing(name.to_string()));
        }
        let (tx, rx) = self.counters(&down)?;
        let n = (tx.wrapping_sub(rx) as usize).min(max);
        let mut out = vec![0u8; n];
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = rx.wrapping_add(i as u32) % down.slot_size;
            let mut b = [0u8; 1];
            self.bulk.read_bytes(down.offset as u64 + pos as u64, &mut b)?;
            *byte = b[0];
        }
        self.publish_counter(&down, REGION_RX, rx.wrapping_add(n as u32))?;
        Ok(out)
    }
}

/// Reset control that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct SimBootControl {
    resets: AtomicU32,
    in_reset: AtomicBool,
    fail: AtomicBool,
}

impl SimBootControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next reset sequences fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Completed assert/deassert cycles.
    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn in_reset(&self) -> bool {
        self.in_reset.load(Ordering::SeqCst)
    }
}

impl BootControl for SimBootControl {
    fn assert_reset(&self) -> Result<(), String> {
        self.in_reset.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deassert_reset(&self) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("simulated reset line stuck".to_string());
        }
        self.in_reset.store(false, Ordering::SeqCst);
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<T: BootControl + ?Sized> BootControl for Arc<T> {
    fn assert_reset(&self) -> Result<(), String> {
        (**self).assert_reset()
    }

    fn deassert_reset(&self) -> Result<(), String> {
        (**self).deassert_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::discover;

    fn model() -> CoprocessorModel {
        CoprocessorModel::new(Arc::new(SharedRegion::new("bulk", 0x4000)), 0x800)
    }

    #[test]
    fn test_bring_up_produces_valid_table() {
        let mut sim = model();
        sim.bring_up(
            3,
            1,
            &[
                ServiceSpec::new("echo")
                    .up(RegionKind::Messages { slots: 4, slot_size: 60 })
                    .down(RegionKind::Messages { slots: 4, slot_size: 60 }),
                ServiceSpec::new("pcm").down(RegionKind::Ring { size: 256 }),
            ],
        )
        .unwrap();
        let block = ControlBlock::read_from(&sim.bulk, 0x800).unwrap();
        assert!(block.is_valid());
        let services = discover(&sim.bulk, &block).unwrap();
        assert_eq!(services, sim.services());
    }

    #[test]
    fn test_crash_clears_magic() {
        let mut sim = model();
        sim.bring_up(1, 1, &[ServiceSpec::new("a").up(RegionKind::Ring { size: 16 })])
            .unwrap();
        sim.crash().unwrap();
        assert!(!ControlBlock::read_from(&sim.bulk, 0x800).unwrap().is_valid());
    }

    #[test]
    fn test_push_up_respects_slot_count() {
        let mut sim = model();
        sim.bring_up(
            1,
            1,
            &[ServiceSpec::new("evt").up(RegionKind::Messages { slots: 1, slot_size: 8 })],
        )
        .unwrap();
        assert_eq!(sim.push_up("evt", b"one"), Ok(true));
        assert_eq!(sim.push_up("evt", b"two"), Ok(false));
        assert_eq!(
            sim.push_up("evt", b"much too long"),
            Err(SimError::TooLarge { len: 13, max: 8 })
        );
        assert_eq!(
            sim.pop_down("evt"),
            Err(SimError::NotMessages("evt".into()))
        );
        assert_eq!(
            sim.push_up("nope", b""),
            Err(SimError::UnknownService("nope".into()))
        );
    }

    #[test]
    fn test_layout_must_fit() {
        let mut sim = model();
        let err = sim
            .layout(&[ServiceSpec::new("big").up(RegionKind::Ring { size: 0x4000 })])
            .unwrap_err();
        assert_eq!(err, SimError::OutOfSpace);
    }

    #[test]
    fn test_boot_control_records_cycles() {
        let boot = SimBootControl::new();
        boot.reset_sequence().unwrap();
        assert_eq!(boot.resets(), 1);
        assert!(!boot.in_reset());
        boot.set_failing(true);
        assert!(boot.reset_sequence().is_err());
        assert!(boot.in_reset());
        assert_eq!(boot.resets(), 1);
    }
}
