//! Firmware image validation and loading.
//!
//! Images are checked completely before a single byte reaches shared memory,
//! so a malformed image never leaves a partial copy behind.

use crate::config::{MethodSignature, TransportConfig};
use crate::layout::{CONTROL_BLOCK_SIZE, TRAMPOLINE_JUMP, TRAMPOLINE_OFFSET};
use crate::region::{RegionError, SharedRegion};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// "AOCF" in memory.
pub const FW_MAGIC: u32 = u32::from_le_bytes(*b"AOCF");

/// Size of the fixed image header.
pub const FW_HEADER_SIZE: usize = 64;

/// Signature-table entry: 32-byte NUL-padded symbol + `u32` signature.
pub const SIG_NAME_LEN: usize = 32;
pub const SIG_ENTRY_SIZE: usize = SIG_NAME_LEN + 4;

// Header field offsets
const HDR_MAGIC: usize = 0x00;
const HDR_HEADER_VERSION: usize = 0x04;
const HDR_FW_VERSION: usize = 0x08;
const HDR_IMAGE_SIZE: usize = 0x0C;
const HDR_BOOTLOADER_OFFSET: usize = 0x10;
const HDR_BOOTLOADER_SIZE: usize = 0x14;
const HDR_SIG_TABLE_OFFSET: usize = 0x18;
const HDR_SIG_TABLE_SIZE: usize = 0x1C;
const HDR_SECTION_TABLE_OFFSET: usize = 0x20;
const HDR_SECTION_ENTRY_SIZE: usize = 0x24;
const HDR_SECTION_COUNT: usize = 0x28;
const HDR_CORE0_OFFSET: usize = 0x2C;
const HDR_CORE0_SIZE: usize = 0x30;
const HDR_CORE1_OFFSET: usize = 0x34;
const HDR_CORE1_SIZE: usize = 0x38;
const HDR_CRC: usize = 0x3C;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("malformed firmware image: {0}")]
    Malformed(String),

    #[error("firmware image unavailable: {0}")]
    Unavailable(String),

    #[error("coprocessor is {0:?}, not offline")]
    Busy(crate::control::LinkState),

    #[error("reset sequence failed: {0}")]
    ResetFailed(String),

    #[error("shared memory: {0}")]
    Region(#[from] RegionError),
}

fn malformed(msg: impl Into<String>) -> FirmwareError {
    FirmwareError::Malformed(msg.into())
}

/// Parsed image header. Offsets are relative to the start of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub magic: u32,
    pub header_version: u32,
    pub fw_version: u32,
    pub image_size: u32,
    pub bootloader_offset: u32,
    pub bootloader_size: u32,
    pub sig_table_offset: u32,
    pub sig_table_size: u32,
    pub section_table_offset: u32,
    pub section_entry_size: u32,
    pub section_count: u32,
    pub core_data: [(u32, u32); 2],
    pub crc: u32,
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl FirmwareHeader {
    fn parse(bytes: &[u8]) -> Result<Self, FirmwareError> {
        if bytes.len() < FW_HEADER_SIZE {
            return Err(malformed(format!(
                "image is {} bytes, header needs {}",
                bytes.len(),
                FW_HEADER_SIZE
            )));
        }
        let magic = le32(bytes, HDR_MAGIC);
        if magic != FW_MAGIC {
            return Err(malformed(format!("bad magic {:#010x}", magic)));
        }
        Ok(Self {
            magic,
            header_version: le32(bytes, HDR_HEADER_VERSION),
            fw_version: le32(bytes, HDR_FW_VERSION),
            image_size: le32(bytes, HDR_IMAGE_SIZE),
            bootloader_offset: le32(bytes, HDR_BOOTLOADER_OFFSET),
            bootloader_size: le32(bytes, HDR_BOOTLOADER_SIZE),
            sig_table_offset: le32(bytes, HDR_SIG_TABLE_OFFSET),
            sig_table_size: le32(bytes, HDR_SIG_TABLE_SIZE),
            section_table_offset: le32(bytes, HDR_SECTION_TABLE_OFFSET),
            section_entry_size: le32(bytes, HDR_SECTION_ENTRY_SIZE),
            section_count: le32(bytes, HDR_SECTION_COUNT),
            core_data: [
                (le32(bytes, HDR_CORE0_OFFSET), le32(bytes, HDR_CORE0_SIZE)),
                (le32(bytes, HDR_CORE1_OFFSET), le32(bytes, HDR_CORE1_SIZE)),
            ],
            crc: le32(bytes, HDR_CRC),
        })
    }

    /// Serialize the header (used by the simulator and tests to build images).
    pub fn to_bytes(&self) -> [u8; FW_HEADER_SIZE] {
        let mut out = [0u8; FW_HEADER_SIZE];
        let fields = [
            (HDR_MAGIC, self.magic),
            (HDR_HEADER_VERSION, self.header_version),
            (HDR_FW_VERSION, self.fw_version),
            (HDR_IMAGE_SIZE, self.image_size),
            (HDR_BOOTLOADER_OFFSET, self.bootloader_offset),
            (HDR_BOOTLOADER_SIZE, self.bootloader_size),
            (HDR_SIG_TABLE_OFFSET, self.sig_table_offset),
            (HDR_SIG_TABLE_SIZE, self.sig_table_size),
            (HDR_SECTION_TABLE_OFFSET, self.section_table_offset),
            (HDR_SECTION_ENTRY_SIZE, self.section_entry_size),
            (HDR_SECTION_COUNT, self.section_count),
            (HDR_CORE0_OFFSET, self.core_data[0].0),
            (HDR_CORE0_SIZE, self.core_data[0].1),
            (HDR_CORE1_OFFSET, self.core_data[1].0),
            (HDR_CORE1_SIZE, self.core_data[1].1),
            (HDR_CRC, self.crc),
        ];
        for (at, value) in fields {
            out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// Check that `[offset, offset + size)` lies inside an image of `image_len`.
fn within(what: &str, offset: u32, size: u64, image_len: u64) -> Result<(), FirmwareError> {
    let end = (offset as u64).checked_add(size);
    match end {
        Some(end) if end <= image_len => Ok(()),
        _ => Err(malformed(format!(
            "{} at {:#x} (+{:#x}) exceeds image bounds {:#x}",
            what, offset, size, image_len
        ))),
    }
}

/// A structurally validated firmware image.
#[derive(Debug)]
pub struct FirmwareImage<'a> {
    pub header: FirmwareHeader,
    bytes: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
    /// Parse and bounds-check an image. The host interface is checked
    /// separately by [`FirmwareImage::check_interface`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FirmwareError> {
        let header = FirmwareHeader::parse(bytes)?;
        let len = header.image_size as u64;
        if len != bytes.len() as u64 {
            return Err(malformed(format!(
                "declared image size {:#x} does not match buffer of {:#x}",
                len,
                bytes.len()
            )));
        }

        if header.bootloader_size == 0 {
            return Err(malformed("image has no bootloader"));
        }
        within("bootloader", header.bootloader_offset, header.bootloader_size as u64, len)?;

        if header.sig_table_size as usize % SIG_ENTRY_SIZE != 0 {
            return Err(malformed(format!(
                "signature table size {:#x} is not a multiple of {}",
                header.sig_table_size, SIG_ENTRY_SIZE
            )));
        }
        within("signature table", header.sig_table_offset, header.sig_table_size as u64, len)?;

        let sections = (header.section_entry_size as u64)
            .checked_mul(header.section_count as u64)
            .ok_or_else(|| malformed("section table size overflows"))?;
        within("section table", header.section_table_offset, sections, len)?;

        for (core, &(offset, size)) in header.core_data.iter().enumerate() {
            if size > 0 {
                within(&format!("core {} data", core), offset, size as u64, len)?;
            }
        }

        Ok(Self { header, bytes })
    }

    /// Raw image bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Exported symbols from the method-signature table.
    pub fn symbols(&self) -> impl Iterator<Item = MethodSignature> + '_ {
        let start = self.header.sig_table_offset as usize;
        let end = start + self.header.sig_table_size as usize;
        self.bytes[start..end].chunks_exact(SIG_ENTRY_SIZE).map(|entry| {
            let raw = &entry[..SIG_NAME_LEN];
            let len = raw.iter().position(|&b| b == 0).unwrap_or(SIG_NAME_LEN);
            MethodSignature {
                name: String::from_utf8_lossy(&raw[..len]).into_owned(),
                signature: le32(entry, SIG_NAME_LEN),
            }
        })
    }

    /// Every symbol the host calls must be exported with the same signature.
    pub fn check_interface(&self, expected: &[MethodSignature]) -> Result<(), FirmwareError> {
        let exported: Vec<MethodSignature> = self.symbols().collect();
        for want in expected {
            match exported.iter().find(|s| s.name == want.name) {
                Some(have) if have.signature == want.signature => {}
                Some(have) => {
                    return Err(malformed(format!(
                        "`{}` has signature {:#x}, host expects {:#x}",
                        want.name, have.signature, want.signature
                    )));
                }
                None => {
                    return Err(malformed(format!("`{}` is not exported", want.name)));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 of the image, hex encoded. Identification only.
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(self.bytes))
    }
}

/// Reset control for the coprocessor core.
///
/// Implementations either pulse a reset line or toggle a power-control bit.
pub trait BootControl: Send + Sync {
    fn assert_reset(&self) -> Result<(), String>;
    fn deassert_reset(&self) -> Result<(), String>;

    /// Documented reset sequence: hold the core in reset, then release it.
    fn reset_sequence(&self) -> Result<(), String> {
        self.assert_reset()?;
        self.deassert_reset()
    }
}

/// Read an image from disk.
pub fn load_image(path: &Path) -> Result<Vec<u8>, FirmwareError> {
    std::fs::read(path)
        .map_err(|e| FirmwareError::Unavailable(format!("{}: {}", path.display(), e)))
}

/// Validate `bytes`, copy it into the bulk window, install the trampoline and
/// run the reset sequence. Returns the device entry address.
pub fn load_and_boot(
    bytes: &[u8],
    config: &TransportConfig,
    fast: &SharedRegion,
    bulk: &SharedRegion,
    boot: &dyn BootControl,
) -> Result<u32, FirmwareError> {
    let image = FirmwareImage::parse(bytes)?;
    image.check_interface(&config.host_interface)?;

    if bytes.len() as u64 > config.max_image_size() {
        return Err(malformed(format!(
            "image of {:#x} bytes does not fit below the control block ({:#x} available)",
            bytes.len(),
            config.max_image_size()
        )));
    }
    let entry = (config.bulk_device_base as u64)
        + config.firmware_load_offset
        + image.header.bootloader_offset as u64;
    let entry = u32::try_from(entry)
        .map_err(|_| malformed(format!("entry point {:#x} is not addressable", entry)))?;

    bulk.write_bytes(config.firmware_load_offset, bytes)?;
    // Clear any block left behind by a previous run.
    bulk.zero_range(config.control_block_offset, CONTROL_BLOCK_SIZE)?;
    fast.store_32(TRAMPOLINE_OFFSET, TRAMPOLINE_JUMP)?;
    fast.store_32(TRAMPOLINE_OFFSET + 4, entry)?;

    log::info!(
        "firmware v{:#x} loaded: {} bytes at bulk+{:#x}, entry={:#010x}, sha256={}",
        image.header.fw_version,
        bytes.len(),
        config.firmware_load_offset,
        entry,
        image.sha256_hex()
    );

    boot.reset_sequence().map_err(FirmwareError::ResetFailed)?;
    Ok(entry)
}

/// Builder for well-formed images (simulator, tests and the CLI demo).
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    fw_version: u32,
    symbols: Vec<MethodSignature>,
    bootloader: Vec<u8>,
    payload: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(fw_version: u32) -> Self {
        Self {
            fw_version,
            symbols: Vec::new(),
            bootloader: vec![0u8; 16],
            payload: Vec::new(),
        }
    }

    pub fn symbols(mut self, symbols: &[MethodSignature]) -> Self {
        self.symbols = symbols.to_vec();
        self
    }

    pub fn bootloader(mut self, code: &[u8]) -> Self {
        self.bootloader = code.to_vec();
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let sig_offset = FW_HEADER_SIZE;
        let sig_size = self.symbols.len() * SIG_ENTRY_SIZE;
        let boot_offset = sig_offset + sig_size;
        let core_offset = boot_offset + self.bootloader.len();
        let total = core_offset + self.payload.len();

        let header = FirmwareHeader {
            magic: FW_MAGIC,
            header_version: 1,
            fw_version: self.fw_version,
            image_size: total as u32,
            bootloader_offset: boot_offset as u32,
            bootloader_size: self.bootloader.len() as u32,
            sig_table_offset: sig_offset as u32,
            sig_table_size: sig_size as u32,
            section_table_offset: 0,
            section_entry_size: 0,
            section_count: 0,
            core_data: [(core_offset as u32, self.payload.len() as u32), (0, 0)],
            crc: 0,
        };

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header.to_bytes());
        for sym in &self.symbols {
            let mut name = [0u8; SIG_NAME_LEN];
            let len = sym.name.len().min(SIG_NAME_LEN - 1);
            name[..len].copy_from_slice(&sym.name.as_bytes()[..len]);
            out.extend_from_slice(&name);
            out.extend_from_slice(&sym.signature.to_le_bytes());
        }
        out.extend_from_slice(&self.bootloader);
        out.extend_from_slice(&self.payload);
        out
    }
}
