//! Transport configuration.
//!
//! Describes where things live in the two shared windows and which firmware
//! interface the host expects. The command-line tool builds one from its
//! arguments; tests use small windows through [`TransportConfig::compact`].

use crate::layout::{CONTROL_BLOCK_SIZE, TRAMPOLINE_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fast window of {0:#x} bytes cannot hold the boot trampoline")]
    FastWindowTooSmall(usize),

    #[error("control block at {offset:#x} does not fit in a bulk window of {size:#x} bytes")]
    ControlBlockOutOfRange { offset: u64, size: usize },

    #[error("control block offset {0:#x} is not word aligned")]
    ControlBlockMisaligned(u64),

    #[error("firmware load offset {load:#x} must lie below the control block at {control:#x}")]
    LoadAreaOverlap { load: u64, control: u64 },

    #[error("bulk window does not fit in the coprocessor's 32-bit address space")]
    DeviceAddressOverflow,
}

/// One entry of the firmware interface the host expects to call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub signature: u32,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, signature: u32) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }
}

/// Layout and interface configuration for one transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Size of the fast window in bytes.
    pub fast_size: usize,
    /// Size of the bulk window in bytes.
    pub bulk_size: usize,
    /// Bulk offset the firmware image is copied to.
    pub firmware_load_offset: u64,
    /// Bulk offset of the control block.
    pub control_block_offset: u64,
    /// Address of bulk offset 0 as seen by the coprocessor.
    pub bulk_device_base: u32,
    /// Symbols (and their signatures) the image must export.
    pub host_interface: Vec<MethodSignature>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fast_size: 0x1000,
            bulk_size: 0x40_0000,
            firmware_load_offset: 0,
            control_block_offset: 0x20_0000,
            bulk_device_base: 0x9000_0000,
            host_interface: default_host_interface(),
        }
    }
}

/// The IPC entry points the host calls into.
pub fn default_host_interface() -> Vec<MethodSignature> {
    vec![
        MethodSignature::new("ipc_notify", 0x0001_0002),
        MethodSignature::new("ipc_service_table", 0x0001_0000),
    ]
}

impl TransportConfig {
    /// Small windows for tests and the simulator.
    pub fn compact() -> Self {
        Self {
            fast_size: 0x100,
            bulk_size: 0x2_0000,
            firmware_load_offset: 0,
            control_block_offset: 0x8000,
            ..Self::default()
        }
    }

    /// Largest firmware image that fits below the control block.
    pub fn max_image_size(&self) -> u64 {
        self.control_block_offset - self.firmware_load_offset
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fast_size < TRAMPOLINE_SIZE {
            return Err(ConfigError::FastWindowTooSmall(self.fast_size));
        }
        if self.control_block_offset % 4 != 0 {
            return Err(ConfigError::ControlBlockMisaligned(self.control_block_offset));
        }
        let cb_end = self
            .control_block_offset
            .checked_add(CONTROL_BLOCK_SIZE as u64);
        if cb_end.map_or(true, |end| end > self.bulk_size as u64) {
            return Err(ConfigError::ControlBlockOutOfRange {
                offset: self.control_block_offset,
                size: self.bulk_size,
            });
        }
        if self.firmware_load_offset >= self.control_block_offset {
            return Err(ConfigError::LoadAreaOverlap {
                load: self.firmware_load_offset,
                control: self.control_block_offset,
            });
        }
        if (self.bulk_device_base as u64) + (self.bulk_size as u64) > u32::MAX as u64 + 1 {
            return Err(ConfigError::DeviceAddressOverflow);
        }
        Ok(())
    }
}
