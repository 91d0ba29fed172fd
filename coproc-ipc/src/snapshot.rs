use crate::control::{ControlBlock, LinkState};
use crate::registry::ServiceInfo;
use crate::region::SharedRegion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Point-in-time capture of the host's view of the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub version: String,
    pub state: LinkState,
    pub control: ControlBlock,
    pub generation: u64,
    pub services: Vec<ServiceSnapshot>,
    pub memory: Vec<MemRegionSnapshot>,
}

/// One service with its live counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub info: ServiceInfo,
    /// `(tx, rx)` of the coprocessor to host direction.
    pub up: (u32, u32),
    /// `(tx, rx)` of the host to coprocessor direction.
    pub down: (u32, u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemRegionSnapshot {
    pub name: String,
    pub size: u64,
    pub hash: String,
    pub data: Option<Vec<u8>>,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl MemRegionSnapshot {
    /// Capture a window's digest, and its contents if `with_data`.
    pub fn capture(region: &SharedRegion, with_data: bool) -> Self {
        let data = region.get_data();
        Self {
            name: region.name().to_string(),
            size: region.size() as u64,
            hash: sha256_hex(&data),
            data: with_data.then_some(data),
        }
    }

    /// Check inline data against the recorded digest.
    pub fn verify(&self) -> Result<(), String> {
        let Some(data) = &self.data else {
            return Ok(());
        };
        if data.len() as u64 != self.size {
            return Err(format!(
                "snapshot {} size mismatch: recorded={} bytes, data={} bytes",
                self.name,
                self.size,
                data.len()
            ));
        }
        if sha256_hex(data) != self.hash {
            return Err(format!("snapshot {} hash mismatch", self.name));
        }
        Ok(())
    }
}

impl TransportSnapshot {
    pub fn region(&self, name: &str) -> Option<&MemRegionSnapshot> {
        self.memory.iter().find(|m| m.name == name)
    }

    /// Save to disk using bincode.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let mut file = File::create(path)?;
        bincode::serialize_into(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    /// Load from disk, rejecting other versions and corrupted memory data.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let mut file = File::open(path)?;
        let snapshot: TransportSnapshot = bincode::deserialize_from(&mut file)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(format!(
                "snapshot version mismatch: expected {}, found {}",
                SNAPSHOT_VERSION, snapshot.version
            )
            .into());
        }
        for region in &snapshot.memory {
            region.verify()?;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(with_data: bool) -> TransportSnapshot {
        let bulk = SharedRegion::new("bulk", 0x100);
        bulk.store_32(0x10, 0xCAFE_F00D).unwrap();
        TransportSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            state: LinkState::Offline,
            control: ControlBlock::default(),
            generation: 0,
            services: Vec::new(),
            memory: vec![MemRegionSnapshot::capture(&bulk, with_data)],
        }
    }

    #[test]
    fn test_digest_matches_contents() {
        let snap = sample(true);
        let region = snap.region("bulk").unwrap();
        assert_eq!(region.hash.len(), 64);
        assert!(region.verify().is_ok());

        let mut tampered = region.clone();
        if let Some(data) = tampered.data.as_mut() {
            data[0] ^= 1;
        }
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("coproc-snapshot-{}.bin", std::process::id()));
        let snap = sample(false);
        snap.save_to_path(&path).unwrap();
        let loaded = TransportSnapshot::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.memory[0].hash, snap.memory[0].hash);
        assert!(loaded.memory[0].data.is_none());
        assert_eq!(loaded.state, LinkState::Offline);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let path = std::env::temp_dir().join(format!("coproc-snapshot-v-{}.bin", std::process::id()));
        let mut snap = sample(false);
        snap.version = "0.1".to_string();
        snap.save_to_path(&path).unwrap();
        let err = TransportSnapshot::load_from_path(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("version mismatch"));
    }
}
