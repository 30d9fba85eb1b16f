//! Lightweight platform snapshots
//!
//! Saves only dirty memory pages, the interrupt controller state and the
//! simulation time instead of whole memories. Restoring requires a platform
//! built from the same configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};
use crate::gic::GicState;
use crate::time::SimTime;

/// Dirty pages of one memory, keyed by page offset.
pub type PageMap = BTreeMap<u64, Vec<u8>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    /// Version for compatibility checking
    pub version: u32,

    /// Simulation time at capture
    pub time: SimTime,

    /// Dirty pages per memory name
    pub memories: BTreeMap<String, PageMap>,

    /// Interrupt controller state, if the platform has one
    pub gic: Option<GicState>,
}

impl PlatformSnapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    pub fn new(time: SimTime) -> Self {
        PlatformSnapshot {
            version: Self::VERSION,
            time,
            memories: BTreeMap::new(),
            gic: None,
        }
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self).map_err(|e| VpError::Snapshot(format!("serialization: {}", e)))?;
        zstd::stream::encode_all(&serialized[..], 3).map_err(|e| VpError::Snapshot(format!("compression: {}", e)))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let decompressed =
            zstd::stream::decode_all(data).map_err(|e| VpError::Snapshot(format!("decompression: {}", e)))?;
        let snap: PlatformSnapshot =
            bincode::deserialize(&decompressed).map_err(|e| VpError::Snapshot(format!("deserialization: {}", e)))?;
        if snap.version != Self::VERSION {
            return Err(VpError::Snapshot(format!(
                "version {} not supported (expected {})",
                snap.version,
                Self::VERSION
            )));
        }
        Ok(snap)
    }

    pub fn save(&self, path: &Path) -> Result<usize> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes)?;
        tracing::info!("snapshot at {} written to {} ({} bytes)", self.time, path.display(), bytes.len());
        Ok(bytes.len())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::distributor::GICD_CTLR;

    #[test]
    fn test_file_round_trip_keeps_pages_and_gic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vp.snap");

        let mut snap = PlatformSnapshot::new(SimTime::from_us(42));
        let mut pages = PageMap::new();
        pages.insert(0x3000, vec![7u8; 4096]);
        snap.memories.insert("ram".into(), pages);
        let mut gic = GicState::new(2, 64);
        assert!(gic.dist.write(0, GICD_CTLR, 1));
        snap.gic = Some(gic);
        snap.save(&path).unwrap();

        let back = PlatformSnapshot::load(&path).unwrap();
        assert_eq!(back.time, SimTime::from_us(42));
        assert_eq!(back.memories["ram"][&0x3000], vec![7u8; 4096]);
        assert!(back.gic.unwrap().dist.enabled());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut snap = PlatformSnapshot::new(SimTime::ZERO);
        snap.version = 99;
        let bytes = snap.to_bytes().unwrap();
        assert!(matches!(PlatformSnapshot::from_bytes(&bytes), Err(VpError::Snapshot(_))));
        assert!(PlatformSnapshot::from_bytes(b"garbage").is_err());
    }
}
