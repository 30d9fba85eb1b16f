//! RAM and ROM targets
//!
//! The backing store is one heap buffer that never moves, so it can be
//! handed out as a DMI region. Whether DMI is offered is decided once, at
//! construction.
//!
//! Writes that go through the socket mark their 4 KiB page dirty. Once a
//! writable DMI grant has been given out, writes can no longer be seen, and
//! every non-zero page counts as dirty.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::payload::{Payload, TlmStatus};
use crate::target::{DmiRegion, HostPtr, LatencyModel, Target, TargetIf};
use crate::time::SimTime;

/// Page size for dirty tracking (4KB)
pub const PAGE_SIZE: u64 = 4096;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub read_only: bool,
    pub dmi: bool,
    /// Raw or gzip image loaded at `base + image_offset`.
    pub image: Option<PathBuf>,
    pub image_offset: u64,
    pub latency: LatencyModel,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            name: "ram".into(),
            base: 0,
            size: 0x10_0000,
            read_only: false,
            dmi: true,
            image: None,
            image_offset: 0,
            latency: LatencyModel::default(),
        }
    }
}

impl MemoryConfig {
    pub fn target_if(&self) -> TargetIf {
        TargetIf { base: self.base, size: self.size, latency: self.latency }
    }
}

pub struct Memory {
    name: String,
    data: Box<[u8]>,
    read_only: bool,
    dmi: bool,
    dirty: BTreeSet<u64>,
    /// A writable DMI grant is outstanding.
    untracked: bool,
}

impl Memory {
    pub fn new(name: &str, size: u64, read_only: bool, dmi: bool) -> Result<Self> {
        let len = usize::try_from(size).map_err(|_| VpError::config(format!("{}: size 0x{:x} too large", name, size)))?;
        if len == 0 {
            return Err(VpError::config(format!("{}: empty memory", name)));
        }
        Ok(Memory {
            name: name.to_string(),
            data: vec![0u8; len].into_boxed_slice(),
            read_only,
            dmi,
            dirty: BTreeSet::new(),
            untracked: false,
        })
    }

    /// Build from a config, loading its image if any.
    pub fn from_config(cfg: &MemoryConfig) -> Result<Self> {
        let mut mem = Memory::new(&cfg.name, cfg.size, cfg.read_only, cfg.dmi)?;
        if let Some(path) = &cfg.image {
            let n = mem.load_image(path, cfg.image_offset)?;
            tracing::info!("{}: loaded {} bytes from {}", cfg.name, n, path.display());
        }
        Ok(mem)
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Copy `bytes` at `offset`, bypassing the read-only flag.
    pub fn load_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| VpError::overflow(format!("{}: offset 0x{:x}", self.name, offset)))?;
        let end = start
            .checked_add(bytes.len())
            .filter(|e| *e <= self.data.len())
            .ok_or_else(|| {
                VpError::invalid(format!(
                    "{}: {} bytes at 0x{:x} exceed size 0x{:x}",
                    self.name,
                    bytes.len(),
                    offset,
                    self.data.len()
                ))
            })?;
        self.data[start..end].copy_from_slice(bytes);
        self.mark_dirty(offset, bytes.len() as u64);
        Ok(())
    }

    /// Load a raw or gzip-compressed image. Returns the decoded length.
    pub fn load_image(&mut self, path: &Path, offset: u64) -> Result<usize> {
        let mut file = BufReader::new(File::open(path)?);
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let bytes = if raw.starts_with(&GZIP_MAGIC) {
            let mut out = Vec::new();
            GzDecoder::new(&raw[..]).read_to_end(&mut out)?;
            out
        } else {
            raw
        };
        self.load_bytes(offset, &bytes)?;
        Ok(bytes.len())
    }

    pub fn bytes(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }

    fn mark_dirty(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = offset / PAGE_SIZE;
        let last = (offset + len - 1) / PAGE_SIZE;
        self.dirty.extend(first..=last);
    }

    /// Pages that may differ from a zeroed memory, keyed by page offset.
    pub fn dirty_pages(&self) -> BTreeMap<u64, Vec<u8>> {
        let page = PAGE_SIZE as usize;
        let mut out = BTreeMap::new();
        if self.untracked {
            for (i, chunk) in self.data.chunks(page).enumerate() {
                if chunk.iter().any(|b| *b != 0) {
                    out.insert(i as u64 * PAGE_SIZE, chunk.to_vec());
                }
            }
        } else {
            for p in &self.dirty {
                let start = (*p * PAGE_SIZE) as usize;
                let end = (start + page).min(self.data.len());
                out.insert(p * PAGE_SIZE, self.data[start..end].to_vec());
            }
        }
        out
    }

    /// Zero the memory and write back `pages`.
    pub fn restore_pages(&mut self, pages: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
        self.data.fill(0);
        self.dirty.clear();
        for (offset, bytes) in pages {
            self.load_bytes(*offset, bytes)?;
        }
        Ok(())
    }

    fn range(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl Target for Memory {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        let Some(r) = self.range(offset, p.len()) else {
            return TlmStatus::AddressError;
        };
        p.data.copy_from_slice(&self.data[r]);
        TlmStatus::Ok
    }

    fn write(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        if self.read_only {
            tracing::warn!("{}: write to ROM at offset 0x{:x} ignored", self.name, offset);
            return TlmStatus::GenericError;
        }
        let Some(r) = self.range(offset, p.len()) else {
            return TlmStatus::AddressError;
        };
        match &p.byte_enable {
            Some(be) if !be.is_empty() => {
                for (i, (dst, src)) in self.data[r].iter_mut().zip(&p.data).enumerate() {
                    if be[i % be.len()] != 0 {
                        *dst = *src;
                    }
                }
            }
            _ => self.data[r].copy_from_slice(&p.data),
        }
        self.mark_dirty(offset, p.len() as u64);
        TlmStatus::Ok
    }

    fn dmi_allowed(&self, _offset: u64) -> bool {
        self.dmi
    }

    fn dmi_region(&mut self, space: AddrSpace) -> Option<DmiRegion> {
        if !self.dmi {
            return None;
        }
        if !self.read_only {
            self.untracked = true;
        }
        // SAFETY: the boxed slice is never reallocated and lives as long as
        // the target, which outlives the socket handing out the region
        let ptr = unsafe { HostPtr::new(self.data.as_mut_ptr()) };
        Some(DmiRegion { space, ptr, read_only: self.read_only })
    }

    fn supports_byte_enable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use parking_lot::Mutex;

    use crate::interconnect::Transport;
    use crate::param::{ParamManager, Parameter};
    use crate::payload::Command;
    use crate::target::TargetSocket;

    #[test]
    fn test_ram_read_write() {
        let mut mem = Memory::new("ram", 0x2000, false, false).unwrap();
        let mut d = SimTime::ZERO;
        let mut w = Payload::write(0x10, &0x1234_5678u32.to_le_bytes(), 0);
        assert_eq!(mem.write(0x10, &mut w, &mut d), TlmStatus::Ok);
        let mut r = Payload::read(0x10, 4, 0);
        assert_eq!(mem.read(0x10, &mut r, &mut d), TlmStatus::Ok);
        assert_eq!(r.data_u64(), 0x1234_5678);

        let mut be = Payload::write(0x10, &[0xaa, 0xbb, 0xcc, 0xdd], 0);
        be.byte_enable = Some(vec![0xff, 0x00]);
        assert_eq!(mem.write(0x10, &mut be, &mut d), TlmStatus::Ok);
        assert_eq!(mem.bytes(0x10, 4).unwrap(), &[0xaa, 0x56, 0xcc, 0x12]);

        let mut across = Payload::write(0xfff, &[1, 2], 0);
        assert_eq!(mem.write(0xfff, &mut across, &mut d), TlmStatus::Ok);
        assert_eq!(mem.dirty_pages().keys().copied().collect::<Vec<_>>(), vec![0, PAGE_SIZE]);
    }

    #[test]
    fn test_rom_rejects_writes() {
        let mut rom = Memory::new("rom", 0x100, true, true).unwrap();
        rom.load_bytes(0, &[1, 2, 3, 4]).unwrap();
        let mut d = SimTime::ZERO;
        let mut w = Payload::write(0, &[9], 0);
        assert_eq!(rom.write(0, &mut w, &mut d), TlmStatus::GenericError);
        assert_eq!(rom.bytes(0, 4).unwrap(), &[1, 2, 3, 4]);
        let region = rom.dmi_region(AddrSpace::from_size(0x1000, 0x100).unwrap()).unwrap();
        assert!(region.read_only);
        assert!(!region.write(0x1000, &[7]));
    }

    #[test]
    fn test_load_gzip_and_raw_images() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("boot.bin");
        std::fs::write(&raw, [0xde, 0xad]).unwrap();
        let gz = dir.path().join("kernel.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&[5u8; 300]).unwrap();
        std::fs::write(&gz, enc.finish().unwrap()).unwrap();

        let mut mem = Memory::new("ram", 0x1000, false, true).unwrap();
        assert_eq!(mem.load_image(&raw, 0x0).unwrap(), 2);
        assert_eq!(mem.load_image(&gz, 0x100).unwrap(), 300);
        assert_eq!(mem.bytes(0x0, 2).unwrap(), &[0xde, 0xad]);
        assert!(mem.bytes(0x100, 300).unwrap().iter().all(|b| *b == 5));
        assert!(mem.load_bytes(0xfff, &[0, 0]).is_err());
    }

    #[test]
    fn test_dmi_grant_and_snapshot_pages() {
        let pm = ParamManager::new();
        let cfg = MemoryConfig { name: "ram".into(), base: 0x8000_0000, size: 0x4000, ..MemoryConfig::default() };
        let mem = Arc::new(Mutex::new(Memory::from_config(&cfg).unwrap()));
        let sock = TargetSocket::new(&pm, cfg.target_if(), mem.clone()).unwrap();

        let mut query = Payload::dmi_query(0x8000_0000, Command::Read, 0);
        sock.b_transport(&mut query, &mut SimTime::ZERO);
        assert!(!query.dmi, "blocking transport is the default");

        pm.set_parameter(sock.module(), None, Parameter::blocking(false)).unwrap();
        let mut query = Payload::dmi_query(0x8000_0000, Command::Read, 0);
        sock.b_transport(&mut query, &mut SimTime::ZERO);
        assert!(query.dmi);

        let region = sock.get_direct_mem_ptr(0x8000_2004).unwrap();
        assert!(region.write(0x8000_2004, &[1, 2, 3, 4]));
        let pages = mem.lock().dirty_pages();
        assert_eq!(pages.keys().copied().collect::<Vec<_>>(), vec![0x2000]);
        assert_eq!(&pages[&0x2000][4..8], &[1, 2, 3, 4]);

        let mut other = Memory::new("ram", 0x4000, false, false).unwrap();
        other.restore_pages(&pages).unwrap();
        assert_eq!(other.bytes(0x2004, 4).unwrap(), &[1, 2, 3, 4]);
    }
}
