//! Block store contract and the two stores shipped with the engine.
//!
//! The reconciler hands finished disk images to a block store and gets back
//! an opaque address cookie; it never interprets addresses. Both stores
//! checksum images with CRC32C on write and verify on read.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};

pub type BlockAddr = u32;

/// Reserved address; never returned by a store.
pub const ADDR_INVALID: BlockAddr = u32::MAX;

/// An (address, size) pair naming one written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockOff {
    pub addr: BlockAddr,
    pub size: u32,
}

impl BlockOff {
    pub fn invalid() -> Self {
        Self {
            addr: ADDR_INVALID,
            size: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.addr != ADDR_INVALID
    }
}

/// The block-manager contract the engine consumes.
pub trait BlockStore: Send + Sync {
    /// Persist one image, returning its address cookie.
    fn write(&self, image: &[u8]) -> Result<BlockOff>;

    /// Read back a previously written image.
    fn read(&self, off: BlockOff) -> Result<Vec<u8>>;

    /// Release a block. Freeing an already-freed or unknown block is an
    /// invalid-state error, not a corruption.
    fn free(&self, off: BlockOff) -> Result<()>;
}

/// Counters shared by both store implementations.
#[derive(Debug, Default)]
pub struct BlockStats {
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub frees: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub frees: u64,
}

impl BlockStats {
    fn snapshot(&self) -> BlockStatsSnapshot {
        BlockStatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

struct MemBlocks {
    blocks: HashMap<BlockAddr, (u32, Vec<u8>)>,
    next_addr: BlockAddr,
}

/// Heap-backed block store.
pub struct MemBlockStore {
    inner: Mutex<MemBlocks>,
    stats: BlockStats,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemBlocks {
                blocks: HashMap::new(),
                next_addr: 1,
            }),
            stats: BlockStats::default(),
        }
    }

    pub fn stats(&self) -> BlockStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of live (written, not yet freed) blocks.
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn write(&self, image: &[u8]) -> Result<BlockOff> {
        let crc = crc32fast::hash(image);
        let mut inner = self.inner.lock();
        let addr = inner.next_addr;
        if addr == ADDR_INVALID {
            return Err(EngineError::InvalidState(
                "block address space exhausted".to_string(),
            ));
        }
        inner.next_addr += 1;
        inner.blocks.insert(addr, (crc, image.to_vec()));
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(BlockOff {
            addr,
            size: image.len() as u32,
        })
    }

    fn read(&self, off: BlockOff) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let (crc, image) = inner
            .blocks
            .get(&off.addr)
            .ok_or_else(|| EngineError::NotFound(format!("block {}", off.addr)))?;
        if *crc != crc32fast::hash(image) {
            return Err(EngineError::ChecksumMismatch { addr: off.addr });
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(image.clone())
    }

    fn free(&self, off: BlockOff) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.blocks.remove(&off.addr).is_none() {
            return Err(EngineError::InvalidState(format!(
                "free of unknown block {}",
                off.addr
            )));
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct FileBlocks {
    file: File,
    // addr -> (file offset, length)
    extents: HashMap<BlockAddr, (u64, u32)>,
    next_addr: BlockAddr,
    next_offset: u64,
}

/// Single-file block store. Blocks are appended; a freed extent is simply
/// forgotten, space is not recycled.
pub struct FileBlockStore {
    inner: Mutex<FileBlocks>,
    stats: BlockStats,
}

impl FileBlockStore {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created block file");
        Ok(Self {
            inner: Mutex::new(FileBlocks {
                file,
                extents: HashMap::new(),
                next_addr: 1,
                next_offset: 0,
            }),
            stats: BlockStats::default(),
        })
    }

    pub fn stats(&self) -> BlockStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }
}

impl BlockStore for FileBlockStore {
    fn write(&self, image: &[u8]) -> Result<BlockOff> {
        let crc = crc32fast::hash(image);
        let mut inner = self.inner.lock();
        let addr = inner.next_addr;
        if addr == ADDR_INVALID {
            return Err(EngineError::InvalidState(
                "block address space exhausted".to_string(),
            ));
        }
        let offset = inner.next_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&crc.to_le_bytes())?;
        inner.file.write_all(image)?;
        let len = 4 + image.len() as u32;
        inner.next_addr += 1;
        inner.next_offset = offset + u64::from(len);
        inner.extents.insert(addr, (offset, len));
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(BlockOff {
            addr,
            size: image.len() as u32,
        })
    }

    fn read(&self, off: BlockOff) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (offset, len) = *inner
            .extents
            .get(&off.addr)
            .ok_or_else(|| EngineError::NotFound(format!("block {}", off.addr)))?;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        inner.file.read_exact(&mut buf)?;
        let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let image = buf.split_off(4);
        if crc != crc32fast::hash(&image) {
            return Err(EngineError::ChecksumMismatch { addr: off.addr });
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(image)
    }

    fn free(&self, off: BlockOff) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.extents.remove(&off.addr).is_none() {
            return Err(EngineError::InvalidState(format!(
                "free of unknown block {}",
                off.addr
            )));
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
