//! Data handles: the per-table, per-checkpoint lifecycle anchors.

pub mod registry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockDowngrade};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::debug;

use crate::btree::Tree;
use crate::error::{EngineError, Result};
use crate::meta::{Catalog, LIVE_CHECKPOINT};

pub use registry::{HandleRegistry, HandleRef, OpenFlags, RegistryStatsSnapshot};

/// The metadata table's reserved name; its handle is closed last at
/// shutdown because closing a user table may dirty the metadata.
pub const METADATA_NAME: &str = "__metadata";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const OPEN = 1 << 0;
        const EXCLUSIVE = 1 << 1;
        const LOCK_ONLY = 1 << 2;
        const SALVAGE = 1 << 3;
        const UPGRADE = 1 << 4;
        const VERIFY = 1 << 5;
    }
}

impl HandleFlags {
    /// Modes that require exclusive use of the handle.
    pub fn special() -> Self {
        HandleFlags::SALVAGE | HandleFlags::UPGRADE | HandleFlags::VERIFY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// One open table+checkpoint. Created on first open, retained until the
/// owning connection shuts down, destroyed only when no session holds a
/// reference.
pub struct DataHandle {
    name: String,
    checkpoint: Option<String>,
    config: RwLock<String>,
    flags: AtomicU32,
    /// Mutated only under the registry's schema lock.
    refcnt: AtomicU32,
    /// Raw reader/writer lock: get/release straddle call frames, so lock
    /// state lives on the handle rather than in guard lifetimes.
    lock: RawRwLock,
    tree: Mutex<Option<Arc<Tree>>>,
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle")
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint)
            .field("flags", &self.flags)
            .field("refcnt", &self.refcnt)
            .finish_non_exhaustive()
    }
}

impl DataHandle {
    pub(crate) fn new(name: &str, checkpoint: Option<&str>, config: String) -> Self {
        Self {
            name: name.to_string(),
            checkpoint: checkpoint.map(|c| c.to_string()),
            config: RwLock::new(config),
            flags: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            lock: RawRwLock::INIT,
            tree: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    pub fn config(&self) -> String {
        self.config.read().clone()
    }

    pub fn is_metadata(&self) -> bool {
        self.name == METADATA_NAME
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.flags().contains(HandleFlags::OPEN)
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn set_flags(&self, f: HandleFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, f: HandleFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    pub(crate) fn ref_inc(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn ref_dec(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// The backing tree; fails on a closed handle.
    pub fn tree(&self) -> Result<Arc<Tree>> {
        self.tree.lock().clone().ok_or_else(|| {
            EngineError::InvalidState(format!("handle {} is not open", self.name))
        })
    }

    pub(crate) fn set_tree(&self, tree: Option<Arc<Tree>>) {
        *self.tree.lock() = tree;
    }

    pub(crate) fn set_config(&self, config: String) {
        *self.config.write() = config;
    }

    // Lock state is tracked by the callers through `LockMode`; every
    // unlock below must pair with an acquire of the same mode.

    pub(crate) fn read_lock(&self) {
        self.lock.lock_shared();
    }

    pub(crate) fn read_unlock(&self) {
        unsafe { self.lock.unlock_shared() }
    }

    pub(crate) fn try_write_lock(&self) -> bool {
        self.lock.try_lock_exclusive()
    }

    pub(crate) fn write_unlock(&self) {
        unsafe { self.lock.unlock_exclusive() }
    }

    pub(crate) fn downgrade_lock(&self) {
        unsafe { self.lock.downgrade() }
    }

    /// The open-lock spin. Returns a read-locked open handle, or a
    /// write-locked handle (open or closed) when exclusive access was
    /// requested or the handle needs opening. Exclusive requests never
    /// block: contention fails with a busy error.
    pub(crate) fn acquire(&self, want_exclusive: bool) -> Result<LockMode> {
        loop {
            let flags = self.flags();
            if !want_exclusive && flags.intersects(HandleFlags::special()) {
                return Err(EngineError::Busy(format!(
                    "handle {} is in a special operation",
                    self.name
                )));
            }
            if flags.contains(HandleFlags::OPEN) && !want_exclusive {
                self.read_lock();
                if self.flags().contains(HandleFlags::OPEN) {
                    return Ok(LockMode::Read);
                }
                // Closed while we waited; retry from the top.
                self.read_unlock();
                continue;
            }
            if self.try_write_lock() {
                if self.flags().contains(HandleFlags::OPEN) && !want_exclusive {
                    // Another thread opened it while we waited; a read
                    // lock is all we need.
                    self.write_unlock();
                    continue;
                }
                self.set_flags(HandleFlags::EXCLUSIVE);
                return Ok(LockMode::Write);
            }
            if want_exclusive {
                return Err(EngineError::Busy(format!(
                    "handle {} write lock unavailable",
                    self.name
                )));
            }
            std::thread::yield_now();
        }
    }

    /// Checkpoint the backing tree (unless the handle is in a special
    /// mode) and close it. A checkpoint failure does not skip the close;
    /// the first error is returned. Idempotent on a closed handle. Caller
    /// holds the write lock.
    pub(crate) fn sync_and_close(&self, catalog: &dyn Catalog) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let mut first_err = None;
        if !self.flags().intersects(HandleFlags::special()) {
            if let Some(tree) = self.tree.lock().as_ref() {
                if !tree.is_readonly() {
                    if let Err(e) = tree.checkpoint(catalog, LIVE_CHECKPOINT) {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.set_tree(None);
        self.clear_flags(HandleFlags::OPEN | HandleFlags::special() | HandleFlags::LOCK_ONLY);
        debug!(name = %self.name, checkpoint = ?self.checkpoint, "handle closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DataHandle {
        DataHandle::new("t", None, String::new())
    }

    #[test]
    fn exclusive_fails_busy_under_read_lock() {
        let dh = handle();
        dh.set_flags(HandleFlags::OPEN);
        assert_eq!(dh.acquire(false).unwrap(), LockMode::Read);
        assert!(dh.acquire(true).unwrap_err().is_busy());
        dh.read_unlock();
    }

    #[test]
    fn special_mode_rejects_non_exclusive() {
        let dh = handle();
        dh.set_flags(HandleFlags::OPEN | HandleFlags::VERIFY);
        assert!(dh.acquire(false).unwrap_err().is_busy());
    }

    #[test]
    fn closed_handle_grants_write_lock_to_reader() {
        let dh = handle();
        assert_eq!(dh.acquire(false).unwrap(), LockMode::Write);
        assert!(dh.flags().contains(HandleFlags::EXCLUSIVE));
        dh.clear_flags(HandleFlags::EXCLUSIVE);
        dh.write_unlock();
    }

    #[test]
    fn sync_and_close_idempotent() {
        let dh = handle();
        let catalog = crate::meta::MemCatalog::new();
        assert!(dh.sync_and_close(&catalog).is_ok());
        assert!(dh.sync_and_close(&catalog).is_ok());
    }
}
