//! The handle registry: at most one live handle per (name, checkpoint),
//! found or created under the process-wide schema lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block::BlockStore;
use crate::btree::Tree;
use crate::error::{EngineError, Result};
use crate::handle::{DataHandle, HandleFlags, LockMode};
use crate::meta::Catalog;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const EXCLUSIVE = 1 << 0;
        const LOCK_ONLY = 1 << 1;
        const SALVAGE = 1 << 2;
        const UPGRADE = 1 << 3;
        const VERIFY = 1 << 4;
    }
}

impl OpenFlags {
    fn special(self) -> HandleFlags {
        let mut f = HandleFlags::empty();
        if self.contains(OpenFlags::SALVAGE) {
            f |= HandleFlags::SALVAGE;
        }
        if self.contains(OpenFlags::UPGRADE) {
            f |= HandleFlags::UPGRADE;
        }
        if self.contains(OpenFlags::VERIFY) {
            f |= HandleFlags::VERIFY;
        }
        f
    }

    /// Special modes imply exclusive use.
    fn wants_exclusive(self) -> bool {
        self.intersects(
            OpenFlags::EXCLUSIVE | OpenFlags::SALVAGE | OpenFlags::UPGRADE | OpenFlags::VERIFY,
        )
    }
}

/// A handle acquired through `get`: the lock mode rides along so `release`
/// can undo exactly what was taken.
#[derive(Debug)]
pub struct HandleRef {
    dh: Arc<DataHandle>,
    mode: LockMode,
}

impl HandleRef {
    pub fn handle(&self) -> &Arc<DataHandle> {
        &self.dh
    }

    pub fn tree(&self) -> Result<Arc<Tree>> {
        self.dh.tree()
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == LockMode::Write
    }
}

impl std::ops::Deref for HandleRef {
    type Target = DataHandle;

    fn deref(&self) -> &DataHandle {
        &self.dh
    }
}

#[derive(Debug, Default)]
struct RegistryStats {
    opens: AtomicU64,
    closes: AtomicU64,
    busy: AtomicU64,
    sweeps: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub opens: u64,
    pub closes: u64,
    pub busy: u64,
    pub sweeps: u64,
}

pub struct HandleRegistry {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn BlockStore>,
    /// The schema lock; the handle list is stable only while it is held.
    schema: Mutex<Vec<Arc<DataHandle>>>,
    stats: RegistryStats,
}

impl HandleRegistry {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn BlockStore>) -> Self {
        Self {
            catalog,
            store,
            schema: Mutex::new(Vec::new()),
            stats: RegistryStats::default(),
        }
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            opens: self.stats.opens.load(Ordering::Relaxed),
            closes: self.stats.closes.load(Ordering::Relaxed),
            busy: self.stats.busy.load(Ordering::Relaxed),
            sweeps: self.stats.sweeps.load(Ordering::Relaxed),
        }
    }

    /// Number of handles currently linked into the registry.
    pub fn len(&self) -> usize {
        self.schema.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schema.lock().is_empty()
    }

    /// Find or create the handle for `(name, checkpoint)` and lock it:
    /// read-locked and open for plain access, write-locked for exclusive
    /// access. Exclusive requests fail busy rather than block.
    pub fn get(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        flags: OpenFlags,
    ) -> Result<HandleRef> {
        let want_exclusive = flags.wants_exclusive();
        let mut list = self.schema.lock();
        let existing = list
            .iter()
            .find(|d| d.name() == name && d.checkpoint() == checkpoint)
            .cloned();
        let (dh, mut mode, created) = match existing {
            Some(dh) => {
                let mode = dh.acquire(want_exclusive).inspect_err(|_| {
                    self.stats.busy.fetch_add(1, Ordering::Relaxed);
                })?;
                (dh, mode, false)
            }
            None => {
                // Read the configuration first so a missing table
                // allocates nothing. The catalog's not-found surfaces
                // unchanged as the handle manager's not-found.
                let config = self.catalog.read(name)?;
                let dh = Arc::new(DataHandle::new(name, checkpoint, config));
                let locked = dh.try_write_lock();
                debug_assert!(locked, "fresh handle lock cannot be contended");
                dh.set_flags(HandleFlags::EXCLUSIVE);
                list.push(dh.clone());
                debug!(name, ?checkpoint, "handle created");
                (dh, LockMode::Write, true)
            }
        };
        dh.ref_inc();

        if flags.contains(OpenFlags::LOCK_ONLY) {
            dh.set_flags(HandleFlags::LOCK_ONLY);
            return Ok(HandleRef { dh, mode });
        }
        if !dh.is_open() {
            debug_assert_eq!(mode, LockMode::Write, "opener holds the write lock");
            if let Err(e) = self.open_handle(&dh, flags) {
                // Undo exactly the allocations that succeeded.
                dh.ref_dec();
                dh.clear_flags(HandleFlags::EXCLUSIVE | flags.special());
                dh.write_unlock();
                if created {
                    list.retain(|d| !Arc::ptr_eq(d, &dh));
                }
                return Err(e);
            }
            dh.set_flags(HandleFlags::OPEN | flags.special());
            self.stats.opens.fetch_add(1, Ordering::Relaxed);
            if !want_exclusive {
                dh.clear_flags(HandleFlags::EXCLUSIVE);
                dh.downgrade_lock();
                mode = LockMode::Read;
            }
        } else if mode == LockMode::Write {
            dh.set_flags(flags.special());
        }
        Ok(HandleRef { dh, mode })
    }

    fn open_handle(&self, dh: &Arc<DataHandle>, _flags: OpenFlags) -> Result<()> {
        let config = self.catalog.tree_config(dh.name())?;
        dh.set_config(config.render());
        let tree = Tree::open(
            dh.name(),
            config,
            self.store.clone(),
            self.catalog.as_ref(),
            dh.checkpoint().unwrap_or(""),
        )?;
        dh.set_tree(Some(Arc::new(tree)));
        info!(name = dh.name(), checkpoint = ?dh.checkpoint(), "handle opened");
        Ok(())
    }

    /// Drop one reference and its lock. Deliberately lock-free with
    /// respect to the schema lock: a `get` blocked on this handle's lock
    /// may be holding it. The handle itself stays linked until shutdown;
    /// `sweep` may close (not free) idle handles.
    pub fn release(&self, href: HandleRef) -> Result<()> {
        let HandleRef { dh, mode } = href;
        dh.ref_dec();
        dh.clear_flags(HandleFlags::LOCK_ONLY);
        let mut ret = Ok(());
        match mode {
            LockMode::Write => {
                // A special-mode handle does not outlive its operation.
                if dh.flags().intersects(HandleFlags::special()) {
                    ret = dh.sync_and_close(self.catalog.as_ref());
                    self.stats.closes.fetch_add(1, Ordering::Relaxed);
                }
                dh.clear_flags(HandleFlags::EXCLUSIVE);
                dh.write_unlock();
            }
            LockMode::Read => dh.read_unlock(),
        }
        ret
    }

    /// Close (but keep registered) every open handle no session points at.
    pub fn sweep(&self) -> Result<()> {
        let list = self.schema.lock();
        let mut first_err = None;
        for dh in list.iter() {
            if dh.refcnt() == 0 && dh.is_open() && dh.try_write_lock() {
                if let Err(e) = dh.sync_and_close(self.catalog.as_ref()) {
                    first_err.get_or_insert(e);
                }
                dh.write_unlock();
                self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
                self.stats.closes.fetch_add(1, Ordering::Relaxed);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `f` on every open, non-exclusive, non-metadata handle.
    pub fn apply(&self, f: &mut dyn FnMut(&Arc<DataHandle>) -> Result<()>) -> Result<()> {
        let list = self.schema.lock();
        for dh in list.iter() {
            let flags = dh.flags();
            if !flags.contains(HandleFlags::OPEN)
                || flags.contains(HandleFlags::EXCLUSIVE)
                || dh.is_metadata()
            {
                continue;
            }
            f(dh)?;
        }
        Ok(())
    }

    /// Close every handle for `name`, including all checkpoint handles.
    /// Transactional: if any handle is busy, none is touched.
    pub fn close_all(&self, name: &str) -> Result<()> {
        let list = self.schema.lock();
        let matches: Vec<_> = list
            .iter()
            .filter(|d| d.name() == name)
            .cloned()
            .collect();

        let mut locked: Vec<Arc<DataHandle>> = Vec::with_capacity(matches.len());
        for dh in &matches {
            if dh.try_write_lock() {
                locked.push(dh.clone());
            } else {
                for held in &locked {
                    held.write_unlock();
                }
                self.stats.busy.fetch_add(1, Ordering::Relaxed);
                warn!(name, "close-all rolled back, handle in use");
                return Err(EngineError::Busy(format!("table {name} is in use")));
            }
        }

        let mut first_err = None;
        for dh in &locked {
            if dh.is_open() {
                if let Err(e) = dh.sync_and_close(self.catalog.as_ref()) {
                    first_err.get_or_insert(e);
                }
                self.stats.closes.fetch_add(1, Ordering::Relaxed);
            }
            dh.write_unlock();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shutdown: close and unlink every user handle first (closing a user
    /// table may dirty, and thus re-open, the metadata table), re-scan for
    /// anything those closes linked in, then close the metadata handle
    /// last.
    pub fn discard_all(&self) -> Result<()> {
        let mut list = self.schema.lock();
        let mut first_err = None;
        loop {
            let Some(dh) = list.iter().find(|d| !d.is_metadata()).cloned() else {
                break;
            };
            if dh.try_write_lock() {
                if let Err(e) = dh.sync_and_close(self.catalog.as_ref()) {
                    first_err.get_or_insert(e);
                }
                dh.write_unlock();
                self.stats.closes.fetch_add(1, Ordering::Relaxed);
            } else {
                first_err.get_or_insert(EngineError::Busy(format!(
                    "handle {} still locked at shutdown",
                    dh.name()
                )));
            }
            list.retain(|d| !Arc::ptr_eq(d, &dh));
        }
        for dh in list.drain(..) {
            if dh.try_write_lock() {
                if let Err(e) = dh.sync_and_close(self.catalog.as_ref()) {
                    first_err.get_or_insert(e);
                }
                dh.write_unlock();
                self.stats.closes.fetch_add(1, Ordering::Relaxed);
            } else {
                first_err.get_or_insert(EngineError::Busy(format!(
                    "metadata handle {} still locked at shutdown",
                    dh.name()
                )));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
