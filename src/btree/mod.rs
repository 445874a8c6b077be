pub mod load;
pub mod page;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::block::{BlockOff, BlockStore};
use crate::error::{EngineError, Result};
use crate::meta::Catalog;
use crate::reconcile::cell::{ItemCodec, NoopCodec};
use crate::reconcile::{ReconCtx, ReconStats};

pub use page::{
    ChildRef, ColVarCell, InsertList, MergeChild, MergePage, Page, PageData, PageRef, PageState,
    PageType, Recno, ReconcileResult, RowSlot, Update, ValSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Row,
    ColVar,
    ColFix,
}

impl TreeKind {
    pub fn leaf_type(&self) -> PageType {
        match self {
            TreeKind::Row => PageType::RowLeaf,
            TreeKind::ColVar => PageType::ColVar,
            TreeKind::ColFix => PageType::ColFix,
        }
    }
}

/// Per-tree tuning. The split percentage is a tuning knob with no one
/// right value; it defaults to 75 and is clamped at open.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub kind: TreeKind,
    pub leaf_page_max: u32,
    pub int_page_max: u32,
    pub split_pct: u32,
    /// Items larger than this are promoted to overflow blocks.
    pub leaf_item_max: u32,
    pub alloc_size: u32,
    pub prefix_compression: bool,
    pub internal_key_truncate: bool,
    /// Bits per record on fixed-width column trees (1..=8).
    pub fix_width: u8,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            kind: TreeKind::Row,
            leaf_page_max: 32 * 1024,
            int_page_max: 16 * 1024,
            split_pct: 75,
            leaf_item_max: 4 * 1024,
            alloc_size: 512,
            prefix_compression: true,
            internal_key_truncate: true,
            fix_width: 8,
        }
    }
}

impl TreeConfig {
    /// Clamp tuning values into their legal ranges.
    pub fn normalize(mut self) -> Self {
        self.split_pct = self.split_pct.clamp(25, 100);
        self.alloc_size = self.alloc_size.max(64);
        self.fix_width = self.fix_width.clamp(1, 8);
        self.leaf_page_max = self.leaf_page_max.max(self.alloc_size);
        self.int_page_max = self.int_page_max.max(self.alloc_size);
        self
    }

    /// The opaque configuration string recorded in the catalog.
    pub fn render(&self) -> String {
        let kind = match self.kind {
            TreeKind::Row => "row",
            TreeKind::ColVar => "col_var",
            TreeKind::ColFix => "col_fix",
        };
        format!(
            "kind={kind},leaf_page_max={},int_page_max={},split_pct={},leaf_item_max={},alloc_size={},prefix_compression={},internal_key_truncate={},fix_width={}",
            self.leaf_page_max,
            self.int_page_max,
            self.split_pct,
            self.leaf_item_max,
            self.alloc_size,
            self.prefix_compression,
            self.internal_key_truncate,
            self.fix_width
        )
    }
}

/// One open B-tree: a root page, its block store, and the reconcile
/// context reused across this tree's pages.
pub struct Tree {
    pub name: String,
    pub config: TreeConfig,
    pub store: Arc<dyn BlockStore>,
    pub(crate) codec: Arc<dyn ItemCodec>,
    root: RwLock<Option<PageRef>>,
    pub(crate) recon: Mutex<Option<ReconCtx>>,
    readonly: bool,
}

impl Tree {
    pub fn create(name: &str, config: TreeConfig, store: Arc<dyn BlockStore>) -> Self {
        Self::create_with_codec(name, config, store, Arc::new(NoopCodec))
    }

    pub fn create_with_codec(
        name: &str,
        config: TreeConfig,
        store: Arc<dyn BlockStore>,
        codec: Arc<dyn ItemCodec>,
    ) -> Self {
        let config = config.normalize();
        let root = match config.kind {
            TreeKind::Row => Page::new_row_leaf(),
            TreeKind::ColVar => Page::new_col_var(1),
            TreeKind::ColFix => Page::new_col_fix(1),
        };
        Self {
            name: name.to_string(),
            config,
            store,
            codec,
            root: RwLock::new(Some(root)),
            recon: Mutex::new(None),
            readonly: false,
        }
    }

    /// Open a tree from its checkpoint cookie. A missing live cookie means
    /// the tree was never checkpointed and starts empty; a missing named
    /// checkpoint is an error.
    pub fn open(
        name: &str,
        config: TreeConfig,
        store: Arc<dyn BlockStore>,
        catalog: &dyn Catalog,
        checkpoint: &str,
    ) -> Result<Self> {
        let config = config.normalize();
        let codec: Arc<dyn ItemCodec> = Arc::new(NoopCodec);
        let cookie = match catalog.checkpoint_addr(name, checkpoint) {
            Ok(off) => Some(off),
            Err(e) if e.is_not_found() && checkpoint.is_empty() => None,
            Err(e) => return Err(e),
        };
        let root = match cookie {
            Some(off) if off.is_valid() => {
                let page = load::read_page(store.as_ref(), off, &config, codec.as_ref())?;
                page.state.write().disk = Some(off);
                Some(page)
            }
            _ => match config.kind {
                TreeKind::Row => Some(Page::new_row_leaf()),
                TreeKind::ColVar => Some(Page::new_col_var(1)),
                TreeKind::ColFix => Some(Page::new_col_fix(1)),
            },
        };
        debug!(name, checkpoint, "opened tree");
        Ok(Self {
            name: name.to_string(),
            config,
            store,
            codec,
            root: RwLock::new(root),
            recon: Mutex::new(None),
            readonly: !checkpoint.is_empty(),
        })
    }

    pub fn root(&self) -> Option<PageRef> {
        self.root.read().clone()
    }

    pub fn set_root(&self, page: PageRef) {
        *self.root.write() = Some(page);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_dirty(&self) -> bool {
        self.root.read().as_ref().is_some_and(|r| r.is_dirty())
    }

    /// Reconcile statistics accumulated by this tree's context.
    pub fn recon_stats(&self) -> ReconStats {
        self.recon
            .lock()
            .as_ref()
            .map(|c| c.stats)
            .unwrap_or_default()
    }

    /// Persist every dirty page and record the root cookie for
    /// `checkpoint` (the empty name is the live tree).
    pub fn checkpoint(&self, catalog: &dyn Catalog, checkpoint: &str) -> Result<()> {
        if self.readonly {
            return Err(EngineError::InvalidState(format!(
                "checkpoint of read-only tree {}",
                self.name
            )));
        }
        let cookie = loop {
            let Some(root) = self.root() else {
                break BlockOff::invalid();
            };
            self.sync_page(&root)?;
            match root.take_result() {
                ReconcileResult::None => {
                    break root.disk_off().unwrap_or_else(BlockOff::invalid);
                }
                ReconcileResult::Empty => break BlockOff::invalid(),
                ReconcileResult::Replace(off) => break off,
                ReconcileResult::Split(merge) => {
                    // The root split: adopt the merge page as the new root
                    // and persist it on the next pass.
                    info!(name = %self.name, children = merge.children.len(), "root split");
                    let new_root = Page::from_merge(merge);
                    *self.root.write() = Some(new_root);
                    continue;
                }
            }
        };
        catalog.set_checkpoint_addr(&self.name, checkpoint, cookie)?;
        debug!(name = %self.name, checkpoint, addr = cookie.addr, "checkpoint complete");
        Ok(())
    }

    /// Post-order sync: children first, so a parent's walk sees their
    /// reconcile results; then fold those results into the parent's
    /// reference list.
    fn sync_page(&self, page: &PageRef) -> Result<()> {
        for child in page.child_pages() {
            self.sync_page(&child)?;
        }
        if page.is_dirty() {
            crate::reconcile::reconcile(self, page, None)?;
            if page.ptype().is_internal() {
                self.fold_children(page);
            }
        }
        Ok(())
    }

    /// Apply consumed child results to an internal page's reference list:
    /// replaced children update in place, emptied children drop out, and a
    /// split child's merge page is spliced in flat.
    fn fold_children(&self, page: &PageRef) {
        let mut state = page.state.write();
        let (PageData::RowInt { children } | PageData::ColInt { children }) = &mut state.data
        else {
            return;
        };
        let old = std::mem::take(children);
        for mut child in old {
            let Some(cp) = child.page.clone() else {
                children.push(child);
                continue;
            };
            match cp.take_result() {
                ReconcileResult::None => children.push(child),
                ReconcileResult::Empty => {
                    debug!(name = %self.name, "dropping emptied child reference");
                }
                ReconcileResult::Replace(off) => {
                    child.addr = Some(off);
                    children.push(child);
                }
                ReconcileResult::Split(merge) => {
                    for (i, mc) in merge.children.into_iter().enumerate() {
                        // The first merged entry keeps the original
                        // reference's key: inserts smaller than any key in
                        // the subtree must still route into it.
                        let key = if i == 0 { child.key.clone() } else { mc.key };
                        children.push(ChildRef {
                            key,
                            recno: mc.recno,
                            addr: Some(mc.off),
                            page: None,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;
    use crate::meta::{Catalog as _, MemCatalog, LIVE_CHECKPOINT};

    #[test]
    fn config_normalize_clamps() {
        let cfg = TreeConfig {
            split_pct: 5,
            fix_width: 0,
            ..TreeConfig::default()
        }
        .normalize();
        assert_eq!(cfg.split_pct, 25);
        assert_eq!(cfg.fix_width, 1);
    }

    #[test]
    fn checkpoint_of_fresh_tree_records_invalid_cookie() {
        let store = Arc::new(MemBlockStore::new());
        let catalog = MemCatalog::new();
        catalog.create("t", TreeConfig::default()).unwrap();
        let tree = Tree::create("t", TreeConfig::default(), store);
        tree.checkpoint(&catalog, LIVE_CHECKPOINT).unwrap();
        let cookie = catalog.checkpoint_addr("t", LIVE_CHECKPOINT).unwrap();
        assert!(!cookie.is_valid());
    }

    #[test]
    fn named_checkpoint_open_is_readonly() {
        let store = Arc::new(MemBlockStore::new());
        let catalog = MemCatalog::new();
        catalog.create("t", TreeConfig::default()).unwrap();
        let tree = Tree::create("t", TreeConfig::default(), store.clone());
        tree.root().unwrap().row_insert(b"k", b"v");
        tree.checkpoint(&catalog, "snap").unwrap();
        let snap = Tree::open("t", TreeConfig::default(), store, &catalog, "snap").unwrap();
        assert!(snap.is_readonly());
        assert!(snap
            .checkpoint(&catalog, "snap2")
            .is_err());
    }
}
