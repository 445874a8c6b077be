use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::block::BlockOff;
use crate::reconcile::track::BlockTracker;

pub type Recno = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    ColFix,
    ColVar,
    ColInt,
    RowLeaf,
    RowInt,
}

impl PageType {
    pub fn is_row(&self) -> bool {
        matches!(self, PageType::RowLeaf | PageType::RowInt)
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, PageType::RowInt | PageType::ColInt)
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PageType::ColFix => 1,
            PageType::ColVar => 2,
            PageType::ColInt => 3,
            PageType::RowLeaf => 4,
            PageType::RowInt => 5,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            1 => PageType::ColFix,
            2 => PageType::ColVar,
            3 => PageType::ColInt,
            4 => PageType::RowLeaf,
            5 => PageType::RowInt,
            _ => return None,
        })
    }
}

/// A single entry in a per-slot update list. `None` data is a tombstone.
#[derive(Debug, Clone)]
pub struct Update {
    pub data: Option<Vec<u8>>,
}

impl Update {
    pub fn put(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    pub fn delete() -> Self {
        Self { data: None }
    }

    pub fn is_delete(&self) -> bool {
        self.data.is_none()
    }
}

/// Update lists are newest-first; the visible update is the head.
pub fn visible(updates: &[Update]) -> Option<&Update> {
    updates.first()
}

/// Where a slot's value lives: inline in the page image, or behind an
/// overflow block. Overflow values keep their bytes in memory so runs can be
/// compared and reuse decided without a block read.
#[derive(Debug, Clone)]
pub enum ValSource {
    Inline(Vec<u8>),
    Ovfl { off: BlockOff, data: Vec<u8> },
}

impl ValSource {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ValSource::Inline(d) => d,
            ValSource::Ovfl { data, .. } => data,
        }
    }

    pub fn ovfl_off(&self) -> Option<BlockOff> {
        match self {
            ValSource::Inline(_) => None,
            ValSource::Ovfl { off, .. } => Some(*off),
        }
    }
}

/// Keys inserted into a gap between existing slots, ordered.
pub type InsertList = BTreeMap<Vec<u8>, Vec<Update>>;

#[derive(Debug, Clone)]
pub struct RowSlot {
    pub key: Vec<u8>,
    pub value: ValSource,
    /// Newest-first updates to this slot.
    pub updates: Vec<Update>,
    /// Inserts sorting after this slot's key and before the next slot's.
    pub inserts: InsertList,
}

impl RowSlot {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: ValSource::Inline(value),
            updates: Vec::new(),
            inserts: InsertList::new(),
        }
    }
}

/// One variable-width column cell covering `rle` consecutive records.
#[derive(Debug, Clone)]
pub struct ColVarCell {
    /// `None` is a deleted run.
    pub data: Option<Vec<u8>>,
    pub rle: u64,
    /// Set when the run is backed by an overflow block on disk.
    pub ovfl: Option<BlockOff>,
}

impl ColVarCell {
    pub fn new(data: Vec<u8>, rle: u64) -> Self {
        Self {
            data: Some(data),
            rle,
            ovfl: None,
        }
    }

    pub fn deleted(rle: u64) -> Self {
        Self {
            data: None,
            rle,
            ovfl: None,
        }
    }
}

/// A parent's reference to one child.
#[derive(Debug, Clone)]
pub struct ChildRef {
    /// Routing key (row stores).
    pub key: Vec<u8>,
    /// Starting record number (column stores).
    pub recno: Recno,
    /// On-disk address, if the child has a persisted image.
    pub addr: Option<BlockOff>,
    /// In-memory child, if instantiated.
    pub page: Option<PageRef>,
}

#[derive(Debug, Clone)]
pub struct MergeChild {
    pub key: Vec<u8>,
    pub recno: Recno,
    pub off: BlockOff,
}

/// Transient internal page produced by a split; folded into the parent at
/// the parent's next reconcile, never persisted as its own level.
#[derive(Debug, Clone)]
pub struct MergePage {
    pub ptype: PageType,
    pub children: Vec<MergeChild>,
}

#[derive(Debug, Clone)]
pub enum ReconcileResult {
    /// No reconcile outcome pending.
    None,
    /// Every record was deleted; the parent drops its reference.
    Empty,
    /// A single replacement image.
    Replace(BlockOff),
    /// Multiple chunks; the merge page carries one reference per chunk.
    Split(MergePage),
}

impl ReconcileResult {
    pub fn is_none(&self) -> bool {
        matches!(self, ReconcileResult::None)
    }
}

#[derive(Debug)]
pub enum PageData {
    RowLeaf {
        /// Inserts sorting before the first slot's key.
        smallest: InsertList,
        slots: Vec<RowSlot>,
    },
    RowInt {
        children: Vec<ChildRef>,
    },
    ColVar {
        cells: Vec<ColVarCell>,
        /// Overwrites/deletes of records covered by `cells`, keyed by recno.
        updates: BTreeMap<Recno, Vec<Update>>,
        /// Records past the last cell, keyed by recno.
        append: BTreeMap<Recno, Vec<Update>>,
    },
    ColFix {
        /// One byte per record; on disk these pack to `fix_width` bits each.
        values: Vec<u8>,
        updates: BTreeMap<Recno, Vec<Update>>,
        append: BTreeMap<Recno, Vec<Update>>,
    },
    ColInt {
        children: Vec<ChildRef>,
    },
}

#[derive(Debug)]
pub struct PageState {
    /// Starting record number (column stores; zero for row stores).
    pub recno: Recno,
    /// Address of the page's persisted image, if any.
    pub disk: Option<BlockOff>,
    /// Key under which the parent references this page (row stores). Split
    /// merges propagate this, not the smallest in-memory key.
    pub ref_key: Option<Vec<u8>>,
    pub data: PageData,
    pub result: ReconcileResult,
    /// Blocks allocated or scheduled for discard by reconciles of this page.
    pub track: BlockTracker,
}

#[derive(Debug)]
pub struct Page {
    ptype: PageType,
    dirty: AtomicBool,
    write_gen: AtomicU64,
    disk_gen: AtomicU64,
    parent: RwLock<Weak<Page>>,
    pub state: RwLock<PageState>,
}

pub type PageRef = Arc<Page>;

impl Page {
    fn build(ptype: PageType, recno: Recno, data: PageData) -> PageRef {
        Arc::new(Page {
            ptype,
            dirty: AtomicBool::new(false),
            write_gen: AtomicU64::new(1),
            disk_gen: AtomicU64::new(0),
            parent: RwLock::new(Weak::new()),
            state: RwLock::new(PageState {
                recno,
                disk: None,
                ref_key: None,
                data,
                result: ReconcileResult::None,
                track: BlockTracker::new(),
            }),
        })
    }

    /// Rebuild a page from its parsed disk image, adopting the overflow
    /// tracking entries discovered while parsing.
    pub(crate) fn from_loaded(
        ptype: PageType,
        recno: Recno,
        data: PageData,
        track: BlockTracker,
    ) -> PageRef {
        let page = Self::build(ptype, recno, data);
        page.state.write().track = track;
        page
    }

    pub fn new_row_leaf() -> PageRef {
        Self::build(
            PageType::RowLeaf,
            0,
            PageData::RowLeaf {
                smallest: InsertList::new(),
                slots: Vec::new(),
            },
        )
    }

    pub fn new_row_int(children: Vec<ChildRef>) -> PageRef {
        Self::build(PageType::RowInt, 0, PageData::RowInt { children })
    }

    pub fn new_col_var(start: Recno) -> PageRef {
        Self::build(
            PageType::ColVar,
            start,
            PageData::ColVar {
                cells: Vec::new(),
                updates: BTreeMap::new(),
                append: BTreeMap::new(),
            },
        )
    }

    pub fn new_col_fix(start: Recno) -> PageRef {
        Self::build(
            PageType::ColFix,
            start,
            PageData::ColFix {
                values: Vec::new(),
                updates: BTreeMap::new(),
                append: BTreeMap::new(),
            },
        )
    }

    pub fn new_col_int(children: Vec<ChildRef>) -> PageRef {
        let start = children.first().map_or(1, |c| c.recno);
        Self::build(PageType::ColInt, start, PageData::ColInt { children })
    }

    /// Build the in-memory internal page that adopts a split's chunks.
    pub fn from_merge(merge: MergePage) -> PageRef {
        let children: Vec<ChildRef> = merge
            .children
            .into_iter()
            .map(|c| ChildRef {
                key: c.key,
                recno: c.recno,
                addr: Some(c.off),
                page: None,
            })
            .collect();
        let page = match merge.ptype {
            PageType::RowInt => Self::new_row_int(children),
            PageType::ColInt => Self::new_col_int(children),
            _ => unreachable!("merge pages are internal"),
        };
        page.mark_dirty();
        page
    }

    pub fn ptype(&self) -> PageType {
        self.ptype
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark this page (and every ancestor) modified.
    pub fn mark_dirty(self: &Arc<Self>) {
        self.write_gen.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        let mut cur = self.parent.read().upgrade();
        while let Some(p) = cur {
            p.dirty.store(true, Ordering::Release);
            cur = p.parent.read().upgrade();
        }
    }

    /// Mark every ancestor (but not this page) modified; reconciliation
    /// results are consumed by the parent's own reconcile.
    pub fn mark_parent_dirty(&self) {
        let mut cur = self.parent.read().upgrade();
        while let Some(p) = cur {
            p.dirty.store(true, Ordering::Release);
            cur = p.parent.read().upgrade();
        }
    }

    /// Snapshot of the write generation, taken before a reconcile walks the
    /// page. Appends racing past this point stay dirty for the next pass.
    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    /// Clear the dirty bit iff no modification landed after `gen`.
    pub fn clear_dirty_if(&self, gen: u64) -> bool {
        if self.write_gen.load(Ordering::Acquire) == gen {
            self.dirty.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Publish the reconcile snapshot point with release semantics.
    pub fn publish_disk_gen(&self, gen: u64) {
        self.disk_gen.store(gen, Ordering::Release);
    }

    pub fn disk_gen(&self) -> u64 {
        self.disk_gen.load(Ordering::Acquire)
    }

    pub fn set_parent(self: &Arc<Self>, parent: &PageRef) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    pub fn take_result(&self) -> ReconcileResult {
        std::mem::replace(&mut self.state.write().result, ReconcileResult::None)
    }

    pub fn disk_off(&self) -> Option<BlockOff> {
        self.state.read().disk
    }

    // ---- mutation helpers -------------------------------------------------

    /// Insert or overwrite a row-store key.
    pub fn row_insert(self: &Arc<Self>, key: &[u8], value: &[u8]) {
        {
            let mut state = self.state.write();
            let PageData::RowLeaf { smallest, slots } = &mut state.data else {
                panic!("row_insert on non-row-leaf page");
            };
            let idx = slots.partition_point(|s| s.key.as_slice() < key);
            if idx < slots.len() && slots[idx].key == key {
                slots[idx].updates.insert(0, Update::put(value));
            } else if idx == 0 {
                smallest
                    .entry(key.to_vec())
                    .or_default()
                    .insert(0, Update::put(value));
            } else {
                slots[idx - 1]
                    .inserts
                    .entry(key.to_vec())
                    .or_default()
                    .insert(0, Update::put(value));
            }
        }
        self.mark_dirty();
    }

    /// Delete a row-store key.
    pub fn row_delete(self: &Arc<Self>, key: &[u8]) {
        {
            let mut state = self.state.write();
            let PageData::RowLeaf { smallest, slots } = &mut state.data else {
                panic!("row_delete on non-row-leaf page");
            };
            let idx = slots.partition_point(|s| s.key.as_slice() < key);
            if idx < slots.len() && slots[idx].key == key {
                slots[idx].updates.insert(0, Update::delete());
            } else if idx == 0 {
                smallest
                    .entry(key.to_vec())
                    .or_default()
                    .insert(0, Update::delete());
            } else {
                slots[idx - 1]
                    .inserts
                    .entry(key.to_vec())
                    .or_default()
                    .insert(0, Update::delete());
            }
        }
        self.mark_dirty();
    }

    /// Record number one past the last record on a column page.
    pub fn col_next_recno(&self) -> Recno {
        let state = self.state.read();
        match &state.data {
            PageData::ColVar { cells, append, .. } => {
                let span: u64 = cells.iter().map(|c| c.rle).sum();
                let base = state.recno + span;
                append.keys().next_back().map_or(base, |r| (r + 1).max(base))
            }
            PageData::ColFix { values, append, .. } => {
                let base = state.recno + values.len() as u64;
                append.keys().next_back().map_or(base, |r| (r + 1).max(base))
            }
            _ => panic!("col_next_recno on non-column page"),
        }
    }

    /// Append a value at the next record number; returns the recno used.
    pub fn col_append(self: &Arc<Self>, value: &[u8]) -> Recno {
        let recno = self.col_next_recno();
        self.col_append_at(recno, Some(value));
        recno
    }

    /// Append at an explicit record number, leaving a gap the reconciler
    /// fills with deleted (or zero) records.
    pub fn col_append_at(self: &Arc<Self>, recno: Recno, value: Option<&[u8]>) {
        {
            let mut state = self.state.write();
            let upd = match value {
                Some(v) => Update::put(v),
                None => Update::delete(),
            };
            match &mut state.data {
                PageData::ColVar { append, .. } | PageData::ColFix { append, .. } => {
                    append.entry(recno).or_default().insert(0, upd);
                }
                _ => panic!("col_append_at on non-column page"),
            }
        }
        self.mark_dirty();
    }

    /// Overwrite (or delete, with `None`) a column record. Records past the
    /// on-page cells still live in the append list; their overwrites land
    /// there.
    pub fn col_update(self: &Arc<Self>, recno: Recno, value: Option<&[u8]>) {
        {
            let mut state = self.state.write();
            let upd = match value {
                Some(v) => Update::put(v),
                None => Update::delete(),
            };
            let recno0 = state.recno;
            match &mut state.data {
                PageData::ColVar {
                    cells,
                    updates,
                    append,
                } => {
                    let span: u64 = cells.iter().map(|c| c.rle).sum();
                    let target = if recno < recno0 + span { updates } else { append };
                    target.entry(recno).or_default().insert(0, upd);
                }
                PageData::ColFix {
                    values,
                    updates,
                    append,
                } => {
                    let target = if recno < recno0 + values.len() as u64 {
                        updates
                    } else {
                        append
                    };
                    target.entry(recno).or_default().insert(0, upd);
                }
                _ => panic!("col_update on non-column page"),
            }
        }
        self.mark_dirty();
    }

    /// In-memory children of an internal page.
    pub fn child_pages(&self) -> Vec<PageRef> {
        let state = self.state.read();
        match &state.data {
            PageData::RowInt { children } | PageData::ColInt { children } => children
                .iter()
                .filter_map(|c| c.page.clone())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_insert_routes_to_slot_and_gaps() {
        let page = Page::new_row_leaf();
        {
            let mut state = page.state.write();
            let PageData::RowLeaf { slots, .. } = &mut state.data else {
                unreachable!()
            };
            slots.push(RowSlot::new(b"b".to_vec(), b"1".to_vec()));
            slots.push(RowSlot::new(b"d".to_vec(), b"2".to_vec()));
        }
        page.row_insert(b"a", b"small");
        page.row_insert(b"c", b"mid");
        page.row_insert(b"b", b"newer");
        page.row_insert(b"z", b"tail");

        let state = page.state.read();
        let PageData::RowLeaf { smallest, slots } = &state.data else {
            unreachable!()
        };
        assert!(smallest.contains_key(b"a".as_slice()));
        assert!(slots[0].inserts.contains_key(b"c".as_slice()));
        assert!(slots[1].inserts.contains_key(b"z".as_slice()));
        assert_eq!(
            visible(&slots[0].updates).unwrap().data.as_deref(),
            Some(b"newer".as_ref())
        );
    }

    #[test]
    fn newest_update_wins() {
        let page = Page::new_row_leaf();
        page.row_insert(b"k", b"v1");
        page.row_insert(b"k", b"v2");
        page.row_delete(b"k");
        let state = page.state.read();
        let PageData::RowLeaf { smallest, .. } = &state.data else {
            unreachable!()
        };
        assert!(visible(&smallest[b"k".as_slice()]).unwrap().is_delete());
    }

    #[test]
    fn dirty_propagates_to_ancestors() {
        let leaf = Page::new_row_leaf();
        let root = Page::new_row_int(vec![ChildRef {
            key: Vec::new(),
            recno: 0,
            addr: None,
            page: Some(leaf.clone()),
        }]);
        // from_merge/new_row_int do not link parents; do it explicitly.
        leaf.set_parent(&root);
        assert!(!root.is_dirty());
        leaf.row_insert(b"k", b"v");
        assert!(leaf.is_dirty());
        assert!(root.is_dirty());
    }

    #[test]
    fn col_append_assigns_consecutive_recnos() {
        let page = Page::new_col_var(1);
        assert_eq!(page.col_append(b"a"), 1);
        assert_eq!(page.col_append(b"b"), 2);
        page.col_append_at(10, Some(b"gap"));
        assert_eq!(page.col_next_recno(), 11);
    }

    #[test]
    fn clear_dirty_respects_generation() {
        let page = Page::new_row_leaf();
        page.row_insert(b"k", b"v");
        let gen = page.write_gen();
        page.row_insert(b"k2", b"v2");
        assert!(!page.clear_dirty_if(gen));
        assert!(page.is_dirty());
        assert!(page.clear_dirty_if(page.write_gen()));
        assert!(!page.is_dirty());
    }
}
