//! Page reconciliation: the only path by which a dirty in-memory page
//! becomes durable.
//!
//! A reconcile walks one page, building cells into a working image. When an
//! item would overrun the target page size the split machine either records
//! a potential split point or starts writing completed chunks, so a page
//! that grows past its budget mid-build still comes out as valid disk
//! images. The result is recorded on the page as empty/replace/split and
//! the parent is marked modified.

pub mod bound;
pub mod cell;
pub mod col;
pub mod row;
pub mod scratch;
pub mod track;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::block::BlockStore;
use crate::btree::page::{MergeChild, MergePage, PageRef, PageType, Recno, ReconcileResult};
use crate::btree::{Tree, TreeConfig};
use crate::error::{EngineError, Result};

use bound::BoundList;
use cell::{CellBuilder, ItemCodec, PageHeader, HEADER_SIZE};
use scratch::ScratchPool;
use track::BlockTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconStats {
    pub pages: u64,
    pub chunks: u64,
    pub splits: u64,
    pub empties: u64,
    pub ovfl_writes: u64,
    pub ovfl_reuse: u64,
}

/// Salvage pass description for a column-store page: emit `missing`
/// deleted records first, skip `skip` records, then emit up to `take`
/// records (zero means no limit).
#[derive(Debug, Clone, Default)]
pub struct SalvageCookie {
    pub missing: u64,
    pub skip: u64,
    pub take: u64,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitState {
    /// Tracking split checkpoints inside the first split-size windows.
    Boundary,
    /// Past the boundary windows, filling up to the max page size.
    Max,
    /// No further split points; chunks are written as they fill.
    TrackingOff,
}

/// Reconcile context, created lazily per tree and reused across its pages.
pub(crate) struct ReconCtx {
    pub(crate) cfg: TreeConfig,
    pub(crate) image: BytesMut,
    pub(crate) bnd: BoundList,
    pub(crate) cellb: CellBuilder,
    pub(crate) pool: ScratchPool,
    pub(crate) state: SplitState,
    pub(crate) ptype: PageType,
    /// Cell-byte budget of a full page (header excluded).
    pub(crate) page_limit: usize,
    /// Cell-byte budget of one split chunk.
    pub(crate) split_limit: usize,
    pub(crate) stats: ReconStats,
}

impl ReconCtx {
    pub(crate) fn new(cfg: &TreeConfig, codec: std::sync::Arc<dyn ItemCodec>) -> Self {
        Self {
            cfg: cfg.clone(),
            image: BytesMut::new(),
            bnd: BoundList::new(),
            cellb: CellBuilder::new(cfg, codec),
            pool: ScratchPool::new(),
            state: SplitState::TrackingOff,
            ptype: PageType::RowLeaf,
            page_limit: 0,
            split_limit: 0,
            stats: ReconStats::default(),
        }
    }

    /// Per-page setup: compute the target sizes and reset transient state.
    pub(crate) fn init(&mut self, ptype: PageType, start_recno: Recno) {
        let page_size = if ptype.is_internal() {
            self.cfg.int_page_max
        } else {
            self.cfg.leaf_page_max
        } as usize;
        let split_size = if ptype == PageType::ColFix {
            page_size
        } else {
            split_size(page_size, self.cfg.split_pct, self.cfg.alloc_size as usize)
        };
        self.page_limit = page_size - HEADER_SIZE;
        self.split_limit = split_size - HEADER_SIZE;
        self.state = if split_size == page_size {
            SplitState::TrackingOff
        } else {
            SplitState::Boundary
        };
        self.ptype = ptype;
        self.image.clear();
        self.bnd.reset(start_recno);
        self.cellb.page_reset();
    }

    /// Drop transient build state after a failed reconcile.
    pub(crate) fn reset(&mut self) {
        self.image.clear();
        self.bnd.reset(0);
    }

    /// Bytes still available before the next split decision.
    pub(crate) fn avail(&self) -> usize {
        let ff = self.image.len();
        match self.state {
            SplitState::Boundary => (self.bnd.last().start + self.split_limit).saturating_sub(ff),
            SplitState::Max => self.page_limit.saturating_sub(ff),
            SplitState::TrackingOff => {
                self.page_limit.saturating_sub(ff - self.bnd.last().start)
            }
        }
    }

    fn chunk_is_empty(&self) -> bool {
        self.bnd.last().entries == 0 && self.image.len() == self.bnd.last().start
    }

    /// Whether adding `need` bytes requires a split first. An item bigger
    /// than any budget is accepted into an empty chunk as an oversize
    /// image.
    pub(crate) fn need_split(&self, need: usize) -> bool {
        if need <= self.avail() {
            return false;
        }
        !(self.state == SplitState::TrackingOff && self.chunk_is_empty())
    }

    /// One step of the split machine.
    pub(crate) fn split(
        &mut self,
        store: &dyn BlockStore,
        track: &mut BlockTracker,
        next_recno: Recno,
    ) -> Result<()> {
        match self.state {
            SplitState::Boundary => {
                let ff = self.image.len();
                if self.chunk_is_empty() {
                    // Nothing to checkpoint in this window; fall through to
                    // the wide budget.
                    self.state = SplitState::Max;
                    return Ok(());
                }
                self.bnd.push(ff, next_recno, None);
                self.cellb.chunk_reset();
                if ff + self.split_limit > self.page_limit {
                    self.state = SplitState::Max;
                }
                trace!(at = ff, "split boundary recorded");
                Ok(())
            }
            SplitState::Max => {
                // The image overran the max page size: write every
                // completed chunk, then slide the remnant to the front of
                // the working buffer.
                let last_start = self.bnd.last().start;
                for i in 0..self.bnd.len() - 1 {
                    let end = self.bnd.get(i + 1).start;
                    self.write_chunk(store, track, i, end)?;
                }
                let ff = self.image.len();
                self.image.copy_within(last_start..ff, 0);
                self.image.truncate(ff - last_start);
                self.bnd.last_mut().start = 0;
                self.state = SplitState::TrackingOff;
                Ok(())
            }
            SplitState::TrackingOff => {
                let end = self.image.len();
                let idx = self.bnd.len() - 1;
                self.write_chunk(store, track, idx, end)?;
                self.image.clear();
                self.bnd.push(0, next_recno, None);
                self.cellb.chunk_reset();
                Ok(())
            }
        }
    }

    /// Split until `need` bytes fit.
    pub(crate) fn ensure_space(
        &mut self,
        need: usize,
        next_recno: Recno,
        store: &dyn BlockStore,
        track: &mut BlockTracker,
    ) -> Result<()> {
        while self.need_split(need) {
            self.split(store, track, next_recno)?;
        }
        Ok(())
    }

    pub(crate) fn push_cell(&mut self, bytes: &[u8]) {
        self.image.extend_from_slice(bytes);
    }

    /// Account `n` records to the open chunk; the first key of a chunk is
    /// captured as its promoted key.
    pub(crate) fn note_entry(&mut self, n: u32, key: Option<&[u8]>) {
        let b = self.bnd.last_mut();
        if b.key.is_none() {
            if let Some(k) = key {
                b.key = Some(k.to_vec());
            }
        }
        b.entries += n;
    }

    /// Write one chunk: header, the boundary's cell range, and (on
    /// row-store leaves) the trailing zero-length key cell.
    fn write_chunk(
        &mut self,
        store: &dyn BlockStore,
        track: &mut BlockTracker,
        idx: usize,
        end: usize,
    ) -> Result<()> {
        let (start, recno, entries) = {
            let b = self.bnd.get(idx);
            (b.start, b.recno, b.entries)
        };
        let trailing = self.ptype == PageType::RowLeaf;
        let body = &self.image[start..end];
        let mut chunk = self.pool.get(HEADER_SIZE + body.len() + 1);
        PageHeader {
            ptype: self.ptype,
            recno: if self.ptype.is_row() { 0 } else { recno },
            entries,
            data_len: (body.len() + usize::from(trailing)) as u32,
        }
        .pack(chunk.buf_mut());
        chunk.extend_from_slice(body);
        if trailing {
            cell::pack_key(chunk.buf_mut(), 0, &[]);
        }
        let off = store.write(chunk.buf().as_ref())?;
        track.track_block(off);
        self.bnd.get_mut(idx).off = Some(off);
        self.stats.chunks += 1;
        trace!(addr = off.addr, size = off.size, entries, "chunk written");
        Ok(())
    }

    /// Write the trailing chunk. If nothing was written yet the whole image
    /// fit inside the page: collapse the recorded boundaries and emit one
    /// chunk.
    pub(crate) fn split_finish(
        &mut self,
        store: &dyn BlockStore,
        track: &mut BlockTracker,
    ) -> Result<()> {
        if self.bnd.written() == 0 {
            if self.image.is_empty() && self.bnd.total_entries() == 0 {
                return Ok(());
            }
            self.bnd.collapse();
            let end = self.image.len();
            return self.write_chunk(store, track, 0, end);
        }
        let idx = self.bnd.len() - 1;
        if self.bnd.last().entries > 0 || self.image.len() > self.bnd.last().start {
            let end = self.image.len();
            self.write_chunk(store, track, idx, end)?;
        }
        Ok(())
    }
}

/// `split_size = page_size * pct / 100`, clamped to an allocation-size
/// multiple.
fn split_size(page_size: usize, pct: u32, alloc: usize) -> usize {
    let mut s = page_size * pct as usize / 100;
    s -= s % alloc;
    if s == 0 {
        s = alloc;
    }
    s.min(page_size)
}

/// Reconcile one dirty page into persistent disk images.
///
/// Single-writer per page: callers serialize reconciles. On success the
/// page's result records empty/replace/split, the page is clean (unless a
/// concurrent append landed mid-walk), and the parent is marked modified.
/// On failure everything written this pass is released and the page stays
/// dirty for retry.
pub fn reconcile(
    tree: &Tree,
    page: &PageRef,
    mut salvage: Option<&mut SalvageCookie>,
) -> Result<()> {
    if !page.is_dirty() {
        return Err(EngineError::InvalidState(
            "reconcile of an unmodified page".to_string(),
        ));
    }
    if salvage.is_some() && !matches!(page.ptype(), PageType::ColVar | PageType::ColFix) {
        return Err(EngineError::InvalidState(
            "salvage reconcile of a non-column leaf".to_string(),
        ));
    }

    let gen = page.write_gen();
    let mut guard = tree.recon.lock();
    let ctx = guard.get_or_insert_with(|| ReconCtx::new(&tree.config, tree.codec.clone()));
    let mut state = page.state.write();
    let store = tree.store.as_ref();

    state.track.begin();
    let start_recno = match salvage.as_deref() {
        Some(s) => state.recno.saturating_sub(s.missing),
        None => state.recno,
    };
    ctx.init(page.ptype(), start_recno);

    let walked = match page.ptype() {
        PageType::RowLeaf => row::rec_row_leaf(ctx, &mut state, store),
        PageType::RowInt => row::rec_row_int(ctx, &mut state, store),
        PageType::ColVar => col::rec_col_var(ctx, &mut state, store, salvage.as_deref_mut()),
        PageType::ColFix => col::rec_col_fix(ctx, &mut state, store, salvage.as_deref_mut()),
        PageType::ColInt => col::rec_col_int(ctx, &mut state, store),
    };
    let finished = walked.and_then(|()| {
        let s = &mut *state;
        ctx.split_finish(store, &mut s.track)
    });

    if let Err(e) = finished {
        let _ = state.track.abort(store);
        ctx.reset();
        debug!(error = %e, "reconcile failed; page left dirty");
        return Err(e);
    }

    // Wrap-up: discard the prior reconcile result, record the new one.
    if let Some(old) = state.disk.take() {
        state.track.schedule_free(old);
    }
    if let ReconcileResult::Split(old) =
        std::mem::replace(&mut state.result, ReconcileResult::None)
    {
        for c in old.children {
            state.track.schedule_free(c.off);
        }
    }

    let written: Vec<_> = ctx.bnd.iter().filter(|b| b.off.is_some()).cloned().collect();
    let result = match written.len() {
        0 => {
            ctx.stats.empties += 1;
            ReconcileResult::Empty
        }
        1 => {
            let off = written[0].off.expect("written boundary has address");
            state.disk = Some(off);
            ReconcileResult::Replace(off)
        }
        _ => {
            ctx.stats.splits += 1;
            let ptype = if page.ptype().is_row() {
                PageType::RowInt
            } else {
                PageType::ColInt
            };
            let children = written
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    let key = if i == 0 {
                        // Preserve the original reference key so inserts
                        // smaller than any key in the subtree still route
                        // into the first chunk.
                        state
                            .ref_key
                            .clone()
                            .or_else(|| b.key.clone())
                            .unwrap_or_default()
                    } else {
                        b.key.clone().unwrap_or_default()
                    };
                    MergeChild {
                        key,
                        recno: b.recno,
                        off: b.off.expect("written boundary has address"),
                    }
                })
                .collect();
            ReconcileResult::Split(MergePage { ptype, children })
        }
    };
    debug!(
        ptype = ?page.ptype(),
        chunks = written.len(),
        entries = ctx.bnd.total_entries(),
        "reconcile complete"
    );
    state.result = result;
    state.track.end(store)?;

    ctx.stats.pages += 1;
    page.publish_disk_gen(gen);
    page.clear_dirty_if(gen);
    page.mark_parent_dirty();
    Ok(())
}
