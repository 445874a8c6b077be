//! Column-store page walks: run-length encoded variable-width leaves,
//! bit-packed fixed-width leaves, and column internal pages.

use bytes::BytesMut;

use crate::block::{BlockOff, BlockStore};
use crate::btree::page::{visible, PageData, PageState, Recno, Update};
use crate::error::{EngineError, Result};
use crate::reconcile::cell::{self, RecEnv};
use crate::reconcile::row::resolve_children;
use crate::reconcile::track::BlockTracker;
use crate::reconcile::{ReconCtx, SalvageCookie};

/// Salvage counters for one pass over a column leaf. Ranges are clamped,
/// never asserted: overlapping salvage input is tolerated defensively.
struct SalvageState {
    active: bool,
    missing: u64,
    skip: u64,
    /// Remaining records to emit; `None` means unlimited.
    take: Option<u64>,
}

impl SalvageState {
    fn new(cookie: Option<&SalvageCookie>) -> Self {
        match cookie {
            None => Self {
                active: false,
                missing: 0,
                skip: 0,
                take: None,
            },
            Some(c) => Self {
                active: true,
                missing: c.missing,
                skip: c.skip,
                take: if c.take == 0 { None } else { Some(c.take) },
            },
        }
    }

    /// Clamp a run of `n` records: how many to drop from its front and how
    /// many to emit.
    fn admit(&mut self, n: u64) -> (u64, u64) {
        let dropped = self.skip.min(n);
        self.skip -= dropped;
        let rest = n - dropped;
        let emit = match self.take {
            None => rest,
            Some(t) => {
                let e = t.min(rest);
                self.take = Some(t - e);
                e
            }
        };
        (dropped, emit)
    }

    fn exhausted(&self) -> bool {
        self.take == Some(0)
    }

    fn finish(&self, cookie: Option<&mut SalvageCookie>) {
        if let Some(c) = cookie {
            c.skip = self.skip;
            c.take = self.take.unwrap_or(0);
            c.done = self.take.is_none_or(|t| t == 0);
        }
    }
}

/// An open run of identical records waiting to be flushed as one cell.
struct Run {
    data: Option<Vec<u8>>,
    rle: u64,
    start: Recno,
}

struct VarEmitter<'a, 'b> {
    ctx: &'a mut ReconCtx,
    track: &'a mut BlockTracker,
    store: &'b dyn BlockStore,
    run: Option<Run>,
}

impl VarEmitter<'_, '_> {
    /// Extend the open run if the next records match it (both deleted, or
    /// equal bytes); otherwise flush and start a new run.
    fn push(&mut self, data: Option<&[u8]>, n: u64, at: Recno) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if let Some(run) = &mut self.run {
            let matches = match (&run.data, data) {
                (None, None) => true,
                (Some(a), Some(b)) => a.as_slice() == b,
                _ => false,
            };
            if matches {
                run.rle += n;
                return Ok(());
            }
        }
        self.flush()?;
        self.run = Some(Run {
            data: data.map(|d| d.to_vec()),
            rle: n,
            start: at,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        let bytes = match &run.data {
            None => {
                let mut buf = BytesMut::new();
                cell::pack_del(&mut buf, run.rle);
                buf.to_vec()
            }
            Some(data) => {
                let mut env = RecEnv {
                    store: self.store,
                    track: &mut *self.track,
                    stats: &mut self.ctx.stats,
                };
                self.ctx.cellb.build_value(data, run.rle, &mut env)?
            }
        };
        self.ctx
            .ensure_space(bytes.len(), run.start, self.store, self.track)?;
        self.ctx.push_cell(&bytes);
        self.ctx.note_entry(run.rle as u32, None);
        Ok(())
    }

    /// An overflow cell with no pending update is copied raw (no decode)
    /// and breaks the run chain on both sides.
    fn passthrough(&mut self, data: &[u8], rle: u64, off: BlockOff, at: Recno) -> Result<()> {
        self.flush()?;
        // Flip the tracker entry back to live so wrap-up keeps the block.
        let off = self.track.ovfl_active(data).unwrap_or(off);
        let mut buf = BytesMut::new();
        cell::pack_value_ovfl(&mut buf, rle, off);
        self.ctx.ensure_space(buf.len(), at, self.store, self.track)?;
        self.ctx.push_cell(&buf);
        self.ctx.note_entry(rle as u32, None);
        Ok(())
    }
}

/// Walk a variable-width column leaf, maintaining the run comparison state
/// across existing cells, overwrites and appends.
pub(crate) fn rec_col_var(
    ctx: &mut ReconCtx,
    state: &mut PageState,
    store: &dyn BlockStore,
    mut salvage: Option<&mut SalvageCookie>,
) -> Result<()> {
    let start = state.recno;
    let PageState { data, track, .. } = state;
    let PageData::ColVar {
        cells,
        updates,
        append,
    } = data
    else {
        return Err(EngineError::corruption("col-var walk on wrong page type"));
    };

    let mut sal = SalvageState::new(salvage.as_deref());
    let mut em = VarEmitter {
        ctx,
        track,
        store,
        run: None,
    };

    // Salvage: records missing from the namespace ahead of this page are
    // emitted as a leading deleted run.
    if sal.missing > 0 {
        em.push(None, sal.missing, start.saturating_sub(sal.missing))?;
    }

    let mut at = start;
    'cells: for c in cells.iter() {
        let end = at + c.rle;
        let has_update = updates.range(at..end).next().is_some();
        if c.ovfl.is_some() && !has_update {
            let data = c.data.as_deref().unwrap_or_default();
            let (dropped, emit) = sal.admit(c.rle);
            if emit > 0 {
                em.passthrough(data, emit, c.ovfl.expect("checked above"), at + dropped)?;
            }
            at = end;
            if sal.exhausted() {
                break 'cells;
            }
            continue;
        }
        // Segment the run around its overwrites.
        let mut seg = at;
        let overwrites: Vec<(Recno, Option<Vec<u8>>)> = updates
            .range(at..end)
            .map(|(&r, upds)| (r, visible(upds).and_then(|u| u.data.clone())))
            .collect();
        for (r, val) in overwrites {
            if r > seg {
                emit_run(&mut em, &mut sal, c.data.as_deref(), r - seg, seg)?;
            }
            emit_run(&mut em, &mut sal, val.as_deref(), 1, r)?;
            seg = r + 1;
            if sal.exhausted() {
                break 'cells;
            }
        }
        if seg < end {
            emit_run(&mut em, &mut sal, c.data.as_deref(), end - seg, seg)?;
        }
        at = end;
        if sal.exhausted() {
            break 'cells;
        }
    }

    // Append list: fill record-number gaps with deleted runs. Appends whose
    // visible update is a delete never made it to disk and are skipped,
    // which also trims deletions off the tail of the namespace.
    if !sal.exhausted() {
        for (&r, upds) in append.iter() {
            if r < at {
                continue;
            }
            let Some(u) = visible(upds) else { continue };
            if u.is_delete() {
                continue;
            }
            if r > at {
                emit_run(&mut em, &mut sal, None, r - at, at)?;
            }
            emit_run(&mut em, &mut sal, u.data.as_deref(), 1, r)?;
            at = r + 1;
            if sal.exhausted() {
                break;
            }
        }
    }
    em.flush()?;
    sal.finish(salvage.as_deref_mut());
    Ok(())
}

fn emit_run(
    em: &mut VarEmitter<'_, '_>,
    sal: &mut SalvageState,
    data: Option<&[u8]>,
    n: u64,
    at: Recno,
) -> Result<()> {
    if !sal.active {
        return em.push(data, n, at);
    }
    let (dropped, emit) = sal.admit(n);
    if emit > 0 {
        em.push(data, emit, at + dropped)?;
    }
    Ok(())
}

/// Walk a fixed-width column leaf: updates and appends folded into a flat
/// record array (gaps become zero-valued records), then bit-packed into
/// chunks. Fixed-width pages split only at the full page size.
pub(crate) fn rec_col_fix(
    ctx: &mut ReconCtx,
    state: &mut PageState,
    store: &dyn BlockStore,
    mut salvage: Option<&mut SalvageCookie>,
) -> Result<()> {
    let start = state.recno;
    let PageState { data, track, .. } = state;
    let PageData::ColFix {
        values,
        updates,
        append,
    } = data
    else {
        return Err(EngineError::corruption("col-fix walk on wrong page type"));
    };

    let width = ctx.cfg.fix_width;
    let mask = ((1u16 << width) - 1) as u8;
    let mut recs = values.clone();
    for (&r, upds) in updates.iter() {
        let Some(idx) = r.checked_sub(start).map(|i| i as usize) else {
            continue;
        };
        if idx < recs.len() {
            if let Some(u) = visible(upds) {
                recs[idx] = fix_byte(u, mask);
            }
        }
    }
    for (&r, upds) in append.iter() {
        let Some(idx) = r.checked_sub(start).map(|i| i as usize) else {
            continue;
        };
        while recs.len() < idx {
            recs.push(0);
        }
        let byte = visible(upds).map_or(0, |u| fix_byte(u, mask));
        if idx < recs.len() {
            recs[idx] = byte;
        } else {
            recs.push(byte);
        }
    }

    let mut sal = SalvageState::new(salvage.as_deref());
    if sal.active {
        let mut out = vec![0u8; sal.missing as usize];
        let (dropped, emit) = sal.admit(recs.len() as u64);
        out.extend_from_slice(&recs[dropped as usize..(dropped + emit) as usize]);
        recs = out;
    }

    if !recs.is_empty() {
        let cap = (ctx.page_limit * 8 / width as usize).max(1);
        let mut emitted = 0usize;
        for chunk in recs.chunks(cap) {
            if emitted > 0 {
                let next = ctx.bnd.last().recno + u64::from(ctx.bnd.last().entries);
                ctx.split(store, track, next)?;
            }
            let packed = pack_bits(chunk, width);
            ctx.push_cell(&packed);
            ctx.note_entry(chunk.len() as u32, None);
            emitted += chunk.len();
        }
    }
    sal.finish(salvage.as_deref_mut());
    Ok(())
}

fn fix_byte(u: &Update, mask: u8) -> u8 {
    match &u.data {
        None => 0,
        Some(d) => d.first().copied().unwrap_or(0) & mask,
    }
}

/// Walk a column internal page: fixed-shape address cells, no key
/// compression.
pub(crate) fn rec_col_int(
    ctx: &mut ReconCtx,
    state: &mut PageState,
    store: &dyn BlockStore,
) -> Result<()> {
    let PageState { data, track, .. } = state;
    let PageData::ColInt { children } = data else {
        return Err(EngineError::corruption("col-int walk on wrong page type"));
    };
    for (_key, recno, off) in resolve_children(children)? {
        let mut buf = BytesMut::new();
        cell::pack_addr_col(&mut buf, recno, off);
        ctx.ensure_space(buf.len(), recno, store, track)?;
        ctx.push_cell(&buf);
        ctx.note_entry(1, None);
    }
    Ok(())
}

/// Pack one byte-per-record array into a `width`-bits-per-record string.
pub(crate) fn pack_bits(vals: &[u8], width: u8) -> Vec<u8> {
    let width = width as usize;
    let mut out = vec![0u8; (vals.len() * width).div_ceil(8)];
    for (i, &v) in vals.iter().enumerate() {
        for b in 0..width {
            if v & (1 << b) != 0 {
                let pos = i * width + b;
                out[pos / 8] |= 1 << (pos % 8);
            }
        }
    }
    out
}

/// Inverse of `pack_bits`.
pub(crate) fn unpack_bits(data: &[u8], entries: usize, width: u8) -> Result<Vec<u8>> {
    let w = width as usize;
    if data.len() != (entries * w).div_ceil(8) {
        return Err(EngineError::corruption("fixed-width bit string length"));
    }
    let mut out = vec![0u8; entries];
    for (i, slot) in out.iter_mut().enumerate() {
        for b in 0..w {
            let pos = i * w + b;
            if data[pos / 8] & (1 << (pos % 8)) != 0 {
                *slot |= 1 << b;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_packing_round_trip() {
        for width in [1u8, 3, 4, 8] {
            let mask = ((1u16 << width) - 1) as u8;
            let vals: Vec<u8> = (0u8..50).map(|v| v & mask).collect();
            let packed = pack_bits(&vals, width);
            assert_eq!(packed.len(), (vals.len() * width as usize).div_ceil(8));
            assert_eq!(unpack_bits(&packed, vals.len(), width).unwrap(), vals);
        }
    }

    #[test]
    fn salvage_admit_clamps() {
        let cookie = SalvageCookie {
            missing: 0,
            skip: 5,
            take: 10,
            done: false,
        };
        let mut sal = SalvageState::new(Some(&cookie));
        assert_eq!(sal.admit(3), (3, 0)); // entirely skipped
        assert_eq!(sal.admit(4), (2, 2)); // tail of the skip, then emit
        assert_eq!(sal.admit(20), (0, 8)); // take limit clamps
        assert!(sal.exhausted());
        assert_eq!(sal.admit(7), (0, 0));
    }
}
