//! Row-store page walks.

use bytes::BytesMut;

use crate::block::{BlockOff, BlockStore};
use crate::btree::page::{
    visible, PageData, PageState, Recno, ReconcileResult, Update,
};
use crate::error::{EngineError, Result};
use crate::reconcile::cell::{self, KeyCell, RecEnv};
use crate::reconcile::ReconCtx;

/// Replay a row leaf: per-slot updates applied, deletes dropped, insert
/// lists merged in key order. Zero-length values emit no value cell; the
/// trailing key marker added at chunk write time keeps them decodable.
pub(crate) fn rec_row_leaf(
    ctx: &mut ReconCtx,
    state: &mut PageState,
    store: &dyn BlockStore,
) -> Result<()> {
    let PageState { data, track, .. } = state;
    let PageData::RowLeaf { smallest, slots } = data else {
        return Err(EngineError::corruption("row-leaf walk on wrong page type"));
    };

    // Inserts sorting before the first on-disk key.
    for (key, upds) in smallest.iter() {
        if let Some(data) = live_value(upds) {
            emit_pair(ctx, track, store, key, data, false)?;
        }
    }
    for slot in slots.iter() {
        match visible(&slot.updates) {
            Some(u) if u.is_delete() => {
                // Dropped pair; any overflow blocks it referenced stay in
                // discard state and are freed at wrap-up.
            }
            Some(u) => {
                let data = u.data.as_deref().unwrap_or_default();
                emit_pair(ctx, track, store, &slot.key, data, false)?;
            }
            None => emit_pair(ctx, track, store, &slot.key, slot.value.bytes(), false)?,
        }
        for (key, upds) in slot.inserts.iter() {
            if let Some(data) = live_value(upds) {
                emit_pair(ctx, track, store, key, data, false)?;
            }
        }
    }
    Ok(())
}

fn live_value(upds: &[Update]) -> Option<&[u8]> {
    match visible(upds) {
        Some(u) if !u.is_delete() => Some(u.data.as_deref().unwrap_or_default()),
        _ => None,
    }
}

/// Build and place one key/value pair. The pair lands in a single chunk;
/// if a split intervenes, a prefix-compressed key is rebuilt in full
/// because its prefix bytes live in the previous chunk.
fn emit_pair(
    ctx: &mut ReconCtx,
    track: &mut crate::reconcile::track::BlockTracker,
    store: &dyn BlockStore,
    key: &[u8],
    value: &[u8],
    is_internal: bool,
) -> Result<()> {
    let kcell = {
        let mut env = RecEnv {
            store,
            track: &mut *track,
            stats: &mut ctx.stats,
        };
        ctx.cellb.build_key(Some(key), is_internal, &mut env)?
    };
    let vbytes = if value.is_empty() && !is_internal {
        Vec::new()
    } else {
        let mut env = RecEnv {
            store,
            track: &mut *track,
            stats: &mut ctx.stats,
        };
        ctx.cellb.build_value(value, 1, &mut env)?
    };
    let KeyCell {
        bytes,
        is_ovfl,
        prefixed,
    } = kcell;
    place_pair(ctx, track, store, key, bytes, vbytes, prefixed)?;
    ctx.cellb.commit_key(is_ovfl);
    Ok(())
}

fn place_pair(
    ctx: &mut ReconCtx,
    track: &mut crate::reconcile::track::BlockTracker,
    store: &dyn BlockStore,
    key: &[u8],
    mut kbytes: Vec<u8>,
    vbytes: Vec<u8>,
    mut prefixed: bool,
) -> Result<()> {
    loop {
        let need = kbytes.len() + vbytes.len();
        if !ctx.need_split(need) {
            break;
        }
        ctx.split(store, track, 0)?;
        if prefixed {
            // The key referenced prefix bytes now sitting in the previous
            // chunk; rebuild it in full from the saved copy.
            let mut env = RecEnv {
                store,
                track: &mut *track,
                stats: &mut ctx.stats,
            };
            let rebuilt = ctx.cellb.build_key(None, false, &mut env)?;
            kbytes = rebuilt.bytes;
            prefixed = rebuilt.prefixed;
        }
    }
    ctx.push_cell(&kbytes);
    ctx.push_cell(&vbytes);
    ctx.note_entry(1, Some(key));
    Ok(())
}

/// Walk a row internal page: one key/address pair per surviving child.
pub(crate) fn rec_row_int(
    ctx: &mut ReconCtx,
    state: &mut PageState,
    store: &dyn BlockStore,
) -> Result<()> {
    let PageState { data, track, .. } = state;
    let PageData::RowInt { children } = data else {
        return Err(EngineError::corruption("row-int walk on wrong page type"));
    };
    let entries = resolve_children(children)?;
    let mut cell_zero = true;
    for (key, _recno, off) in entries {
        let mut abuf = BytesMut::new();
        cell::pack_addr(&mut abuf, off);
        let kcell = {
            let mut env = RecEnv {
                store,
                track: &mut *track,
                stats: &mut ctx.stats,
            };
            if cell_zero {
                // Tree search treats the 0th key on an internal page as
                // minus infinity; store a single byte.
                ctx.cellb.build_key(Some(&[]), false, &mut env)?
            } else {
                ctx.cellb.build_key(Some(&key), true, &mut env)?
            }
        };
        let KeyCell {
            bytes,
            is_ovfl,
            prefixed,
        } = kcell;
        place_pair(ctx, track, store, &key, bytes, abuf.to_vec(), prefixed)?;
        ctx.cellb.commit_key(is_ovfl);
        cell_zero = false;
    }
    Ok(())
}

/// Flatten an internal page's child references through their reconcile
/// results: on-disk children are reused, emptied children dropped,
/// replaced children take their new address, and a split child's merge
/// page is folded in flat, keeping the original reference's key for the
/// first merged entry.
pub(crate) fn resolve_children(
    children: &[crate::btree::page::ChildRef],
) -> Result<Vec<(Vec<u8>, Recno, BlockOff)>> {
    let mut out = Vec::with_capacity(children.len());
    for c in children {
        let Some(page) = &c.page else {
            let off = c.addr.ok_or_else(|| {
                EngineError::corruption("child reference with neither page nor address")
            })?;
            out.push((c.key.clone(), c.recno, off));
            continue;
        };
        let result = page.state.read().result.clone();
        match result {
            ReconcileResult::None => {
                let off = c.addr.or_else(|| page.disk_off()).ok_or_else(|| {
                    EngineError::corruption("in-memory child with no address or result")
                })?;
                out.push((c.key.clone(), c.recno, off));
            }
            ReconcileResult::Empty => {}
            ReconcileResult::Replace(off) => out.push((c.key.clone(), c.recno, off)),
            ReconcileResult::Split(merge) => {
                for (i, mc) in merge.children.iter().enumerate() {
                    let key = if i == 0 { c.key.clone() } else { mc.key.clone() };
                    out.push((key, mc.recno, mc.off));
                }
            }
        }
    }
    Ok(out)
}
