//! Rebuilding in-memory pages from disk images.

use crate::block::{BlockOff, BlockStore};
use crate::btree::page::{
    ChildRef, ColVarCell, InsertList, Page, PageData, PageRef, PageType, RowSlot, ValSource,
};
use crate::btree::TreeConfig;
use crate::error::{EngineError, Result};
use crate::reconcile::cell::{self, Cell, ItemCodec, PageHeader, HEADER_SIZE};
use crate::reconcile::col::unpack_bits;
use crate::reconcile::track::BlockTracker;

/// Parse one image back into a page. Overflow blocks referenced by the
/// image are re-registered with the page's tracker so a later reconcile can
/// reuse them.
pub fn read_page(
    store: &dyn BlockStore,
    off: BlockOff,
    cfg: &TreeConfig,
    codec: &dyn ItemCodec,
) -> Result<PageRef> {
    let image = store.read(off)?;
    let hdr = PageHeader::unpack(&image)?;
    let body = &image[HEADER_SIZE..];
    let mut track = BlockTracker::new();
    let data = match hdr.ptype {
        PageType::RowLeaf => read_row_leaf(store, body, &hdr, codec, &mut track)?,
        PageType::RowInt => read_row_int(store, body, &hdr, codec, &mut track)?,
        PageType::ColInt => read_col_int(body, &hdr)?,
        PageType::ColVar => read_col_var(store, body, &hdr, codec, &mut track)?,
        PageType::ColFix => PageData::ColFix {
            values: unpack_bits(body, hdr.entries as usize, cfg.fix_width)?,
            updates: Default::default(),
            append: Default::default(),
        },
    };
    Ok(Page::from_loaded(hdr.ptype, hdr.recno, data, track))
}

/// Apply the rolling-key rule: a key cell holds a prefix length into the
/// previous key plus its own suffix.
fn resolve_key(
    store: &dyn BlockStore,
    codec: &dyn ItemCodec,
    track: &mut BlockTracker,
    last: &mut Vec<u8>,
    cell: Cell<'_>,
) -> Result<Vec<u8>> {
    match cell {
        Cell::Key { prefix, suffix } => {
            if prefix as usize > last.len() {
                return Err(EngineError::corruption("key prefix past previous key"));
            }
            let mut key = last[..prefix as usize].to_vec();
            key.extend_from_slice(&codec.decode(suffix)?);
            *last = key.clone();
            Ok(key)
        }
        Cell::KeyOvfl { off } => {
            let key = store.read(off)?;
            track.track_ovfl(&[], off);
            *last = key.clone();
            Ok(key)
        }
        other => Err(EngineError::corruption(format!(
            "expected key cell, found {other:?}"
        ))),
    }
}

fn read_row_leaf(
    store: &dyn BlockStore,
    body: &[u8],
    hdr: &PageHeader,
    codec: &dyn ItemCodec,
    track: &mut BlockTracker,
) -> Result<PageData> {
    let mut pos = 0;
    let mut last = Vec::new();
    let mut slots = Vec::with_capacity(hdr.entries as usize);
    for _ in 0..hdr.entries {
        let key = resolve_key(store, codec, track, &mut last, cell::unpack(body, &mut pos)?)?;
        // A zero-length value has no cell: the next cell is another key (or
        // the trailing marker).
        let mark = pos;
        let value = match cell::unpack(body, &mut pos)? {
            Cell::Value { data, .. } => ValSource::Inline(codec.decode(data)?.into_owned()),
            Cell::ValueOvfl { off, .. } => {
                let data = store.read(off)?;
                track.track_ovfl(&data, off);
                ValSource::Ovfl { off, data }
            }
            _ => {
                pos = mark;
                ValSource::Inline(Vec::new())
            }
        };
        slots.push(RowSlot {
            key,
            value,
            updates: Vec::new(),
            inserts: InsertList::new(),
        });
    }
    // Trailing zero-length key cell, present on every row-leaf image.
    match cell::unpack(body, &mut pos)? {
        Cell::Key { prefix: 0, suffix } if suffix.is_empty() => {}
        _ => return Err(EngineError::corruption("missing trailing key marker")),
    }
    if pos != body.len() {
        return Err(EngineError::corruption("trailing bytes after row-leaf cells"));
    }
    Ok(PageData::RowLeaf {
        smallest: InsertList::new(),
        slots,
    })
}

fn read_row_int(
    store: &dyn BlockStore,
    body: &[u8],
    hdr: &PageHeader,
    codec: &dyn ItemCodec,
    track: &mut BlockTracker,
) -> Result<PageData> {
    let mut pos = 0;
    let mut last = Vec::new();
    let mut children = Vec::with_capacity(hdr.entries as usize);
    for _ in 0..hdr.entries {
        let key = resolve_key(store, codec, track, &mut last, cell::unpack(body, &mut pos)?)?;
        let Cell::Addr { off } = cell::unpack(body, &mut pos)? else {
            return Err(EngineError::corruption("expected address cell"));
        };
        children.push(ChildRef {
            key,
            recno: 0,
            addr: Some(off),
            page: None,
        });
    }
    if pos != body.len() {
        return Err(EngineError::corruption("trailing bytes after row-int cells"));
    }
    Ok(PageData::RowInt { children })
}

fn read_col_int(body: &[u8], hdr: &PageHeader) -> Result<PageData> {
    let mut pos = 0;
    let mut children = Vec::with_capacity(hdr.entries as usize);
    for _ in 0..hdr.entries {
        let Cell::AddrCol { recno, off } = cell::unpack(body, &mut pos)? else {
            return Err(EngineError::corruption("expected column address cell"));
        };
        children.push(ChildRef {
            key: Vec::new(),
            recno,
            addr: Some(off),
            page: None,
        });
    }
    if pos != body.len() {
        return Err(EngineError::corruption("trailing bytes after col-int cells"));
    }
    Ok(PageData::ColInt { children })
}

fn read_col_var(
    store: &dyn BlockStore,
    body: &[u8],
    hdr: &PageHeader,
    codec: &dyn ItemCodec,
    track: &mut BlockTracker,
) -> Result<PageData> {
    let mut pos = 0;
    let mut records: u64 = 0;
    let mut cells = Vec::new();
    while records < u64::from(hdr.entries) {
        match cell::unpack(body, &mut pos)? {
            Cell::Value { rle, data } => {
                if rle == 0 {
                    return Err(EngineError::corruption("zero run length"));
                }
                records += rle;
                cells.push(ColVarCell {
                    data: Some(codec.decode(data)?.into_owned()),
                    rle,
                    ovfl: None,
                });
            }
            Cell::ValueOvfl { rle, off } => {
                let data = store.read(off)?;
                track.track_ovfl(&data, off);
                records += rle;
                cells.push(ColVarCell {
                    data: Some(data),
                    rle,
                    ovfl: Some(off),
                });
            }
            Cell::Del { rle } => {
                if rle == 0 {
                    return Err(EngineError::corruption("zero run length"));
                }
                records += rle;
                cells.push(ColVarCell {
                    data: None,
                    rle,
                    ovfl: None,
                });
            }
            other => {
                return Err(EngineError::corruption(format!(
                    "unexpected cell on col-var page: {other:?}"
                )))
            }
        }
    }
    if records != u64::from(hdr.entries) || pos != body.len() {
        return Err(EngineError::corruption("col-var record count mismatch"));
    }
    Ok(PageData::ColVar {
        cells,
        updates: Default::default(),
        append: Default::default(),
    })
}
