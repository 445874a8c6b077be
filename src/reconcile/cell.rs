//! On-disk cell grammar and the key/value cell builder.
//!
//! Every chunk written by the reconciler is a fixed-size page header
//! followed by tightly packed cells. The first descriptor byte of a cell
//! selects its shape; tiny keys and values use single-byte short forms so a
//! zero-length key costs exactly one byte on the wire.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::block::{BlockOff, BlockStore};
use crate::btree::page::{PageType, Recno};
use crate::btree::TreeConfig;
use crate::error::{EngineError, Result};
use crate::reconcile::track::BlockTracker;
use crate::reconcile::ReconStats;

/// Prefix lengths ride in one byte on the wire.
pub const PREFIX_MAX: usize = 255;

// Descriptor layout. Low bit set: short key, length in the upper seven
// bits. Low two bits == 10: short value, length in the upper six bits.
// Otherwise the descriptor is a full tag (a multiple of four).
const SHORT_KEY: u8 = 0x01;
const SHORT_VALUE: u8 = 0x02;
const SHORT_KEY_MAX: usize = 0x7f;
const SHORT_VALUE_MAX: usize = 0x3f;

const CELL_KEY: u8 = 0x04;
const CELL_KEY_OVFL: u8 = 0x08;
const CELL_VALUE: u8 = 0x0C;
const CELL_VALUE_OVFL: u8 = 0x10;
const CELL_ADDR: u8 = 0x14;
const CELL_DEL: u8 = 0x18;
const CELL_ADDR_COL: u8 = 0x1C;

/// Fixed page header: type, starting recno (zero for row stores), entry
/// count, cell-bytes length.
pub const HEADER_SIZE: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub ptype: PageType,
    pub recno: Recno,
    pub entries: u32,
    pub data_len: u32,
}

impl PageHeader {
    pub fn pack(&self, out: &mut BytesMut) {
        out.put_u8(self.ptype.to_wire());
        out.put_u64_le(self.recno);
        out.put_u32_le(self.entries);
        out.put_u32_le(self.data_len);
    }

    pub fn unpack(img: &[u8]) -> Result<PageHeader> {
        if img.len() < HEADER_SIZE {
            return Err(EngineError::corruption("page image shorter than header"));
        }
        let ptype = PageType::from_wire(img[0])
            .ok_or_else(|| EngineError::corruption(format!("illegal page type {}", img[0])))?;
        let recno = u64::from_le_bytes(img[1..9].try_into().unwrap());
        let entries = u32::from_le_bytes(img[9..13].try_into().unwrap());
        let data_len = u32::from_le_bytes(img[13..17].try_into().unwrap());
        if HEADER_SIZE + data_len as usize != img.len() {
            return Err(EngineError::corruption("page image length mismatch"));
        }
        Ok(PageHeader {
            ptype,
            recno,
            entries,
            data_len,
        })
    }
}

fn put_uvarint(out: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

fn get_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| EngineError::corruption("truncated varint"))?;
        *pos += 1;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift > 63 {
            return Err(EngineError::corruption("varint overflow"));
        }
    }
}

fn put_off(out: &mut BytesMut, off: BlockOff) {
    put_uvarint(out, u64::from(off.addr));
    put_uvarint(out, u64::from(off.size));
}

fn get_off(buf: &[u8], pos: &mut usize) -> Result<BlockOff> {
    let addr = get_uvarint(buf, pos)?;
    let size = get_uvarint(buf, pos)?;
    Ok(BlockOff {
        addr: addr as u32,
        size: size as u32,
    })
}

pub fn pack_key(out: &mut BytesMut, prefix: u8, suffix: &[u8]) {
    if prefix == 0 && suffix.len() <= SHORT_KEY_MAX {
        out.put_u8(((suffix.len() as u8) << 1) | SHORT_KEY);
        out.put_slice(suffix);
        return;
    }
    out.put_u8(CELL_KEY);
    out.put_u8(prefix);
    put_uvarint(out, suffix.len() as u64);
    out.put_slice(suffix);
}

pub fn pack_key_ovfl(out: &mut BytesMut, off: BlockOff) {
    out.put_u8(CELL_KEY_OVFL);
    put_off(out, off);
}

pub fn pack_value(out: &mut BytesMut, rle: u64, data: &[u8]) {
    if rle == 1 && data.len() <= SHORT_VALUE_MAX {
        out.put_u8(((data.len() as u8) << 2) | SHORT_VALUE);
        out.put_slice(data);
        return;
    }
    out.put_u8(CELL_VALUE);
    put_uvarint(out, rle);
    put_uvarint(out, data.len() as u64);
    out.put_slice(data);
}

pub fn pack_value_ovfl(out: &mut BytesMut, rle: u64, off: BlockOff) {
    out.put_u8(CELL_VALUE_OVFL);
    put_uvarint(out, rle);
    put_off(out, off);
}

pub fn pack_del(out: &mut BytesMut, rle: u64) {
    out.put_u8(CELL_DEL);
    put_uvarint(out, rle);
}

pub fn pack_addr(out: &mut BytesMut, off: BlockOff) {
    out.put_u8(CELL_ADDR);
    put_off(out, off);
}

pub fn pack_addr_col(out: &mut BytesMut, recno: Recno, off: BlockOff) {
    out.put_u8(CELL_ADDR_COL);
    put_uvarint(out, recno);
    put_off(out, off);
}

/// A decoded cell borrowing from the image.
#[derive(Debug, PartialEq, Eq)]
pub enum Cell<'a> {
    Key { prefix: u8, suffix: &'a [u8] },
    KeyOvfl { off: BlockOff },
    Value { rle: u64, data: &'a [u8] },
    ValueOvfl { rle: u64, off: BlockOff },
    Del { rle: u64 },
    Addr { off: BlockOff },
    AddrCol { recno: Recno, off: BlockOff },
}

pub fn unpack<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Cell<'a>> {
    let desc = *buf
        .get(*pos)
        .ok_or_else(|| EngineError::corruption("truncated cell"))?;
    *pos += 1;
    let take = |buf: &'a [u8], pos: &mut usize, len: usize| -> Result<&'a [u8]> {
        let end = *pos + len;
        if end > buf.len() {
            return Err(EngineError::corruption("cell data past image end"));
        }
        let data = &buf[*pos..end];
        *pos = end;
        Ok(data)
    };
    if desc & SHORT_KEY != 0 {
        let len = (desc >> 1) as usize;
        return Ok(Cell::Key {
            prefix: 0,
            suffix: take(buf, pos, len)?,
        });
    }
    if desc & 0x03 == SHORT_VALUE {
        let len = (desc >> 2) as usize;
        return Ok(Cell::Value {
            rle: 1,
            data: take(buf, pos, len)?,
        });
    }
    match desc {
        CELL_KEY => {
            let prefix = *buf
                .get(*pos)
                .ok_or_else(|| EngineError::corruption("truncated key cell"))?;
            *pos += 1;
            let len = get_uvarint(buf, pos)? as usize;
            Ok(Cell::Key {
                prefix,
                suffix: take(buf, pos, len)?,
            })
        }
        CELL_KEY_OVFL => Ok(Cell::KeyOvfl {
            off: get_off(buf, pos)?,
        }),
        CELL_VALUE => {
            let rle = get_uvarint(buf, pos)?;
            let len = get_uvarint(buf, pos)? as usize;
            Ok(Cell::Value {
                rle,
                data: take(buf, pos, len)?,
            })
        }
        CELL_VALUE_OVFL => {
            let rle = get_uvarint(buf, pos)?;
            Ok(Cell::ValueOvfl {
                rle,
                off: get_off(buf, pos)?,
            })
        }
        CELL_DEL => Ok(Cell::Del {
            rle: get_uvarint(buf, pos)?,
        }),
        CELL_ADDR => Ok(Cell::Addr {
            off: get_off(buf, pos)?,
        }),
        CELL_ADDR_COL => {
            let recno = get_uvarint(buf, pos)?;
            Ok(Cell::AddrCol {
                recno,
                off: get_off(buf, pos)?,
            })
        }
        _ => Err(EngineError::corruption(format!(
            "illegal cell descriptor {desc:#04x}"
        ))),
    }
}

/// Byte-transform hook applied to key suffixes and values. Huffman coders
/// plug in here; the default passes bytes through untouched.
pub trait ItemCodec: Send + Sync {
    fn encode<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]>;
    fn decode<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;
}

pub struct NoopCodec;

impl ItemCodec for NoopCodec {
    fn encode<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(data)
    }

    fn decode<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }
}

/// Block-store access handed to the builder for overflow promotion.
pub struct RecEnv<'a> {
    pub store: &'a dyn BlockStore,
    pub track: &'a mut BlockTracker,
    pub stats: &'a mut ReconStats,
}

/// A finished key cell, plus what the split logic needs to know about it:
/// whether it was promoted to overflow and whether it leans on the
/// previous key's prefix bytes.
pub struct KeyCell {
    pub bytes: Vec<u8>,
    pub is_ovfl: bool,
    pub prefixed: bool,
}

/// Builds one on-page cell at a time, carrying the prefix-compression state
/// between consecutive keys.
pub struct CellBuilder {
    cur: Vec<u8>,
    last: Vec<u8>,
    have_last: bool,
    pfx_compress: bool,
    sfx_compress: bool,
    pfx_compress_conf: bool,
    sfx_compress_conf: bool,
    max_item: usize,
    codec: Arc<dyn ItemCodec>,
    out: BytesMut,
}

impl CellBuilder {
    pub fn new(cfg: &TreeConfig, codec: Arc<dyn ItemCodec>) -> Self {
        Self {
            cur: Vec::new(),
            last: Vec::new(),
            have_last: false,
            pfx_compress: false,
            sfx_compress: false,
            pfx_compress_conf: cfg.prefix_compression,
            sfx_compress_conf: cfg.internal_key_truncate,
            max_item: cfg.leaf_item_max as usize,
            codec,
            out: BytesMut::new(),
        }
    }

    /// Per-page reset: the first key of a page is always written in full.
    pub fn page_reset(&mut self) {
        self.cur.clear();
        self.last.clear();
        self.have_last = false;
        self.pfx_compress = false;
        self.sfx_compress = false;
    }

    /// A chunk boundary was crossed: the next key cannot reference bytes in
    /// the previous chunk, so prefix compression restarts.
    pub fn chunk_reset(&mut self) {
        self.pfx_compress = false;
    }

    /// The key most recently passed to `build_key`.
    pub fn cur_key(&self) -> &[u8] {
        &self.cur
    }

    /// Build a key cell. Passing `None` re-emits the last key verbatim,
    /// used when the caller crossed a split and holds no usable copy.
    pub fn build_key(
        &mut self,
        data: Option<&[u8]>,
        is_internal: bool,
        env: &mut RecEnv<'_>,
    ) -> Result<KeyCell> {
        match data {
            None => {
                // The caller crossed a split and cannot keep a
                // prefix-compressed form; re-emit the saved key whole.
                self.pack_current(0, env)
            }
            Some(data) => {
                self.cur = data.to_vec();
                if is_internal && self.sfx_compress && self.have_last {
                    // Truncate the promoted key to the shortest form still
                    // sorting above the previous key.
                    let common = common_prefix(&self.last, &self.cur);
                    let keep = (common + 1).min(self.cur.len());
                    self.cur.truncate(keep);
                }
                let mut prefix = 0usize;
                if self.pfx_compress && self.have_last {
                    prefix = common_prefix(&self.last, &self.cur).min(PREFIX_MAX);
                }
                self.pack_current(prefix, env)
            }
        }
    }

    fn pack_current(&mut self, prefix: usize, env: &mut RecEnv<'_>) -> Result<KeyCell> {
        let suffix = &self.cur[prefix..];
        let encoded = self.codec.encode(suffix);
        if encoded.len() > self.max_item {
            // Overflow keys are stored whole; a prefix-compressed form
            // cannot be promoted, retry with the full key.
            if prefix != 0 {
                drop(encoded);
                return self.pack_current(0, env);
            }
            let off = env.store.write(&self.cur)?;
            env.track.track_ovfl(&[], off);
            env.stats.ovfl_writes += 1;
            self.out.clear();
            pack_key_ovfl(&mut self.out, off);
            return Ok(KeyCell {
                bytes: self.out.to_vec(),
                is_ovfl: true,
                prefixed: false,
            });
        }
        let encoded = encoded.into_owned();
        self.out.clear();
        pack_key(&mut self.out, prefix as u8, &encoded);
        Ok(KeyCell {
            bytes: self.out.to_vec(),
            is_ovfl: false,
            prefixed: prefix != 0,
        })
    }

    /// Build a value cell covering `rle` records. Values larger than the
    /// item limit are promoted to overflow, reusing an unchanged block if
    /// the tracker still holds one.
    pub fn build_value(&mut self, data: &[u8], rle: u64, env: &mut RecEnv<'_>) -> Result<Vec<u8>> {
        let encoded = self.codec.encode(data);
        if encoded.len() > self.max_item {
            drop(encoded);
            let off = match env.track.ovfl_active(data) {
                Some(off) => {
                    env.stats.ovfl_reuse += 1;
                    off
                }
                None => {
                    let off = env.store.write(data)?;
                    env.track.track_ovfl(data, off);
                    env.stats.ovfl_writes += 1;
                    off
                }
            };
            self.out.clear();
            pack_value_ovfl(&mut self.out, rle, off);
            return Ok(self.out.to_vec());
        }
        let encoded = encoded.into_owned();
        self.out.clear();
        pack_value(&mut self.out, rle, &encoded);
        Ok(self.out.to_vec())
    }

    /// Key-state update after the key cell lands in the image. An overflow
    /// key leaves no clear bytes to truncate the next promoted key against,
    /// so suffix compression shuts off until a normal key is written.
    pub fn commit_key(&mut self, was_ovfl: bool) {
        if was_ovfl {
            self.sfx_compress = false;
        } else {
            std::mem::swap(&mut self.cur, &mut self.last);
            self.have_last = true;
            self.pfx_compress = self.pfx_compress_conf;
            self.sfx_compress = self.sfx_compress_conf;
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;

    fn env_parts() -> (MemBlockStore, BlockTracker, ReconStats) {
        (MemBlockStore::new(), BlockTracker::new(), ReconStats::default())
    }

    fn builder(prefix_compression: bool) -> CellBuilder {
        let cfg = TreeConfig {
            prefix_compression,
            leaf_item_max: 64,
            ..TreeConfig::default()
        };
        CellBuilder::new(&cfg, Arc::new(NoopCodec))
    }

    #[test]
    fn header_round_trip() {
        let hdr = PageHeader {
            ptype: PageType::ColVar,
            recno: 42,
            entries: 17,
            data_len: 3,
        };
        let mut buf = BytesMut::new();
        hdr.pack(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(buf.len(), HEADER_SIZE + 3);
        assert_eq!(PageHeader::unpack(&buf).unwrap(), hdr);
    }

    #[test]
    fn zero_length_key_is_one_byte() {
        let mut buf = BytesMut::new();
        pack_key(&mut buf, 0, &[]);
        assert_eq!(buf.len(), 1);
        let mut pos = 0;
        assert_eq!(
            unpack(&buf, &mut pos).unwrap(),
            Cell::Key {
                prefix: 0,
                suffix: &[]
            }
        );
        assert_eq!(pos, 1);
    }

    #[test]
    fn cell_forms_round_trip() {
        let mut buf = BytesMut::new();
        let off = BlockOff { addr: 9, size: 300 };
        pack_key(&mut buf, 3, b"suffix-bytes-long-enough-to-skip-the-short-form-entirely-here!!");
        pack_value(&mut buf, 500, b"v");
        pack_value_ovfl(&mut buf, 2, off);
        pack_del(&mut buf, 7);
        pack_addr(&mut buf, off);
        pack_addr_col(&mut buf, 1000, off);
        pack_key_ovfl(&mut buf, off);

        let mut pos = 0;
        assert!(matches!(
            unpack(&buf, &mut pos).unwrap(),
            Cell::Key { prefix: 3, .. }
        ));
        assert_eq!(
            unpack(&buf, &mut pos).unwrap(),
            Cell::Value {
                rle: 500,
                data: b"v"
            }
        );
        assert_eq!(
            unpack(&buf, &mut pos).unwrap(),
            Cell::ValueOvfl { rle: 2, off }
        );
        assert_eq!(unpack(&buf, &mut pos).unwrap(), Cell::Del { rle: 7 });
        assert_eq!(unpack(&buf, &mut pos).unwrap(), Cell::Addr { off });
        assert_eq!(
            unpack(&buf, &mut pos).unwrap(),
            Cell::AddrCol { recno: 1000, off }
        );
        assert_eq!(unpack(&buf, &mut pos).unwrap(), Cell::KeyOvfl { off });
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn prefix_compression_encode_decode_identity() {
        let (store, mut track, mut stats) = env_parts();
        let mut b = builder(true);
        b.page_reset();
        let keys: Vec<&[u8]> = vec![b"app", b"apple", b"applesauce", b"banana"];
        let mut cells = BytesMut::new();
        for k in &keys {
            let mut env = RecEnv {
                store: &store,
                track: &mut track,
                stats: &mut stats,
            };
            let cell = b.build_key(Some(k), false, &mut env).unwrap();
            cells.extend_from_slice(&cell.bytes);
            b.commit_key(cell.is_ovfl);
        }
        // Decode with the standard rolling-key rule.
        let mut pos = 0;
        let mut last = Vec::new();
        let mut decoded = Vec::new();
        while pos < cells.len() {
            match unpack(&cells, &mut pos).unwrap() {
                Cell::Key { prefix, suffix } => {
                    let mut k = last[..prefix as usize].to_vec();
                    k.extend_from_slice(suffix);
                    last = k.clone();
                    decoded.push(k);
                }
                other => panic!("unexpected cell {other:?}"),
            }
        }
        assert_eq!(decoded, keys.iter().map(|k| k.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn prefix_capped_at_255() {
        let (store, mut track, mut stats) = env_parts();
        let cfg = TreeConfig {
            prefix_compression: true,
            leaf_item_max: 4096,
            ..TreeConfig::default()
        };
        let mut b = CellBuilder::new(&cfg, Arc::new(NoopCodec));
        b.page_reset();
        let base = vec![b'x'; 400];
        let mut second = base.clone();
        second.push(b'z');
        for k in [&base, &second] {
            let mut env = RecEnv {
                store: &store,
                track: &mut track,
                stats: &mut stats,
            };
            let cell = b.build_key(Some(k), false, &mut env).unwrap();
            if k == &second {
                let mut pos = 0;
                let Cell::Key { prefix, suffix } = unpack(&cell.bytes, &mut pos).unwrap() else {
                    panic!("expected key cell");
                };
                assert_eq!(prefix as usize, PREFIX_MAX);
                assert_eq!(suffix.len(), second.len() - PREFIX_MAX);
            }
            b.commit_key(cell.is_ovfl);
        }
    }

    #[test]
    fn oversize_value_promotes_to_overflow_and_reuses() {
        let (store, mut track, mut stats) = env_parts();
        let mut b = builder(false);
        b.page_reset();
        let big = vec![7u8; 1000];
        {
            let mut env = RecEnv {
                store: &store,
                track: &mut track,
                stats: &mut stats,
            };
            let cell = b.build_value(&big, 1, &mut env).unwrap();
            let mut pos = 0;
            assert!(matches!(
                unpack(&cell, &mut pos).unwrap(),
                Cell::ValueOvfl { rle: 1, .. }
            ));
        }
        assert_eq!(stats.ovfl_writes, 1);

        // Same bytes on the next reconcile: reuse, no new write.
        track.begin();
        {
            let mut env = RecEnv {
                store: &store,
                track: &mut track,
                stats: &mut stats,
            };
            b.build_value(&big, 1, &mut env).unwrap();
        }
        assert_eq!(stats.ovfl_writes, 1);
        assert_eq!(stats.ovfl_reuse, 1);
        assert_eq!(store.stats().writes, 1);
    }

    #[test]
    fn oversize_key_written_full_not_prefixed() {
        let (store, mut track, mut stats) = env_parts();
        let mut b = builder(true);
        b.page_reset();
        let k1 = vec![b'k'; 60];
        let mut k2 = vec![b'k'; 60];
        k2.extend_from_slice(&vec![b'q'; 40]); // 100 bytes, over the 64 limit
        let mut env = RecEnv {
            store: &store,
            track: &mut track,
            stats: &mut stats,
        };
        let c1 = b.build_key(Some(&k1), false, &mut env).unwrap();
        assert!(!c1.is_ovfl);
        b.commit_key(false);
        let mut env = RecEnv {
            store: &store,
            track: &mut track,
            stats: &mut stats,
        };
        let c2 = b.build_key(Some(&k2), false, &mut env).unwrap();
        assert!(c2.is_ovfl);
        let mut pos = 0;
        let Cell::KeyOvfl { off } = unpack(&c2.bytes, &mut pos).unwrap() else {
            panic!("expected overflow key cell");
        };
        // The block holds the whole key, not a suffix.
        assert_eq!(store.read(off).unwrap(), k2);
    }

    #[test]
    fn internal_key_truncation() {
        let (store, mut track, mut stats) = env_parts();
        let mut b = builder(false);
        b.page_reset();
        let mut env = RecEnv {
            store: &store,
            track: &mut track,
            stats: &mut stats,
        };
        let c1 = b.build_key(Some(b"cccc"), true, &mut env).unwrap();
        b.commit_key(c1.is_ovfl);
        let mut env = RecEnv {
            store: &store,
            track: &mut track,
            stats: &mut stats,
        };
        let c2 = b.build_key(Some(b"cccframework"), true, &mut env).unwrap();
        let mut pos = 0;
        let Cell::Key { prefix: 0, suffix } = unpack(&c2.bytes, &mut pos).unwrap() else {
            panic!("expected key cell");
        };
        // "cccf" is the shortest form sorting above "cccc".
        assert_eq!(suffix, b"cccf");
    }
}
