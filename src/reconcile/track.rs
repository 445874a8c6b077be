//! Per-page block tracking across reconciles.
//!
//! The tracker remembers which blocks a page's reconciles have written and
//! which are scheduled to be released. Overflow entries cycle
//! OVFL -> OVFL_DISCARD at the start of a reconcile and flip back on reuse,
//! which is how an unchanged overflow value avoids a rewrite.

use tracing::trace;

use crate::block::{BlockOff, BlockStore};
use crate::error::Result;

/// Allocation chunk for the entry list.
const TRACK_CHUNK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    /// Unused slot.
    Empty,
    /// A page image block; stale ones are freed at wrap-up.
    Block,
    /// A live overflow block.
    Ovfl,
    /// An overflow block to be freed at wrap-up unless reused first.
    OvflDiscard,
}

#[derive(Debug, Clone)]
struct TrackEntry {
    ttype: TrackType,
    /// Value bytes the overflow block stores; empty for keys and images.
    ref_data: Vec<u8>,
    off: BlockOff,
    /// Generation the entry was last activated in; 0 marks an entry stale
    /// from birth (an old image scheduled for release).
    gen: u64,
}

#[derive(Debug)]
pub struct BlockTracker {
    entries: Vec<TrackEntry>,
    gen: u64,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            gen: 1,
        }
    }

    fn push(&mut self, entry: TrackEntry) {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|e| e.ttype == TrackType::Empty)
        {
            *slot = entry;
            return;
        }
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(TRACK_CHUNK);
        }
        self.entries.push(entry);
    }

    /// Start a reconcile: live overflow blocks become discard candidates.
    pub fn begin(&mut self) {
        self.gen += 1;
        for e in &mut self.entries {
            if e.ttype == TrackType::Ovfl {
                e.ttype = TrackType::OvflDiscard;
            }
        }
    }

    /// Record a freshly written image block.
    pub fn track_block(&mut self, off: BlockOff) {
        self.push(TrackEntry {
            ttype: TrackType::Block,
            ref_data: Vec::new(),
            off,
            gen: self.gen,
        });
    }

    /// Record a freshly written overflow block. `ref_data` is empty for
    /// overflow keys, which are never candidates for reuse.
    pub fn track_ovfl(&mut self, ref_data: &[u8], off: BlockOff) {
        self.push(TrackEntry {
            ttype: TrackType::Ovfl,
            ref_data: ref_data.to_vec(),
            off,
            gen: self.gen,
        });
    }

    /// Schedule an old block (a prior image, or an overflow block whose
    /// record was removed) for release at wrap-up.
    pub fn schedule_free(&mut self, off: BlockOff) {
        if self
            .entries
            .iter()
            .any(|e| e.ttype != TrackType::Empty && e.off == off)
        {
            return;
        }
        self.push(TrackEntry {
            ttype: TrackType::Block,
            ref_data: Vec::new(),
            off,
            gen: 0,
        });
    }

    /// Look for a discard candidate carrying exactly `ref_data`; on a match
    /// the entry flips back to live and its address is returned for reuse.
    /// Empty references never match: overflow keys are not tracked for
    /// reuse.
    pub fn ovfl_active(&mut self, ref_data: &[u8]) -> Option<BlockOff> {
        if ref_data.is_empty() {
            return None;
        }
        let gen = self.gen;
        for e in &mut self.entries {
            if e.ttype == TrackType::OvflDiscard && e.ref_data == ref_data {
                e.ttype = TrackType::Ovfl;
                e.gen = gen;
                trace!(addr = e.off.addr, "overflow block reused");
                return Some(e.off);
            }
        }
        None
    }

    /// Successful wrap-up: free stale image blocks and unclaimed discard
    /// candidates. Live overflow entries survive into the next reconcile.
    pub fn end(&mut self, store: &dyn BlockStore) -> Result<()> {
        let gen = self.gen;
        for e in &mut self.entries {
            let stale = match e.ttype {
                TrackType::Block => e.gen < gen,
                TrackType::OvflDiscard => true,
                _ => false,
            };
            if stale {
                store.free(e.off)?;
                e.ttype = TrackType::Empty;
                e.ref_data = Vec::new();
            }
        }
        Ok(())
    }

    /// Failed reconcile: free everything written this generation so no
    /// partial state stays addressable; earlier entries are untouched.
    pub fn abort(&mut self, store: &dyn BlockStore) -> Result<()> {
        let gen = self.gen;
        let mut first_err = None;
        for e in &mut self.entries {
            if e.gen == gen && matches!(e.ttype, TrackType::Block | TrackType::Ovfl) {
                if let Err(err) = store.free(e.off) {
                    first_err.get_or_insert(err);
                }
                e.ttype = TrackType::Empty;
                e.ref_data = Vec::new();
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn count(&self, ttype: TrackType) -> usize {
        self.entries.iter().filter(|e| e.ttype == ttype).count()
    }
}

impl Default for BlockTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;

    #[test]
    fn overflow_reuse_cycle() {
        let store = MemBlockStore::new();
        let mut track = BlockTracker::new();

        track.begin();
        let off = store.write(b"big value").unwrap();
        track.track_ovfl(b"big value", off);
        track.end(&store).unwrap();
        assert_eq!(track.count(TrackType::Ovfl), 1);

        // Next reconcile: same bytes, block is reused, nothing freed.
        track.begin();
        assert_eq!(track.count(TrackType::OvflDiscard), 1);
        assert_eq!(track.ovfl_active(b"big value"), Some(off));
        track.end(&store).unwrap();
        assert_eq!(store.stats().frees, 0);
        assert_eq!(store.live_blocks(), 1);

        // Value changed: the old block is freed at wrap-up.
        track.begin();
        assert_eq!(track.ovfl_active(b"other value"), None);
        track.end(&store).unwrap();
        assert_eq!(store.stats().frees, 1);
        assert_eq!(store.live_blocks(), 0);
    }

    #[test]
    fn empty_reference_never_reused() {
        let store = MemBlockStore::new();
        let mut track = BlockTracker::new();
        track.begin();
        let off = store.write(b"overflow key").unwrap();
        track.track_ovfl(&[], off);
        track.begin();
        assert_eq!(track.ovfl_active(&[]), None);
        track.end(&store).unwrap();
        assert_eq!(store.live_blocks(), 0);
    }

    #[test]
    fn stale_blocks_freed_next_generation() {
        let store = MemBlockStore::new();
        let mut track = BlockTracker::new();
        track.begin();
        let old = store.write(b"image v1").unwrap();
        track.track_block(old);
        track.end(&store).unwrap();
        assert_eq!(store.live_blocks(), 1);

        track.begin();
        let new = store.write(b"image v2").unwrap();
        track.track_block(new);
        track.end(&store).unwrap();
        assert_eq!(store.live_blocks(), 1);
        assert!(store.read(new).is_ok());
        assert!(store.read(old).is_err());
    }

    #[test]
    fn abort_frees_only_fresh_writes() {
        let store = MemBlockStore::new();
        let mut track = BlockTracker::new();
        track.begin();
        let keep = store.write(b"value kept").unwrap();
        track.track_ovfl(b"value kept", keep);
        track.end(&store).unwrap();

        track.begin();
        let fresh = store.write(b"fresh chunk").unwrap();
        track.track_block(fresh);
        track.abort(&store).unwrap();
        assert!(store.read(keep).is_ok());
        assert!(store.read(fresh).is_err());
        // The surviving block is still eligible for reuse next time.
        assert_eq!(track.ovfl_active(b"value kept"), Some(keep));
    }

    #[test]
    fn entry_list_grows_in_chunks() {
        let mut track = BlockTracker::new();
        for i in 0..(TRACK_CHUNK + 5) {
            track.track_block(BlockOff {
                addr: i as u32 + 1,
                size: 1,
            });
        }
        assert!(track.entries.capacity() >= TRACK_CHUNK + 5);
    }
}
