// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use arrayvec::ArrayVec;
use nested_pages::{MmuId, NestedPageAddr, PageSize};
use static_assertions::const_assert;

use crate::{RmapBlockCache, RmapTrackingError, RmapTrackingResult};

/// The number of entries in one overflow block, chosen so that a block fits in
/// a single 4kB allocation.
pub const RMAP_BLOCK_ENTRIES: usize = 170;

/// One reverse mapping: a shadow stage-2 translation of `nested_addr` that was
/// derived from the L1 IPA this entry's head is anchored at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RmapEntry {
    nested_addr: NestedPageAddr,
    mmu: MmuId,
    level: PageSize,
}

impl RmapEntry {
    /// Creates a new `RmapEntry` for a mapping of `nested_addr` installed by
    /// the shadow context `mmu` at granularity `level`.
    pub fn new(nested_addr: NestedPageAddr, mmu: MmuId, level: PageSize) -> Self {
        Self {
            nested_addr,
            mmu,
            level,
        }
    }

    /// Returns the nested guest address (L2 IPA) of the mapping.
    pub fn nested_addr(&self) -> NestedPageAddr {
        self.nested_addr
    }

    /// Returns the identity of the stage-2 context that installed the mapping.
    pub fn mmu(&self) -> MmuId {
        self.mmu
    }

    /// Returns the granularity of the mapping (4kB leaf vs. block).
    pub fn level(&self) -> PageSize {
        self.level
    }
}

/// A fixed-size array of entries linked into a singly-linked chain once a head
/// holds more than one mapping. Entries are kept packed at the front of the
/// array; the first empty slot marks the end of the block's live entries.
#[derive(Debug)]
pub struct RmapBlock {
    entries: ArrayVec<RmapEntry, RMAP_BLOCK_ENTRIES>,
    next: Option<Box<RmapBlock>>,
}

// One block per 4kB allocation unit.
const_assert!(core::mem::size_of::<RmapBlock>() <= 4096);

impl RmapBlock {
    pub(crate) fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
            next: None,
        }
    }

    /// Clears the block for reuse.
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.next = None;
    }
}

/// The per-frame anchor of the reverse map. A frame with no dependents is
/// `Empty`, a frame with exactly one holds it inline as `Single`, and a frame
/// with more fans out to a chain of `RmapBlock`s.
///
/// This is the memory-safe rendition of the low-bit-tagged head word: the
/// enum discriminant replaces bit 0 of the raw value.
#[derive(Debug)]
pub enum RmapHead {
    Empty,
    Single(RmapEntry),
    Chained(Box<RmapBlock>),
}

impl RmapHead {
    /// Returns if this head tracks no mappings.
    pub fn is_empty(&self) -> bool {
        matches!(self, RmapHead::Empty)
    }

    /// Returns the number of mappings tracked by this head.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns an iterator over the mappings tracked by this head. Chained
    /// heads are visited block by block, each block's packed prefix in order.
    pub fn iter(&self) -> RmapIter {
        match self {
            RmapHead::Empty => RmapIter {
                single: None,
                block: None,
                pos: 0,
            },
            RmapHead::Single(entry) => RmapIter {
                single: Some(entry),
                block: None,
                pos: 0,
            },
            RmapHead::Chained(first) => RmapIter {
                single: None,
                block: Some(first),
                pos: 0,
            },
        }
    }

    /// Returns the entry mapping `nested_addr` installed by `mmu`, if any.
    pub fn find(&self, nested_addr: NestedPageAddr, mmu: MmuId) -> Option<RmapEntry> {
        self.iter()
            .find(|e| e.nested_addr == nested_addr && e.mmu == mmu)
            .copied()
    }

    /// Adds `entry` to this head, growing the overflow chain from `cache` if
    /// the head already holds an entry. Never allocates; fails with
    /// `BlockCacheEmpty` if growth is needed and the cache wasn't charged.
    pub fn add(&mut self, entry: RmapEntry, cache: &mut RmapBlockCache) -> RmapTrackingResult<()> {
        match self {
            RmapHead::Empty => {
                *self = RmapHead::Single(entry);
                Ok(())
            }
            RmapHead::Single(_) => {
                // Move the inlined entry into slot 0 of a fresh block and the
                // new entry into slot 1. The block is taken before the head is
                // touched so a dry cache leaves the head intact.
                let mut block = cache.take()?;
                if let RmapHead::Single(current) = core::mem::replace(self, RmapHead::Empty) {
                    block.entries.push(current);
                }
                block.entries.push(entry);
                *self = RmapHead::Chained(block);
                Ok(())
            }
            RmapHead::Chained(first) => {
                let mut block = first.as_mut();
                while block.entries.is_full() {
                    if block.next.is_none() {
                        block.next = Some(cache.take()?);
                    }
                    // Unwrap ok: a next block was just linked if it was missing.
                    block = block.next.as_deref_mut().unwrap();
                }
                block.entries.push(entry);
                Ok(())
            }
        }
    }

    /// Removes `entry` from this head. The matched slot is compacted by
    /// swapping the last live entry of the same block into it; a block that
    /// empties is unlinked and returned to `cache`, and a chain left with a
    /// single live entry is folded back to `Single`.
    pub fn remove(
        &mut self,
        entry: &RmapEntry,
        cache: &mut RmapBlockCache,
    ) -> RmapTrackingResult<()> {
        if matches!(self, RmapHead::Empty) {
            return Err(RmapTrackingError::EntryNotFound);
        }
        if let RmapHead::Single(current) = self {
            if current != entry {
                return Err(RmapTrackingError::EntryMismatch);
            }
            *self = RmapHead::Empty;
            return Ok(());
        }

        let mut emptied = None;
        if let RmapHead::Chained(first) = self {
            // Locate the block holding the entry.
            let mut index = 0;
            let mut slot = None;
            let mut cur = Some(first.as_ref());
            while let Some(block) = cur {
                if let Some(i) = block.entries.iter().position(|e| e == entry) {
                    slot = Some(i);
                    break;
                }
                index += 1;
                cur = block.next.as_deref();
            }
            let Some(slot) = slot else {
                return Err(RmapTrackingError::EntryNotFound);
            };

            // Compact within that block only, even if later blocks still hold
            // entries. Which block eventually empties (and gets unlinked)
            // depends on this staying block-local.
            let mut block = first.as_mut();
            for _ in 0..index {
                // Unwrap ok: `index` blocks were traversed above.
                block = block.next.as_deref_mut().unwrap();
            }
            block.entries.swap_remove(slot);
            if block.entries.is_empty() {
                emptied = Some(index);
            }
        }
        if let Some(index) = emptied {
            self.unlink_block(index, cache);
        }
        self.fold_single(cache);
        Ok(())
    }

    /// Splices the empty block at `index` out of the chain, releasing it back
    /// to `cache`.
    fn unlink_block(&mut self, index: usize, cache: &mut RmapBlockCache) {
        if index == 0 {
            if let RmapHead::Chained(mut first) = core::mem::replace(self, RmapHead::Empty) {
                let next = first.next.take();
                cache.free(first);
                if let Some(next) = next {
                    *self = RmapHead::Chained(next);
                }
            }
            return;
        }
        if let RmapHead::Chained(first) = self {
            let mut prev = first.as_mut();
            for _ in 1..index {
                // Unwrap ok: the chain was walked to `index` by the caller.
                prev = prev.next.as_deref_mut().unwrap();
            }
            // Unwrap ok: same.
            let mut empty = prev.next.take().unwrap();
            prev.next = empty.next.take();
            cache.free(empty);
        }
    }

    /// Folds a chain that holds exactly one live entry in a sole block back
    /// into the `Single` representation, releasing the block. A head is never
    /// left `Chained` with fewer than two live entries.
    fn fold_single(&mut self, cache: &mut RmapBlockCache) {
        let foldable = matches!(self, RmapHead::Chained(first)
            if first.next.is_none() && first.entries.len() == 1);
        if !foldable {
            return;
        }
        if let RmapHead::Chained(mut first) = core::mem::replace(self, RmapHead::Empty) {
            // Unwrap ok: the block holds exactly one entry.
            let entry = first.entries.pop().unwrap();
            cache.free(first);
            *self = RmapHead::Single(entry);
        }
    }
}

impl Default for RmapHead {
    fn default() -> Self {
        RmapHead::Empty
    }
}

/// An iterator over the entries under one `RmapHead`. Finite and lazy; any
/// mutation of the head invalidates it (enforced by the borrow it holds), so
/// callers restart iteration after a removal.
pub struct RmapIter<'a> {
    single: Option<&'a RmapEntry>,
    block: Option<&'a RmapBlock>,
    pos: usize,
}

impl<'a> Iterator for RmapIter<'a> {
    type Item = &'a RmapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.single.take() {
            return Some(entry);
        }
        loop {
            let block = self.block?;
            if let Some(entry) = block.entries.get(self.pos) {
                self.pos += 1;
                return Some(entry);
            }
            self.block = block.next.as_deref();
            self.pos = 0;
        }
    }
}
