// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::rmap_list::RmapBlock;
use crate::{RmapTrackingError, RmapTrackingResult};

/// A pre-charged supply of overflow blocks.
///
/// Growing a reverse-map chain must not allocate: it runs under the lock that
/// also serializes shadow-table edits, and allocating there could re-enter
/// memory reclaim. The owner charges the cache with `topup()` before starting
/// a mutation batch; `take()` only ever pops an already-charged block, and
/// blocks freed by chain compaction come back via `free()`.
pub struct RmapBlockCache {
    free: Vec<Box<RmapBlock>>,
}

impl RmapBlockCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Charges the cache up to at least `min_blocks` free blocks. This is the
    /// only operation that allocates.
    pub fn topup(&mut self, min_blocks: usize) -> RmapTrackingResult<()> {
        if self.free.len() >= min_blocks {
            return Ok(());
        }
        let needed = min_blocks - self.free.len();
        self.free
            .try_reserve(needed)
            .map_err(|_| RmapTrackingError::OutOfMemory)?;
        for _ in 0..needed {
            self.free.push(Box::new(RmapBlock::new()));
        }
        Ok(())
    }

    /// Returns the number of charged blocks.
    pub fn charged(&self) -> usize {
        self.free.len()
    }

    /// Takes one charged block. Fails if the cache is dry; callers are
    /// expected to have charged enough capacity before mutating.
    pub(crate) fn take(&mut self) -> RmapTrackingResult<Box<RmapBlock>> {
        self.free.pop().ok_or(RmapTrackingError::BlockCacheEmpty)
    }

    /// Returns a block to the cache.
    pub(crate) fn free(&mut self, mut block: Box<RmapBlock>) {
        block.reset();
        self.free.push(block);
    }
}

impl Default for RmapBlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_drain() {
        let mut cache = RmapBlockCache::new();
        assert_eq!(cache.charged(), 0);
        assert_eq!(cache.take().err(), Some(RmapTrackingError::BlockCacheEmpty));

        cache.topup(3).unwrap();
        assert_eq!(cache.charged(), 3);
        // A second topup to a lower watermark changes nothing.
        cache.topup(1).unwrap();
        assert_eq!(cache.charged(), 3);

        let block = cache.take().unwrap();
        assert_eq!(cache.charged(), 2);
        cache.free(block);
        assert_eq!(cache.charged(), 3);
    }
}
