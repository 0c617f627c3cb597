// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use nested_pages::GuestPageAddr;

use crate::rmap_list::RmapHead;

/// The maximum number of tracked memory regions. Statically sized; region
/// registration mirrors memslot creation and a handful of slots is plenty.
const MAX_RMAP_REGIONS: usize = 32;

/// Maps a contiguous range of guest memory to a subset of the head array.
#[derive(Clone, Copy, Debug)]
struct RegionEntry {
    base_pfn: usize,
    num_pages: usize,
    heads_index: usize,
}

/// Errors that can be raised while registering regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Region is empty or its end overflows the frame number space.
    InvalidRegion,

    /// Region overlaps with another one.
    OverlappingRegion,

    /// No more entries available in the region directory.
    OutOfSpace,

    /// Heap exhausted while reserving head storage.
    OutOfMemory,
}

/// Holds the result of region directory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Keeps a reverse-map head for every guest page frame in a registered
/// region. Heads are stored in one flat array; a small directory of regions,
/// kept sorted by base frame, maps a frame number to its slot as
/// `frame - region base frame`.
pub struct RmapMap {
    heads: Vec<RmapHead>,
    regions: ArrayVec<RegionEntry, MAX_RMAP_REGIONS>,
}

impl RmapMap {
    /// Creates an empty `RmapMap`. Regions are registered as the outer guest's
    /// memory is described to the hypervisor.
    pub fn new() -> Self {
        Self {
            heads: Vec::new(),
            regions: ArrayVec::new(),
        }
    }

    /// Registers `num_pages` frames of tracked guest memory starting at
    /// `base`. Head storage is reserved here, never on the map/unmap paths.
    pub fn add_region(&mut self, base: GuestPageAddr, num_pages: usize) -> Result<()> {
        if num_pages == 0 {
            return Err(Error::InvalidRegion);
        }
        let base_pfn = base.index();
        let end_pfn = base_pfn
            .checked_add(num_pages)
            .ok_or(Error::InvalidRegion)?;
        let mut index = 0;
        for other in &self.regions {
            if other.base_pfn >= end_pfn {
                break;
            }
            if other.base_pfn + other.num_pages > base_pfn {
                return Err(Error::OverlappingRegion);
            }
            index += 1;
        }

        self.heads
            .try_reserve(num_pages)
            .map_err(|_| Error::OutOfMemory)?;
        let entry = RegionEntry {
            base_pfn,
            num_pages,
            heads_index: self.heads.len(),
        };
        self.regions
            .try_insert(index, entry)
            .map_err(|_| Error::OutOfSpace)?;
        self.heads
            .resize_with(entry.heads_index + num_pages, RmapHead::default);
        Ok(())
    }

    /// Returns a reference to the head for the frame at `addr`, or `None` if
    /// no registered region covers it.
    pub fn get(&self, addr: GuestPageAddr) -> Option<&RmapHead> {
        let index = self.head_index(addr)?;
        self.heads.get(index)
    }

    /// Returns a mutable reference to the head for the frame at `addr`.
    pub fn get_mut(&mut self, addr: GuestPageAddr) -> Option<&mut RmapHead> {
        let index = self.head_index(addr)?;
        self.heads.get_mut(index)
    }

    /// Returns the slot in the head array for the given address.
    fn head_index(&self, addr: GuestPageAddr) -> Option<usize> {
        self.regions
            .iter()
            .find(|r| r.base_pfn <= addr.index() && addr.index() < r.base_pfn + r.num_pages)
            .map(|r| r.heads_index + addr.index() - r.base_pfn)
    }
}

impl Default for RmapMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nested_pages::RawAddr;

    fn page_addr(addr: u64) -> GuestPageAddr {
        GuestPageAddr::new(RawAddr::guest(addr)).unwrap()
    }

    #[test]
    fn indexing() {
        let mut map = RmapMap::new();
        let num_pages = 10;
        let base = page_addr(0x1000_0000);
        map.add_region(base, num_pages).unwrap();

        let before = page_addr(0x1000_0000 - 0x1000);
        let last = base.checked_add_pages(num_pages as u64 - 1).unwrap();
        let after = last.checked_add_pages(1).unwrap();

        assert!(map.get(before).is_none());
        assert!(map.get(base).is_some());
        assert!(map.get(last).is_some());
        assert!(map.get(after).is_none());
    }

    #[test]
    fn sparse_regions() {
        let mut map = RmapMap::new();
        // Registered out of order; the directory keeps them sorted.
        map.add_region(page_addr(0x2000_0000), 16).unwrap();
        map.add_region(page_addr(0x1000_0000), 16).unwrap();

        assert!(map.get(page_addr(0x1000_3000)).is_some());
        assert!(map.get(page_addr(0x2000_f000)).is_some());
        assert!(map.get(page_addr(0x1800_0000)).is_none());

        // Heads from different regions are distinct slots.
        let a = page_addr(0x1000_0000);
        let b = page_addr(0x2000_0000);
        assert!(map.get(a).unwrap().is_empty());
        assert!(map.get(b).unwrap().is_empty());
    }

    #[test]
    fn overlap_rejected() {
        let mut map = RmapMap::new();
        map.add_region(page_addr(0x1000_0000), 16).unwrap();
        assert_eq!(
            map.add_region(page_addr(0x1000_8000), 16),
            Err(Error::OverlappingRegion)
        );
        assert_eq!(
            map.add_region(page_addr(0x0fff_8000), 16),
            Err(Error::OverlappingRegion)
        );
        assert_eq!(map.add_region(page_addr(0x3000_0000), 0), Err(Error::InvalidRegion));
        // Adjacent regions are fine.
        map.add_region(page_addr(0x1001_0000), 16).unwrap();
    }
}
