// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use nested_pages::{
    GuestPageAddr, GuestPhysAddr, MmuId, NestedPageAddr, NestedPhysAddr, PageAddr, PageSize,
    SupervisorPageAddr,
};

use crate::block_cache::RmapBlockCache;
use crate::ipa_cache::IpaCache;
use crate::rmap_list::{RmapEntry, RmapIter};
use crate::rmap_map::RmapMap;
use crate::MemSlotResult;

/// Errors related to maintaining the reverse map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The guest address isn't covered by any registered region.
    AddressNotTracked(GuestPageAddr),
    /// No entry for the given mapping exists under the head. Removing a
    /// mapping that was never added (or was already removed) is a caller bug
    /// that would otherwise hide dangling shadow translations.
    EntryNotFound,
    /// Asked to remove an entry that doesn't match the head's sole entry.
    EntryMismatch,
    /// The block cache had no charged block when a chain needed to grow. The
    /// caller must charge the cache before starting a mutation batch.
    BlockCacheEmpty,
    /// Heap exhausted while charging a cache or registering a table.
    OutOfMemory,
    /// The last-level table page has no attached forward cache.
    TableNotTracked,
    /// The last-level table page already has a forward cache attached.
    TableExists,
}

/// Holds the result of reverse-map operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The front end of the reverse-mapping index.
///
/// Wires the memslot directory, the per-frame heads, and the per-table forward
/// caches together behind the operations the shadow-table builder and
/// invalidator call. `RmapTracker` has no locking of its own; every mutation
/// runs under the caller's exclusive stage-2 write lock.
pub struct RmapTracker {
    heads: RmapMap,
    ipa_cache: IpaCache,
}

impl RmapTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            heads: RmapMap::new(),
            ipa_cache: IpaCache::new(),
        }
    }

    /// Registers `num_pages` frames of tracked outer-guest memory starting at
    /// `base`. Mappings of untracked frames are ignored by `add()`.
    pub fn add_region(&mut self, base: GuestPageAddr, num_pages: usize) -> MemSlotResult<()> {
        self.heads.add_region(base, num_pages)
    }

    /// Attaches a forward cache to the last-level shadow table page at
    /// `table_addr`. Called when the table page is allocated.
    pub fn register_table(&mut self, table_addr: SupervisorPageAddr) -> Result<()> {
        self.ipa_cache.register_table(table_addr)
    }

    /// Detaches and drops the forward cache of the table page at `table_addr`.
    /// Called when the table page is freed.
    pub fn unregister_table(&mut self, table_addr: SupervisorPageAddr) -> Result<()> {
        self.ipa_cache.unregister_table(table_addr)
    }

    /// Records a new shadow translation: the mapping of `nested_addr` at
    /// `level`, installed by `mmu` and derived from `guest_addr`. Overflow
    /// blocks are drawn from `cache`; this never allocates. Adding a mapping
    /// for an untracked guest address is a no-op.
    pub fn add(
        &mut self,
        mmu: MmuId,
        nested_addr: NestedPhysAddr,
        guest_addr: GuestPhysAddr,
        level: PageSize,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        let key = PageAddr::with_round_down(guest_addr, PageSize::Size4k);
        let nested_addr = PageAddr::with_round_down(nested_addr, PageSize::Size4k);
        let Some(head) = self.heads.get_mut(key) else {
            // Untracked frames have nothing to invalidate later.
            return Ok(());
        };
        head.add(RmapEntry::new(nested_addr, mmu, level), cache)
    }

    /// Records a 4kB leaf translation. See `add()`.
    pub fn add_page(
        &mut self,
        mmu: MmuId,
        nested_addr: NestedPhysAddr,
        guest_addr: GuestPhysAddr,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        self.add(mmu, nested_addr, guest_addr, PageSize::Size4k, cache)
    }

    /// Records a 2MB block translation. See `add()`.
    pub fn add_block(
        &mut self,
        mmu: MmuId,
        nested_addr: NestedPhysAddr,
        guest_addr: GuestPhysAddr,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        self.add(mmu, nested_addr, guest_addr, PageSize::Size2M, cache)
    }

    /// Returns an iterator over every shadow mapping derived from the frame at
    /// `key`, or `None` if the frame is untracked. Callers invalidating a
    /// frame walk this and tear down each dependent translation.
    pub fn entries(&self, key: GuestPageAddr) -> Option<RmapIter> {
        Some(self.heads.get(key)?.iter())
    }

    /// Returns the entry recording `mmu`'s mapping of `nested_addr` under
    /// `key`, if present.
    pub fn find_entry(
        &self,
        key: GuestPageAddr,
        nested_addr: NestedPageAddr,
        mmu: MmuId,
    ) -> Option<RmapEntry> {
        self.heads.get(key)?.find(nested_addr, mmu)
    }

    /// Removes `entry` from the head at `key`, compacting its chain. Freed
    /// overflow blocks are returned to `cache`.
    pub fn remove(
        &mut self,
        key: GuestPageAddr,
        entry: &RmapEntry,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        let head = self
            .heads
            .get_mut(key)
            .ok_or(Error::AddressNotTracked(key))?;
        head.remove(entry, cache)
    }

    /// Records that the shadow-table slot selected by `fault_addr` in the
    /// table at `table_addr` was derived from `guest_addr`. Called alongside
    /// `add()` when the translation is installed.
    pub fn record_ipa(
        &mut self,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        guest_addr: GuestPageAddr,
        level: PageSize,
    ) -> Result<()> {
        self.ipa_cache.record(table_addr, fault_addr, guest_addr, level)
    }

    /// Reads and clears the L1 IPA recorded for a shadow-table slot. Returns
    /// `None` if nothing was recorded.
    pub fn take_ipa(
        &mut self,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        level: PageSize,
    ) -> Result<Option<GuestPageAddr>> {
        self.ipa_cache.take(table_addr, fault_addr, level)
    }

    /// Tears down the reverse-map state for one shadow-table slot: recovers
    /// the L1 IPA from the forward cache, removes the matching entry from its
    /// head, and leaves the slot cleared. Mappings of the main (non-nested)
    /// MMU carry no reverse-map state and are skipped.
    pub fn remove_mapping(
        &mut self,
        mmu: MmuId,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        level: PageSize,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        if mmu.is_main() {
            return Ok(());
        }
        let Some(key) = self.ipa_cache.take(table_addr, fault_addr, level)? else {
            return Ok(());
        };
        let nested_addr = PageAddr::with_round_down(fault_addr, PageSize::Size4k);
        if let Some(entry) = self.find_entry(key, nested_addr, mmu) {
            self.remove(key, &entry, cache)?;
        }
        Ok(())
    }

    /// Tears down the reverse-map state for a 4kB leaf slot. See
    /// `remove_mapping()`.
    pub fn remove_page_mapping(
        &mut self,
        mmu: MmuId,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        self.remove_mapping(mmu, table_addr, fault_addr, PageSize::Size4k, cache)
    }

    /// Tears down the reverse-map state for a 2MB block slot. See
    /// `remove_mapping()`.
    pub fn remove_block_mapping(
        &mut self,
        mmu: MmuId,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        cache: &mut RmapBlockCache,
    ) -> Result<()> {
        self.remove_mapping(mmu, table_addr, fault_addr, PageSize::Size2M, cache)
    }
}

impl Default for RmapTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nested_pages::RawAddr;

    const REGION_BASE: u64 = 0x1000_0000;
    const TABLE_ADDR: u64 = 0x8020_0000;

    fn tracked_tracker() -> RmapTracker {
        let mut tracker = RmapTracker::new();
        let base = PageAddr::new(RawAddr::guest(REGION_BASE)).unwrap();
        tracker.add_region(base, 64).unwrap();
        tracker
            .register_table(PageAddr::new(RawAddr::supervisor(TABLE_ADDR)).unwrap())
            .unwrap();
        tracker
    }

    fn key(addr: u64) -> GuestPageAddr {
        PageAddr::new(RawAddr::guest(addr)).unwrap()
    }

    fn table() -> SupervisorPageAddr {
        PageAddr::new(RawAddr::supervisor(TABLE_ADDR)).unwrap()
    }

    #[test]
    fn round_trip_accounting() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();
        cache.topup(4).unwrap();
        let charged = cache.charged();

        // Three shadow contexts map the same guest frame.
        let guest_addr = RawAddr::guest(REGION_BASE + 0x3000);
        for i in 1..=3 {
            let mmu = MmuId::new(i).unwrap();
            tracker
                .add_page(mmu, RawAddr::nested(0x4000_0000 + 0x1000 * i), guest_addr, &mut cache)
                .unwrap();
        }
        assert_eq!(tracker.entries(key(REGION_BASE + 0x3000)).unwrap().count(), 3);

        // Remove them in an arbitrary order; the head empties and every
        // charged block comes back.
        for i in [2u64, 3, 1] {
            let mmu = MmuId::new(i).unwrap();
            let nested = PageAddr::new(RawAddr::nested(0x4000_0000 + 0x1000 * i)).unwrap();
            let entry = tracker
                .find_entry(key(REGION_BASE + 0x3000), nested, mmu)
                .unwrap();
            tracker
                .remove(key(REGION_BASE + 0x3000), &entry, &mut cache)
                .unwrap();
        }
        assert_eq!(tracker.entries(key(REGION_BASE + 0x3000)).unwrap().count(), 0);
        assert_eq!(cache.charged(), charged);
    }

    #[test]
    fn entries_yielded_exactly_once() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();
        cache.topup(1).unwrap();

        let guest_addr = RawAddr::guest(REGION_BASE + 0x5000);
        let mmu = MmuId::new(1).unwrap();
        let nested_addrs = [0x4000_1000u64, 0x4000_2000, 0x4000_3000];
        for addr in nested_addrs {
            tracker
                .add_page(mmu, RawAddr::nested(addr), guest_addr, &mut cache)
                .unwrap();
        }

        let seen: std::vec::Vec<u64> = tracker
            .entries(key(REGION_BASE + 0x5000))
            .unwrap()
            .map(|e| e.nested_addr().bits())
            .collect();
        assert_eq!(seen.len(), nested_addrs.len());
        for addr in nested_addrs {
            assert_eq!(seen.iter().filter(|&&s| s == addr).count(), 1);
        }
    }

    #[test]
    fn untracked_addresses() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();

        // Adding a mapping of an untracked frame is a no-op.
        tracker
            .add_page(
                MmuId::new(1).unwrap(),
                RawAddr::nested(0x4000_0000),
                RawAddr::guest(0x9000_0000),
                &mut cache,
            )
            .unwrap();
        assert!(tracker.entries(key(0x9000_0000)).is_none());

        // Removing against an untracked frame is a caller bug.
        let entry = RmapEntry::new(
            PageAddr::new(RawAddr::nested(0x4000_0000)).unwrap(),
            MmuId::new(1).unwrap(),
            PageSize::Size4k,
        );
        assert_eq!(
            tracker.remove(key(0x9000_0000), &entry, &mut cache),
            Err(Error::AddressNotTracked(key(0x9000_0000)))
        );
    }

    #[test]
    fn unmap_through_forward_cache() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();
        cache.topup(1).unwrap();

        let mmu = MmuId::new(5).unwrap();
        let fault = RawAddr::nested(0x4000_7000);
        let guest_addr = RawAddr::guest(REGION_BASE + 0x8000);
        tracker.add_page(mmu, fault, guest_addr, &mut cache).unwrap();
        tracker
            .record_ipa(table(), fault, key(REGION_BASE + 0x8000), PageSize::Size4k)
            .unwrap();

        tracker
            .remove_page_mapping(mmu, table(), fault, &mut cache)
            .unwrap();
        assert_eq!(tracker.entries(key(REGION_BASE + 0x8000)).unwrap().count(), 0);
        // The slot is cleared until re-recorded.
        assert_eq!(
            tracker.take_ipa(table(), fault, PageSize::Size4k).unwrap(),
            None
        );

        // A second teardown of the same slot finds nothing and does nothing.
        tracker
            .remove_page_mapping(mmu, table(), fault, &mut cache)
            .unwrap();
    }

    #[test]
    fn main_mmu_skipped() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();

        let fault = RawAddr::nested(0x4000_7000);
        tracker
            .record_ipa(table(), fault, key(REGION_BASE + 0x8000), PageSize::Size4k)
            .unwrap();
        tracker
            .remove_page_mapping(MmuId::main(), table(), fault, &mut cache)
            .unwrap();
        // Main-MMU teardown leaves the forward cache untouched.
        assert_eq!(
            tracker.take_ipa(table(), fault, PageSize::Size4k).unwrap(),
            Some(key(REGION_BASE + 0x8000))
        );
    }

    #[test]
    fn block_mapping_round_trip() {
        let mut tracker = tracked_tracker();
        let mut cache = RmapBlockCache::new();
        cache.topup(1).unwrap();

        let mmu = MmuId::new(2).unwrap();
        let fault = RawAddr::nested(0x4060_0000);
        let guest_addr = RawAddr::guest(REGION_BASE + 0x2000);
        tracker.add_block(mmu, fault, guest_addr, &mut cache).unwrap();
        tracker
            .record_ipa(table(), fault, key(REGION_BASE + 0x2000), PageSize::Size2M)
            .unwrap();

        let entry = tracker
            .entries(key(REGION_BASE + 0x2000))
            .unwrap()
            .next()
            .copied()
            .unwrap();
        assert_eq!(entry.level(), PageSize::Size2M);

        tracker
            .remove_block_mapping(mmu, table(), fault, &mut cache)
            .unwrap();
        assert_eq!(tracker.entries(key(REGION_BASE + 0x2000)).unwrap().count(), 0);
    }
}
