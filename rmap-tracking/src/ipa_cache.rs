// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::vec::Vec;
use nested_pages::{GuestPageAddr, NestedPhysAddr, PageSize, SupervisorPageAddr};

use crate::{RmapTrackingError, RmapTrackingResult};

/// The number of entries in a last-level shadow table page: one 4kB page of
/// 8-byte descriptors.
pub const ENTRIES_PER_TABLE: usize = 4096 / 8;

/// The side array for one registered table page.
struct TableSlots {
    table_addr: SupervisorPageAddr,
    slots: Box<[Option<GuestPageAddr>; ENTRIES_PER_TABLE]>,
}

/// The forward cache: for each slot of a last-level shadow table, the L1 IPA
/// whose translation produced the mapping installed there.
///
/// Tearing a shadow mapping down starts from (table page, faulting address)
/// coordinates; the cached L1 IPA recovers the reverse-map key without
/// re-walking anything. A slot is written once per install and cleared once
/// per teardown.
pub struct IpaCache {
    // Maintained in sorted order by table address.
    tables: Vec<TableSlots>,
}

impl IpaCache {
    /// Creates an empty `IpaCache`.
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// Attaches a side array to the last-level table page at `table_addr`.
    /// Called when the table page is allocated; this is the only path that
    /// allocates.
    pub fn register_table(&mut self, table_addr: SupervisorPageAddr) -> RmapTrackingResult<()> {
        let index = match self.table_index(table_addr) {
            Ok(_) => return Err(RmapTrackingError::TableExists),
            Err(index) => index,
        };
        self.tables
            .try_reserve(1)
            .map_err(|_| RmapTrackingError::OutOfMemory)?;
        let entry = TableSlots {
            table_addr,
            slots: Box::new([None; ENTRIES_PER_TABLE]),
        };
        self.tables.insert(index, entry);
        Ok(())
    }

    /// Drops the side array for the table page at `table_addr`. Called when
    /// the table page is freed.
    pub fn unregister_table(&mut self, table_addr: SupervisorPageAddr) -> RmapTrackingResult<()> {
        let index = self
            .table_index(table_addr)
            .map_err(|_| RmapTrackingError::TableNotTracked)?;
        self.tables.remove(index);
        Ok(())
    }

    /// Records that the table slot selected by `fault_addr` at granularity
    /// `level` was derived from the L1 IPA `guest_addr`.
    pub fn record(
        &mut self,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        guest_addr: GuestPageAddr,
        level: PageSize,
    ) -> RmapTrackingResult<()> {
        let index = self
            .table_index(table_addr)
            .map_err(|_| RmapTrackingError::TableNotTracked)?;
        self.tables[index].slots[Self::slot_index(fault_addr, level)] = Some(guest_addr);
        Ok(())
    }

    /// Reads and clears the L1 IPA recorded for the table slot selected by
    /// `fault_addr` at granularity `level`. Returns `None` if nothing was
    /// recorded there; callers skip the reverse-map removal in that case.
    pub fn take(
        &mut self,
        table_addr: SupervisorPageAddr,
        fault_addr: NestedPhysAddr,
        level: PageSize,
    ) -> RmapTrackingResult<Option<GuestPageAddr>> {
        let index = self
            .table_index(table_addr)
            .map_err(|_| RmapTrackingError::TableNotTracked)?;
        Ok(self.tables[index].slots[Self::slot_index(fault_addr, level)].take())
    }

    /// Returns the table slot selected by `fault_addr` for a translation
    /// ending at `level`: the `level`-granule number, modulo the table size.
    fn slot_index(fault_addr: NestedPhysAddr, level: PageSize) -> usize {
        (fault_addr.bits() / level as u64) as usize % ENTRIES_PER_TABLE
    }

    fn table_index(&self, table_addr: SupervisorPageAddr) -> core::result::Result<usize, usize> {
        self.tables
            .binary_search_by(|t| t.table_addr.bits().cmp(&table_addr.bits()))
    }
}

impl Default for IpaCache {
    fn default() -> Self {
        Self::new()
    }
}
