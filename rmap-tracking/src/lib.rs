// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Nested stage-2 reverse-mapping tracking
//!
//! When a shadow stage-2 table maps a nested guest's address (L2 IPA) down to
//! an outer guest's address (L1 IPA), later changes to the L1 IPA must find
//! and invalidate every shadow entry derived from it. This crate maintains
//! that reverse index.
//!
//! ## Key types
//!
//! - `RmapTracker` - The front end. Composes the memslot directory, the
//!   per-frame reverse-map heads, and the per-table forward caches, and is
//!   driven by the shadow-table builder under its stage-2 write lock.
//! - `RmapMap` - Maps an L1 IPA to the `RmapHead` for its page frame, through
//!   a directory of registered memory regions.
//! - `RmapHead` - The per-frame anchor: empty, a single inlined `RmapEntry`,
//!   or a chain of `RmapBlock`s once a frame has multiple dependents.
//! - `RmapBlockCache` - A pre-charged supply of overflow blocks. Charged by
//!   the caller before a mutation batch; the map and unmap paths themselves
//!   never allocate.
//! - `IpaCache` - The forward cache: for each slot of a last-level shadow
//!   table, the L1 IPA that produced the mapping there, so teardown can
//!   recover the index key from the table coordinates alone.
//!
//! ## Locking
//!
//! The tracker has no internal locking. All mutation is expected to run under
//! the exclusive lock that serializes edits of the affected shadow stage-2
//! table; concurrent read-only iteration of different heads is fine.
#![no_std]

extern crate alloc;

/// Implements the pre-charged overflow-block supply.
pub mod block_cache;
/// Implements the per-table forward cache of L1 IPAs.
pub mod ipa_cache;
mod rmap_list;
mod rmap_map;
mod rmap_tracker;

pub use block_cache::RmapBlockCache;
pub use ipa_cache::{IpaCache, ENTRIES_PER_TABLE};
pub use rmap_list::{RmapBlock, RmapEntry, RmapHead, RmapIter, RMAP_BLOCK_ENTRIES};
pub use rmap_map::Error as MemSlotError;
pub use rmap_map::Result as MemSlotResult;
pub use rmap_map::RmapMap;
pub use rmap_tracker::Error as RmapTrackingError;
pub use rmap_tracker::Result as RmapTrackingResult;
pub use rmap_tracker::RmapTracker;

#[cfg(test)]
#[macro_use]
extern crate std;
