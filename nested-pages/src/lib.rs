// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Nested stage-2 address and identity types
//!
//! - `PageAddr` / `RawAddr` / `Pfn` represent addresses tagged with the address
//!   space they belong to: the outer guest's IPA space (`GuestPhys`), the
//!   nested guest's IPA space (`NestedPhys`), or the hypervisor's physical
//!   address space (`SupervisorPhys`).
//! - `MmuId` identifies a stage-2 translation context. It is an opaque token,
//!   compared by identity only.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod address;
mod mmu_id;

pub use address::*;
pub use mmu_id::{AddressSpace, MmuId};
