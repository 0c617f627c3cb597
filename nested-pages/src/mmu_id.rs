// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// `MmuId` identifies a stage-2 translation context (an MMU). The main MMU,
/// which translates the outer guest's stage-2 directly, is special cased;
/// every shadow stage-2 context built for a nested guest gets a nonzero id.
///
/// Holders compare `MmuId`s by identity only; the id is never a reference to
/// the context it names.
/// 0 = main MMU
/// 1..u64::max = shadow MMU id
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmuId {
    id: u64,
}

impl MmuId {
    const MAIN: u64 = 0;

    /// Creates a new MmuId with the given raw value. Returns `None` if the
    /// value is reserved for the main MMU.
    pub fn new(id: u64) -> Option<Self> {
        if id == Self::MAIN {
            None
        } else {
            Some(Self { id })
        }
    }

    /// Returns the ID of the main (non-nested) stage-2 MMU.
    pub fn main() -> Self {
        Self { id: Self::MAIN }
    }

    /// Returns true if this is the main (non-nested) stage-2 MMU.
    pub fn is_main(&self) -> bool {
        self.id == Self::MAIN
    }

    /// Returns the raw value of the MmuId.
    pub fn raw(&self) -> u64 {
        self.id
    }
}

/// `AddressSpace` identifies the address space that a raw address is in.
pub trait AddressSpace: Clone + Copy {}
