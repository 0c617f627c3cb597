// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::mmu_id::AddressSpace;

const PFN_SHIFT: u64 = 12;
const PFN_BITS: u64 = 44;
const PFN_MASK: u64 = (1 << PFN_BITS) - 1;

/// The size of a stage-2 mapping: a 4kB leaf or one of the block (huge)
/// mapping sizes.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
    Size512G = 512 * 1024 * 1024 * 1024,
}

impl PageSize {
    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds up the quantity to the nearest multiple of this page size.
    pub fn round_up(&self, val: u64) -> u64 {
        (val + *self as u64 - 1) & !(*self as u64 - 1)
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }

    /// Returns if the size is a block (> 4kB) mapping size.
    pub fn is_huge(&self) -> bool {
        !matches!(*self, PageSize::Size4k)
    }
}

/// A raw address in an address space.
#[derive(Copy, Clone, Debug)]
pub struct RawAddr<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> RawAddr<AS> {
    pub fn new(addr: u64, address_space: AS) -> Self {
        Self(addr, address_space)
    }

    /// Returns the inner 64-bit address.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the address space for the address.
    pub fn address_space(&self) -> AS {
        self.1
    }

    /// Returns the address incremented by the given number of bytes.
    /// Returns None if the result would overflow.
    pub fn checked_increment(&self, increment: u64) -> Option<Self> {
        let addr = self.0.checked_add(increment)?;
        Some(Self(addr, self.1))
    }
}

impl RawAddr<GuestPhys> {
    pub fn guest(addr: u64) -> Self {
        Self(addr, GuestPhys)
    }
}

impl RawAddr<NestedPhys> {
    pub fn nested(addr: u64) -> Self {
        Self(addr, NestedPhys)
    }
}

impl RawAddr<SupervisorPhys> {
    pub fn supervisor(addr: u64) -> Self {
        Self(addr, SupervisorPhys)
    }
}

/// Convenience type aliases for the address spaces of a nested system.
pub type GuestPhysAddr = RawAddr<GuestPhys>;
pub type NestedPhysAddr = RawAddr<NestedPhys>;
pub type SupervisorPhysAddr = RawAddr<SupervisorPhys>;

impl<AS: AddressSpace> From<PageAddr<AS>> for RawAddr<AS> {
    fn from(p: PageAddr<AS>) -> RawAddr<AS> {
        p.addr
    }
}

impl<AS: AddressSpace> PartialEq for RawAddr<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<AS: AddressSpace> Eq for RawAddr<AS> {}

impl<AS: AddressSpace> PartialOrd for RawAddr<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

/// An address of a page in an address space. It is guaranteed to be aligned to
/// a page boundary.
#[derive(Copy, Clone, Debug)]
pub struct PageAddr<AS: AddressSpace> {
    addr: RawAddr<AS>,
}

pub type GuestPageAddr = PageAddr<GuestPhys>;
pub type NestedPageAddr = PageAddr<NestedPhys>;
pub type SupervisorPageAddr = PageAddr<SupervisorPhys>;

impl<AS: AddressSpace> PageAddr<AS> {
    /// Creates a 4kB-aligned `PageAddr` from a `RawAddr`, returning `None` if
    /// the address isn't aligned.
    pub fn new(addr: RawAddr<AS>) -> Option<Self> {
        Self::with_alignment(addr, PageSize::Size4k)
    }

    /// Creates a `PageAddr` from a `RawAddr`, returns `None` if the address
    /// isn't aligned to the requested page size.
    pub fn with_alignment(addr: RawAddr<AS>, alignment: PageSize) -> Option<Self> {
        if alignment.is_aligned(addr.bits()) {
            Some(PageAddr { addr })
        } else {
            None
        }
    }

    /// Creates a `PageAddr` from a `Pfn`.
    pub fn from_pfn(pfn: Pfn<AS>, alignment: PageSize) -> Option<Self> {
        let phys_addr = RawAddr(pfn.0 << PFN_SHIFT, pfn.1);
        Self::with_alignment(phys_addr, alignment)
    }

    /// Creates a `PageAddr` from a `RawAddr`, rounding down to the nearest
    /// multiple of the page size.
    pub fn with_round_down(addr: RawAddr<AS>, alignment: PageSize) -> Self {
        Self {
            addr: RawAddr::new(alignment.round_down(addr.bits()), addr.address_space()),
        }
    }

    /// Gets the raw bits of the page address.
    pub fn bits(&self) -> u64 {
        self.addr.0
    }

    /// Returns if this address is aligned to the given page size.
    pub fn is_aligned(&self, alignment: PageSize) -> bool {
        alignment.is_aligned(self.addr.0)
    }

    /// Gets the pfn of the page address.
    pub fn pfn(&self) -> Pfn<AS> {
        Pfn::new((self.addr.0 >> PFN_SHIFT) & PFN_MASK, self.addr.1)
    }

    /// Adds `n` 4kB pages to the current address.
    pub fn checked_add_pages(&self, n: u64) -> Option<Self> {
        n.checked_mul(PageSize::Size4k as u64)
            .and_then(|inc| self.addr.checked_increment(inc))
            .and_then(Self::new)
    }

    /// Gets the index of the page in the address space (the linear page count
    /// from address 0).
    pub fn index(&self) -> usize {
        self.pfn().bits() as usize
    }
}

impl<AS: AddressSpace> PartialEq for PageAddr<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<AS: AddressSpace> Eq for PageAddr<AS> {}

impl<AS: AddressSpace> PartialOrd for PageAddr<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        self.addr.partial_cmp(&other.addr)
    }
}

/// The page number of a page.
#[derive(Copy, Clone, Debug)]
pub struct Pfn<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> Pfn<AS> {
    pub fn new(bits: u64, address_space: AS) -> Self {
        Pfn(bits, address_space)
    }

    /// Returns the raw bits of the page number.
    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn address_space(&self) -> AS {
        self.1
    }
}

pub type GuestPfn = Pfn<GuestPhys>;
pub type NestedPfn = Pfn<NestedPhys>;

impl<AS: AddressSpace> From<PageAddr<AS>> for Pfn<AS> {
    fn from(page: PageAddr<AS>) -> Pfn<AS> {
        Pfn(page.addr.0 >> PFN_SHIFT, page.addr.1)
    }
}

impl<AS: AddressSpace> PartialEq for Pfn<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// Represents the outer guest's intermediate physical address space. These
/// addresses are the keys of the reverse-mapping index.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GuestPhys;

impl AddressSpace for GuestPhys {}

/// Represents a nested guest's intermediate physical address space, translated
/// through a shadow stage-2 table down to the outer guest's.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NestedPhys;

impl AddressSpace for NestedPhys {}

/// Represents the hypervisor's (i.e. "actual") physical address space, which
/// is where shadow stage-2 table pages live.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SupervisorPhys;

impl AddressSpace for SupervisorPhys {}
