#![forbid(unsafe_code)]
//! Address newtypes, physical segments, and page arithmetic shared by every layer.

use std::fmt;
use std::ops::Add;

use serde::Serialize;
use thiserror::Error;

pub mod page;

/// Default physical page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A virtual address inside a buffer node's storage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct VirtAddr(pub u64);

/// A physical (bus) address as seen by a DMA engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct PhysAddr(pub u64);

impl VirtAddr {
    /// Returns the raw address value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Byte offset of this address within its page.
    pub fn page_offset(self, page_size: usize) -> usize {
        (self.0 & (page_size as u64 - 1)) as usize
    }
}

impl PhysAddr {
    /// Returns the raw address value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: usize) -> VirtAddr {
        VirtAddr(self.0 + rhs as u64)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> PhysAddr {
        PhysAddr(self.0 + rhs as u64)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Returned by an address translator when a virtual address has no
/// physically contiguous backing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("virtual address {0} is not mapped")]
pub struct Unmapped(pub VirtAddr);

/// One `{physical address, length}` descriptor handed to a DMA engine.
///
/// A segment never straddles a page boundary and never exceeds the
/// cursor's maximum segment size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PhysicalSegment {
    /// Physical start address.
    pub location: PhysAddr,
    /// Byte count.
    pub length: usize,
}

impl PhysicalSegment {
    /// Creates a new segment descriptor.
    pub fn new(location: PhysAddr, length: usize) -> Self {
        Self { location, length }
    }

    /// Physical address one past the last byte of the segment.
    pub fn end(&self) -> PhysAddr {
        self.location + self.length
    }
}
