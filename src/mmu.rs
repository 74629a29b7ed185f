#![forbid(unsafe_code)]
//! Virtual-to-physical address translation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::page::trunc_page;
use crate::types::{PhysAddr, Unmapped, VirtAddr, PAGE_SIZE};

/// Translates a virtual address into a physical one.
///
/// `Err(Unmapped)` means the address has no physically contiguous backing.
/// Callers treat it as a recoverable, per-packet condition.
pub trait AddressTranslator {
    /// Returns the physical address backing `virt`.
    fn to_physical(&self, virt: VirtAddr) -> Result<PhysAddr, Unmapped>;
}

impl<T: AddressTranslator + ?Sized> AddressTranslator for &T {
    fn to_physical(&self, virt: VirtAddr) -> Result<PhysAddr, Unmapped> {
        (**self).to_physical(virt)
    }
}

/// Adapts a closure into an [`AddressTranslator`].
pub struct FnTranslator<F>(pub F);

impl<F> AddressTranslator for FnTranslator<F>
where
    F: Fn(VirtAddr) -> Result<PhysAddr, Unmapped>,
{
    fn to_physical(&self, virt: VirtAddr) -> Result<PhysAddr, Unmapped> {
        (self.0)(virt)
    }
}

/// Simulated page table.
///
/// Every page maps linearly (`phys = virt - virt_base + phys_base`) unless it
/// has an explicit frame override or has been punched out as a hole.
pub struct PageTable {
    page_size: usize,
    virt_base: u64,
    phys_base: u64,
    frames: HashMap<u64, u64>,
    holes: HashSet<u64>,
    lookups: AtomicU64,
}

impl PageTable {
    /// Linear mapping of `virt_base` onto `phys_base`.
    pub fn linear(page_size: usize, virt_base: u64, phys_base: u64) -> Self {
        Self {
            page_size,
            virt_base: trunc_page(virt_base, page_size),
            phys_base: trunc_page(phys_base, page_size),
            frames: HashMap::new(),
            holes: HashSet::new(),
            lookups: AtomicU64::new(0),
        }
    }

    /// Page size of the table.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Maps the page holding `virt` to the frame holding `phys`.
    pub fn map_page(&mut self, virt: VirtAddr, phys: PhysAddr) {
        let page = trunc_page(virt.0, self.page_size);
        self.holes.remove(&page);
        self.frames.insert(page, trunc_page(phys.0, self.page_size));
    }

    /// Removes the mapping for the page holding `virt`.
    pub fn unmap_page(&mut self, virt: VirtAddr) {
        let page = trunc_page(virt.0, self.page_size);
        self.frames.remove(&page);
        self.holes.insert(page);
    }

    /// Number of translations served or refused so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::linear(PAGE_SIZE, 0, 0x8000_0000)
    }
}

impl AddressTranslator for PageTable {
    fn to_physical(&self, virt: VirtAddr) -> Result<PhysAddr, Unmapped> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let page = trunc_page(virt.0, self.page_size);
        if self.holes.contains(&page) || page < self.virt_base {
            return Err(Unmapped(virt));
        }
        let offset = virt.0 - page;
        let frame = match self.frames.get(&page) {
            Some(&frame) => frame,
            None => page - self.virt_base + self.phys_base,
        };
        Ok(PhysAddr(frame + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_mapping_preserves_page_offset() {
        let table = PageTable::linear(4096, 0x1000_0000, 0x8000_0000);
        assert_eq!(
            table.to_physical(VirtAddr(0x1000_2abc)),
            Ok(PhysAddr(0x8000_2abc))
        );
        assert_eq!(table.lookups(), 1);
    }

    #[test]
    fn holes_and_overrides() {
        let mut table = PageTable::linear(4096, 0x1000_0000, 0x8000_0000);
        table.unmap_page(VirtAddr(0x1000_1000));
        assert_eq!(
            table.to_physical(VirtAddr(0x1000_1010)),
            Err(Unmapped(VirtAddr(0x1000_1010)))
        );
        table.map_page(VirtAddr(0x1000_1000), PhysAddr(0x4_0000));
        assert_eq!(
            table.to_physical(VirtAddr(0x1000_1010)),
            Ok(PhysAddr(0x4_0010))
        );
    }

    #[test]
    fn addresses_below_base_are_unmapped() {
        let table = PageTable::linear(4096, 0x1000_0000, 0);
        assert!(table.to_physical(VirtAddr(0x0fff_ffff)).is_err());
    }

    #[test]
    fn closures_translate() {
        let identity =
            FnTranslator(|v: VirtAddr| -> Result<PhysAddr, Unmapped> { Ok(PhysAddr(v.0)) });
        assert_eq!(identity.to_physical(VirtAddr(42)), Ok(PhysAddr(42)));
        let by_ref: &dyn AddressTranslator = &identity;
        assert_eq!(by_ref.to_physical(VirtAddr(7)), Ok(PhysAddr(7)));
    }
}
