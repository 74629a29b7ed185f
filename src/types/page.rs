//! Page-boundary arithmetic. `page_size` must be a power of two.

use super::VirtAddr;

/// Rounds `addr` down to the start of its page.
pub fn trunc_page(addr: u64, page_size: usize) -> u64 {
    addr & !(page_size as u64 - 1)
}

/// Rounds `addr` up to the next page boundary (identity when already aligned).
pub fn round_page(addr: u64, page_size: usize) -> u64 {
    trunc_page(addr + page_size as u64 - 1, page_size)
}

/// Start of the page following the one containing `addr`.
pub fn next_page(addr: u64, page_size: usize) -> u64 {
    trunc_page(addr, page_size) + page_size as u64
}

/// Bytes from `addr` up to (not including) the next page boundary.
pub fn bytes_to_boundary(addr: VirtAddr, page_size: usize) -> usize {
    (next_page(addr.0, page_size) - addr.0) as usize
}

/// Whether the byte range `[addr, addr + len)` touches more than one page.
pub fn crosses_page(addr: VirtAddr, len: usize, page_size: usize) -> bool {
    if len == 0 {
        return false;
    }
    trunc_page(addr.0, page_size) != trunc_page(addr.0 + len as u64 - 1, page_size)
}

/// Number of pages the byte range `[addr, addr + len)` touches.
pub fn pages_spanned(addr: VirtAddr, len: usize, page_size: usize) -> usize {
    if len == 0 {
        return 0;
    }
    ((round_page(addr.0 + len as u64, page_size) - trunc_page(addr.0, page_size))
        / page_size as u64) as usize
}

/// Whether `value` is a usable page or allocation size.
pub fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}
