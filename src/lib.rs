//! Scatter-gather segment lists for packet buffer chains.
//!
//! [`MbufCursor`] turns a chain of packet buffers into the physical
//! `{address, length}` segments a DMA engine consumes, never crossing a page
//! and never exceeding the configured segment size. When a chain needs more
//! segments than the hardware allows, the cursor repacks it into fewer,
//! larger buffers and tries once more.
//!
//! The allocator ([`chain::BufferPool`]), the page table
//! ([`mmu::AddressTranslator`]) and the descriptor consumer
//! ([`sink::SegmentSink`]) are traits; [`chain::BufferArena`] and
//! [`mmu::PageTable`] are in-memory implementations.

#![warn(missing_docs)]

pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod mmu;
pub mod sink;
pub mod types;

pub use crate::chain::{ArenaOptions, BufferArena, BufferPool, NodeId};
pub use crate::cursor::{CursorOptions, MbufCursor};
pub use crate::error::{CursorError, Result};
pub use crate::mmu::{AddressTranslator, PageTable};
pub use crate::sink::SegmentSink;
pub use crate::types::{PhysAddr, PhysicalSegment, VirtAddr, PAGE_SIZE};
