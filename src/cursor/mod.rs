#![forbid(unsafe_code)]
//! Buffer chain to physical segment translation.
//!
//! [`MbufCursor::translate`] walks a packet chain and emits page-bounded
//! physical segments to a [`SegmentSink`]. When the chain needs more
//! segments than the caller's budget and coalescing is allowed, the chain is
//! repacked once by the [`planner`] and walked again. When an address cannot
//! be translated and coalescing is allowed, the packet is copied into a
//! single cluster and emitted as one segment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::chain::{self, BufferPool, NodeId};
use crate::error::{CursorError, Result};
use crate::metrics::{default_metrics, CursorMetrics};
use crate::mmu::AddressTranslator;
use crate::sink::SegmentSink;
use crate::types::page::{bytes_to_boundary, crosses_page, is_power_of_two};
use crate::types::{PhysicalSegment, Unmapped, VirtAddr};

mod cache;
mod options;
pub mod planner;
pub mod splice;

pub use cache::{SegmentCountCache, SEGMENT_CACHE_SIZE};
pub use options::CursorOptions;

/// Smallest page size a cursor accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// How a byte range is cut into segments: at every page boundary, and
/// every `max_segment_size` bytes in between.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stride {
    page_size: usize,
    max_segment_size: usize,
}

impl Stride {
    /// Builds a stride; a segment size of 0 or above the page size becomes the page size.
    pub fn new(page_size: usize, max_segment_size: usize) -> Self {
        let max_segment_size = if max_segment_size == 0 || max_segment_size > page_size {
            page_size
        } else {
            max_segment_size
        };
        Self {
            page_size,
            max_segment_size,
        }
    }

    /// Page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Effective segment length ceiling.
    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    /// Length of the segment starting at `addr` with `remaining` bytes left.
    pub fn next_len(&self, addr: VirtAddr, remaining: usize) -> usize {
        bytes_to_boundary(addr, self.page_size)
            .min(remaining)
            .min(self.max_segment_size)
    }

    /// Segments needed for `[addr, addr + len)`.
    pub fn segments(&self, addr: VirtAddr, len: usize) -> usize {
        let mut count = 0;
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let n = self.next_len(addr, remaining);
            addr = addr + n;
            remaining -= n;
            count += 1;
        }
        count
    }
}

#[derive(Debug)]
enum Phase {
    Direct,
    Planning { needed: usize },
    Retrying,
    Done(usize),
    Failed(CursorError),
}

/// Translates packet chains into physical segment lists.
///
/// One cursor may serve many packets and many threads; each call works only
/// on the chain it is given. The coalesce and too-big counters are atomics.
pub struct MbufCursor {
    stride: Stride,
    max_num_segments: usize,
    single_copy_limit: Option<usize>,
    metrics: Arc<dyn CursorMetrics>,
    coalesce_count: AtomicU64,
    too_big_count: AtomicU64,
}

impl MbufCursor {
    /// Creates a cursor, clamping the segment size to the page size.
    pub fn new(options: CursorOptions) -> Result<Self> {
        if !is_power_of_two(options.page_size) || options.page_size < MIN_PAGE_SIZE {
            return Err(CursorError::InvalidArgument(format!(
                "page size {} must be a power of two of at least {MIN_PAGE_SIZE}",
                options.page_size
            )));
        }
        let stride = Stride::new(options.page_size, options.max_segment_size);
        debug!(
            page_size = stride.page_size(),
            max_segment_size = stride.max_segment_size(),
            max_num_segments = options.max_num_segments,
            "cursor.new"
        );
        Ok(Self {
            stride,
            max_num_segments: options.max_num_segments,
            single_copy_limit: options.single_copy_limit,
            metrics: options.metrics.unwrap_or_else(default_metrics),
            coalesce_count: AtomicU64::new(0),
            too_big_count: AtomicU64::new(0),
        })
    }

    /// Page size segments are bounded by.
    pub fn page_size(&self) -> usize {
        self.stride.page_size()
    }

    /// Effective segment length ceiling.
    pub fn max_segment_size(&self) -> usize {
        self.stride.max_segment_size()
    }

    /// Budget used when callers pass 0.
    pub fn max_num_segments(&self) -> usize {
        self.max_num_segments
    }

    /// Segment geometry used by this cursor.
    pub fn stride(&self) -> Stride {
        self.stride
    }

    /// Largest packet the single-segment copy accepts for a given cluster size.
    pub fn single_copy_limit(&self, cluster_size: usize) -> usize {
        self.single_copy_limit
            .unwrap_or(cluster_size)
            .min(cluster_size)
            .min(self.stride.max_segment_size())
    }

    /// Packets that needed repacking since construction or the last take.
    pub fn coalesce_count(&self) -> u64 {
        self.coalesce_count.load(Ordering::Relaxed)
    }

    /// Returns the coalesce count and resets it to zero.
    pub fn take_coalesce_count(&self) -> u64 {
        self.coalesce_count.swap(0, Ordering::Relaxed)
    }

    /// Packets rejected because no plan could fit them.
    pub fn packet_too_big_count(&self) -> u64 {
        self.too_big_count.load(Ordering::Relaxed)
    }

    /// Zero-on-failure form of [`MbufCursor::translate`].
    pub fn gen_physical_segments<P, T, S>(
        &self,
        pool: &mut P,
        mmu: &T,
        packet: NodeId,
        sink: &mut S,
        max_segs: usize,
        allow_coalesce: bool,
    ) -> usize
    where
        P: BufferPool + ?Sized,
        T: AddressTranslator + ?Sized,
        S: SegmentSink + ?Sized,
    {
        match self.translate(pool, mmu, packet, sink, max_segs, allow_coalesce) {
            Ok(count) => count,
            Err(err) => {
                debug!(%err, packet = %packet, "cursor.translate_failed");
                0
            }
        }
    }

    /// Emits the physical segments of `packet` to `sink` and returns how many
    /// were emitted.
    ///
    /// The chain is walked once. If it needs more segments than the budget
    /// and coalescing is allowed, it is handed to the [`planner`] and walked
    /// a second time. A packet is planned at most once per call. With a
    /// budget of 1, or when an address cannot be translated, the whole packet
    /// is instead copied into one cluster.
    ///
    /// With `allow_coalesce` the chain may be rewritten: the head node stays
    /// valid, its length drops to 0 and it links to the repacked buffers.
    /// Segments emitted by an abandoned attempt are superseded by the retry,
    /// which starts again at index 0.
    ///
    /// # Arguments
    ///
    /// * `pool` - Allocator that owns the chain; must share the cursor's page size
    /// * `mmu` - Virtual to physical translation
    /// * `packet` - Head node, carrying the packet header
    /// * `sink` - Receives segments by descriptor index
    /// * `max_segs` - Segment budget; 0 selects the configured default
    /// * `allow_coalesce` - Whether the chain may be repacked or copied
    ///
    /// # Returns
    ///
    /// The number of valid segments in `sink`, never more than the budget.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::BudgetExceeded`] or [`CursorError::Unmapped`]
    /// when coalescing is not allowed, [`CursorError::PacketTooBig`] when no
    /// repacking fits the budget, and [`CursorError::TooLargeForSingleCopy`]
    /// when the single-segment copy cannot hold the packet. Errors raised
    /// before a plan commits leave the chain unchanged.
    pub fn translate<P, T, S>(
        &self,
        pool: &mut P,
        mmu: &T,
        packet: NodeId,
        sink: &mut S,
        max_segs: usize,
        allow_coalesce: bool,
    ) -> Result<usize>
    where
        P: BufferPool + ?Sized,
        T: AddressTranslator + ?Sized,
        S: SegmentSink + ?Sized,
    {
        if pool.page_size() != self.page_size() {
            return Err(CursorError::InvalidArgument(format!(
                "pool page size {} differs from cursor page size {}",
                pool.page_size(),
                self.page_size()
            )));
        }
        let packet_len = match pool.get(packet) {
            Some(node) if node.is_header() => node.packet_len(),
            _ => return Err(CursorError::NotAPacket(packet)),
        };
        let mut max_segs = match (max_segs, self.max_num_segments) {
            (0, 0) => return Err(CursorError::NoSegmentBudget),
            (0, default) => default,
            (requested, _) => requested,
        };
        if packet_len == 0 {
            return Err(CursorError::EmptyPacket);
        }

        let head = pool.node(packet);
        if head.next().is_none()
            && head.len() <= self.max_segment_size()
            && !crosses_page(head.data_addr(), head.len(), self.page_size())
        {
            match mmu.to_physical(head.data_addr()) {
                Ok(location) => {
                    let segment = PhysicalSegment::new(location, head.len());
                    trace!(index = 0, %location, length = segment.length, "cursor.fast_path");
                    sink.emit(segment, 0);
                    self.metrics.fast_path();
                    self.metrics.segments_emitted(1);
                    return Ok(1);
                }
                Err(Unmapped(addr)) => {
                    self.metrics.unmapped_address();
                    if !allow_coalesce {
                        return Err(CursorError::Unmapped(addr));
                    }
                    max_segs = 1;
                }
            }
        }

        if allow_coalesce && max_segs == 1 {
            let count = self.copy_to_single_segment(pool, mmu, packet, packet_len, sink)?;
            self.metrics.segments_emitted(count);
            return Ok(count);
        }

        let mut cache = SegmentCountCache::new();
        let mut coalesced = false;
        let mut phase = Phase::Direct;
        loop {
            phase = match phase {
                Phase::Direct | Phase::Retrying => {
                    match self.walk(&*pool, mmu, packet, sink, max_segs, &mut cache) {
                        Err(Unmapped(addr)) => {
                            self.metrics.unmapped_address();
                            if allow_coalesce {
                                debug!(%addr, "cursor.unmapped_fallback");
                                let copied =
                                    self.copy_to_single_segment(pool, mmu, packet, packet_len, sink);
                                match copied {
                                    Ok(count) => Phase::Done(count),
                                    Err(err) => Phase::Failed(err),
                                }
                            } else {
                                Phase::Failed(CursorError::Unmapped(addr))
                            }
                        }
                        Ok(count) if count <= max_segs => Phase::Done(count),
                        Ok(count) if !allow_coalesce => {
                            Phase::Failed(CursorError::BudgetExceeded {
                                needed: count,
                                budget: max_segs,
                            })
                        }
                        Ok(count)
                            if coalesced
                                || packet_len > max_segs.saturating_mul(self.max_segment_size()) =>
                        {
                            debug!(count, coalesced, packet_len, "cursor.cannot_plan");
                            Phase::Failed(self.packet_too_big(packet_len, max_segs))
                        }
                        Ok(count) => Phase::Planning { needed: count },
                    }
                }
                Phase::Planning { needed } => {
                    let request = planner::PlanRequest {
                        packet,
                        cache: &cache,
                        total_segments: needed,
                        max_segs,
                        stride: self.stride,
                    };
                    match planner::plan(pool, request) {
                        Ok(summary) => {
                            coalesced = true;
                            self.coalesce_count.fetch_add(1, Ordering::Relaxed);
                            self.metrics.packet_coalesced();
                            debug!(
                                needed,
                                projected = summary.projected_segments,
                                budget = max_segs,
                                "cursor.coalesced"
                            );
                            Phase::Retrying
                        }
                        Err(abort) => {
                            debug!(?abort, "cursor.plan_failed");
                            Phase::Failed(self.packet_too_big(packet_len, max_segs))
                        }
                    }
                }
                Phase::Done(count) => {
                    self.metrics.segments_emitted(count);
                    return Ok(count);
                }
                Phase::Failed(err) => return Err(err),
            };
        }
    }

    /// One pass over the chain. Segments inside the budget are translated and
    /// emitted; the rest are only counted.
    fn walk<P, T, S>(
        &self,
        pool: &P,
        mmu: &T,
        packet: NodeId,
        sink: &mut S,
        max_segs: usize,
        cache: &mut SegmentCountCache,
    ) -> std::result::Result<usize, Unmapped>
    where
        P: BufferPool + ?Sized,
        T: AddressTranslator + ?Sized,
        S: SegmentSink + ?Sized,
    {
        cache.clear();
        let mut index = 0;
        for (position, id) in chain::iter(pool, packet).enumerate() {
            let node = pool.node(id);
            let first = index;
            let mut addr = node.data_addr();
            let mut remaining = node.len();
            while remaining > 0 {
                let length = self.stride.next_len(addr, remaining);
                if index < max_segs {
                    let location = mmu.to_physical(addr)?;
                    trace!(index, %addr, %location, length, "cursor.segment");
                    sink.emit(PhysicalSegment::new(location, length), index);
                }
                index += 1;
                addr = addr + length;
                remaining -= length;
            }
            cache.record(position, index - first);
        }
        Ok(index)
    }

    /// Copies the whole packet into one fresh cluster and emits it as a
    /// single segment. On success every original node but the head is freed
    /// and the head links to the cluster.
    fn copy_to_single_segment<P, T, S>(
        &self,
        pool: &mut P,
        mmu: &T,
        packet: NodeId,
        packet_len: usize,
        sink: &mut S,
    ) -> Result<usize>
    where
        P: BufferPool + ?Sized,
        T: AddressTranslator + ?Sized,
        S: SegmentSink + ?Sized,
    {
        let limit = self.single_copy_limit(pool.cluster_size());
        if packet_len > limit {
            return Err(CursorError::TooLargeForSingleCopy {
                len: packet_len,
                limit,
            });
        }
        let out = pool
            .alloc_cluster()
            .ok_or(CursorError::AllocationFailed("single-segment cluster"))?;
        let room = pool.node(out).capacity().min(limit);

        let mut copied = 0;
        let mut cur = Some(packet);
        while let Some(id) = cur {
            let node = pool.node(id);
            let (len, next) = (node.len(), node.next());
            if copied + len > room {
                pool.free(out);
                return Err(CursorError::TooLargeForSingleCopy {
                    len: chain::chain_len(&*pool, packet),
                    limit,
                });
            }
            pool.copy_bytes(id, 0, out, copied, len);
            copied += len;
            cur = next;
        }
        pool.node_mut(out).set_len(copied);

        let addr = pool.node(out).data_addr();
        if crosses_page(addr, copied, self.page_size()) {
            pool.free(out);
            return Err(CursorError::InvalidArgument(format!(
                "pool cluster at {addr} holding {copied} bytes crosses a page boundary"
            )));
        }
        let location = match mmu.to_physical(addr) {
            Ok(location) => location,
            Err(Unmapped(addr)) => {
                pool.free(out);
                self.metrics.unmapped_address();
                return Err(CursorError::Unmapped(addr));
            }
        };
        sink.emit(PhysicalSegment::new(location, copied), 0);

        let rest = pool.node(packet).next();
        pool.free_chain(rest);
        let head = pool.node_mut(packet);
        head.set_len(0);
        head.set_next(Some(out));
        self.metrics.single_segment_copy();
        debug!(packet = %packet, bytes = copied, %location, "cursor.single_copy");
        Ok(1)
    }

    fn packet_too_big(&self, len: usize, budget: usize) -> CursorError {
        self.too_big_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.packet_too_big();
        warn!(len, budget, "packet too big for segment budget");
        CursorError::PacketTooBig { len, budget }
    }
}
