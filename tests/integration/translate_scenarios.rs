#![allow(missing_docs)]

use std::sync::{Arc, Once};

use sgcursor::{
    chain::{chain_bytes, chain_len, chain_nodes},
    metrics::CounterMetrics,
    mmu::PageTable,
    sink::{FnSink, SegmentTable},
    ArenaOptions, BufferArena, BufferPool, CursorError, CursorOptions, MbufCursor, NodeId,
    PhysAddr, PhysicalSegment, PAGE_SIZE,
};
use tracing_subscriber::EnvFilter;

const PHYS_BASE: u64 = 0x8000_0000;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sgcursor=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Harness {
    arena: BufferArena,
    table: PageTable,
    cursor: MbufCursor,
    metrics: Arc<CounterMetrics>,
}

impl Harness {
    fn new(arena: ArenaOptions, cursor: CursorOptions) -> Self {
        init_tracing();
        let table = PageTable::linear(arena.page_size, arena.base_addr, PHYS_BASE);
        let metrics = Arc::new(CounterMetrics::default());
        Self {
            arena: BufferArena::new(arena).expect("arena"),
            table,
            cursor: MbufCursor::new(cursor.metrics(metrics.clone())).expect("cursor"),
            metrics,
        }
    }

    fn standard() -> Self {
        Self::new(ArenaOptions::default(), CursorOptions::default())
    }

    fn packet(&mut self, lens: &[usize]) -> NodeId {
        let parts: Vec<Vec<u8>> = lens
            .iter()
            .enumerate()
            .map(|(n, &len)| (0..len).map(|i| (n * 13 + i * 7) as u8).collect())
            .collect();
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        self.arena.packet_from_slices(&slices).expect("packet")
    }

    fn translate(
        &mut self,
        head: NodeId,
        max_segs: usize,
        allow_coalesce: bool,
    ) -> (Result<usize, CursorError>, Vec<PhysicalSegment>) {
        let mut segments = Vec::new();
        let result = self.cursor.translate(
            &mut self.arena,
            &self.table,
            head,
            &mut segments,
            max_segs,
            allow_coalesce,
        );
        (result, segments)
    }

    fn phys(&self, id: NodeId) -> PhysAddr {
        let virt = self.arena.node(id).data_addr();
        PhysAddr(virt.get() - self.arena.options().base_addr + PHYS_BASE)
    }
}

fn assert_well_formed(segments: &[PhysicalSegment], max_segment_size: usize) {
    for seg in segments {
        assert!(seg.length > 0);
        assert!(seg.length <= max_segment_size);
        let first = seg.location.get() / PAGE_SIZE as u64;
        let last = (seg.location.get() + seg.length as u64 - 1) / PAGE_SIZE as u64;
        assert_eq!(first, last, "segment {seg:?} crosses a page");
    }
}

#[test]
fn single_small_node_is_one_segment() {
    let mut h = Harness::standard();
    let head = h.packet(&[100]);

    let (result, segments) = h.translate(head, 4, true);

    assert_eq!(result, Ok(1));
    assert_eq!(segments, vec![PhysicalSegment::new(h.phys(head), 100)]);
    assert_eq!(h.metrics.snapshot().fast_paths, 1);
    assert_eq!(h.arena.node(head).len(), 100);
}

#[test]
fn node_crossing_a_page_splits_at_the_boundary() {
    let mut h = Harness::standard();
    let node = h.arena.alloc_external(5000, 0).expect("external");
    h.arena.node_mut(node).fill(&[0x5a; 5000]);
    let head = h.arena.link_packet(&[node]).expect("link");
    let base = h.phys(head);

    let (result, segments) = h.translate(head, 4, false);

    assert_eq!(result, Ok(2));
    assert_eq!(
        segments,
        vec![
            PhysicalSegment::new(base, 4096),
            PhysicalSegment::new(base + 4096, 904),
        ]
    );
    assert_eq!(h.metrics.snapshot().fast_paths, 0);
}

#[test]
fn many_small_nodes_copy_into_one_cluster() {
    let mut h = Harness::standard();
    let head = h.packet(&[40; 50]);
    let before = chain_bytes(&h.arena, head);
    assert_eq!(before.len(), 2000);

    let (result, segments) = h.translate(head, 1, true);

    assert_eq!(result, Ok(1));
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].length, 2000);
    assert_eq!(h.arena.node(head).len(), 0);
    assert_eq!(chain_nodes(&h.arena, head), 2);
    assert_eq!(chain_bytes(&h.arena, head), before);
    assert_eq!(h.arena.live_nodes(), 2);
    assert_eq!(h.metrics.snapshot().single_copies, 1);
    assert_eq!(h.cursor.coalesce_count(), 0);
}

#[test]
fn oversized_packet_fails_before_planning() {
    let mut h = Harness::new(
        ArenaOptions::default(),
        CursorOptions::default().max_segment_size(1024),
    );
    let head = h.packet(&[1000; 10]);
    let allocs = h.arena.stats().allocs;

    let (result, _) = h.translate(head, 4, true);

    assert_eq!(
        result,
        Err(CursorError::PacketTooBig {
            len: 10_000,
            budget: 4
        })
    );
    assert_eq!(h.arena.stats().allocs, allocs);
    assert_eq!(h.cursor.coalesce_count(), 0);
    assert_eq!(h.cursor.packet_too_big_count(), 1);
    assert_eq!(chain_len(&h.arena, head), 10_000);

    let mut table = SegmentTable::new(4);
    assert_eq!(
        h.cursor
            .gen_physical_segments(&mut h.arena, &h.table, head, &mut table, 4, true),
        0
    );
    assert_eq!(h.cursor.packet_too_big_count(), 2);
}

#[test]
fn overflowing_chain_is_coalesced_within_budget() {
    let mut h = Harness::standard();
    let head = h.packet(&[100; 10]);
    let before = chain_bytes(&h.arena, head);
    let mut table = SegmentTable::new(4);

    let count = h
        .cursor
        .translate(&mut h.arena, &h.table, head, &mut table, 4, true)
        .expect("coalesced translation");

    assert!(count <= 4);
    let segments = table.segments(count);
    assert_eq!(segments.iter().map(|s| s.length).sum::<usize>(), 1000);
    assert_well_formed(segments, PAGE_SIZE);
    assert!(table.high_water() <= 4);
    assert_eq!(h.cursor.coalesce_count(), 1);
    assert_eq!(h.metrics.snapshot().coalesced, 1);
    assert_eq!(chain_bytes(&h.arena, head), before);
}

#[test]
fn head_survives_rewriting() {
    let mut h = Harness::standard();
    let head = h.packet(&[120; 12]);
    let original_next = h.arena.node(head).next();

    let (result, _) = h.translate(head, 3, true);

    assert!(result.expect("fits after coalescing") <= 3);
    let node = h.arena.node(head);
    assert!(node.is_header());
    assert_eq!(node.len(), 0);
    assert_eq!(node.packet_len(), 1440);
    assert_ne!(node.next(), original_next);
    assert!(h.arena.get(original_next.expect("second node")).is_none());
}

#[test]
fn unconsumed_tail_is_kept_after_coalescing() {
    let mut h = Harness::standard();
    let head = h.packet(&[64; 8]);
    let ids: Vec<NodeId> = sgcursor::chain::iter(&h.arena, head).collect();
    let before = chain_bytes(&h.arena, head);

    let (result, segments) = h.translate(head, 6, true);

    assert_eq!(result, Ok(6));
    assert_eq!(segments.len(), 6);
    let after: Vec<NodeId> = sgcursor::chain::iter(&h.arena, head).collect();
    assert_eq!(after.len(), 7);
    assert_eq!(&after[2..], &ids[3..]);
    assert_eq!(chain_bytes(&h.arena, head), before);
    assert_eq!(segments.iter().map(|s| s.length).sum::<usize>(), 512);
}

#[test]
fn allocation_failure_during_planning_leaves_chain_untouched() {
    let mut h = Harness::new(ArenaOptions::default().max_clusters(0), CursorOptions::default());
    let head = h.packet(&[200; 6]);
    let before = chain_bytes(&h.arena, head);
    let live = h.arena.live_nodes();

    let (result, _) = h.translate(head, 2, true);

    assert_eq!(
        result,
        Err(CursorError::PacketTooBig {
            len: 1200,
            budget: 2
        })
    );
    assert_eq!(h.arena.live_nodes(), live);
    assert_eq!(chain_bytes(&h.arena, head), before);
    assert_eq!(h.arena.node(head).len(), 200);
    assert_eq!(h.metrics.snapshot().too_big, 1);
}

#[test]
fn budget_overflow_without_coalescing_mutates_nothing() {
    let mut h = Harness::standard();
    let head = h.packet(&[100; 10]);
    let live = h.arena.live_nodes();

    let (result, _) = h.translate(head, 4, false);

    assert_eq!(
        result,
        Err(CursorError::BudgetExceeded {
            needed: 10,
            budget: 4
        })
    );
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(h.arena.live_nodes(), live);
    assert_eq!(chain_nodes(&h.arena, head), 10);
}

#[test]
fn unmapped_node_falls_back_to_single_copy() {
    let mut h = Harness::standard();
    let first = h.arena.alloc_plain().expect("plain");
    h.arena.node_mut(first).fill(b"header:");
    let second = h.arena.alloc_external(PAGE_SIZE, 0).expect("external");
    h.arena.node_mut(second).fill(b"payload");
    let head = h.arena.link_packet(&[first, second]).expect("link");
    let hole = h.arena.node(second).data_addr();
    h.table.unmap_page(hole);

    let (strict, _) = h.translate(head, 4, false);
    assert_eq!(strict, Err(CursorError::Unmapped(hole)));

    let mut seen = Vec::new();
    let mut sink = FnSink(|seg: PhysicalSegment, index: usize| seen.push((index, seg.length)));
    let count = h
        .cursor
        .translate(&mut h.arena, &h.table, head, &mut sink, 4, true)
        .expect("single copy");

    assert_eq!(count, 1);
    assert_eq!(seen.last(), Some(&(0, 14)));
    assert_eq!(chain_bytes(&h.arena, head), b"header:payload");
    assert!(h.arena.get(second).is_none());
    let snap = h.metrics.snapshot();
    assert_eq!(snap.unmapped, 2);
    assert_eq!(snap.single_copies, 1);
}

#[test]
fn failed_packet_is_planned_at_most_once_per_call() {
    let mut h = Harness::standard();
    let head = h.packet(&[250; 20]);
    let before = chain_bytes(&h.arena, head);
    let live = h.arena.live_nodes();

    let start = h.arena.stats().allocs;
    let (first, _) = h.translate(head, 2, true);
    let first_allocs = h.arena.stats().allocs - start;
    let (second, _) = h.translate(head, 2, true);
    let second_allocs = h.arena.stats().allocs - start - first_allocs;

    let expected = Err(CursorError::PacketTooBig {
        len: 5000,
        budget: 2,
    });
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    assert_eq!(first_allocs, second_allocs);
    assert!(first_allocs > 0);
    assert_eq!(h.cursor.coalesce_count(), 0);
    assert_eq!(h.cursor.packet_too_big_count(), 2);
    assert_eq!(h.arena.live_nodes(), live);
    assert_eq!(chain_bytes(&h.arena, head), before);
}

#[test]
fn coalesced_packet_translates_directly_next_time() {
    let mut h = Harness::standard();
    let head = h.packet(&[100; 10]);

    let (first, _) = h.translate(head, 4, true);
    let count = first.expect("coalesced");
    let (second, segments) = h.translate(head, count, false);

    assert_eq!(second, Ok(count));
    assert_eq!(segments.len(), count);
    assert_eq!(h.cursor.take_coalesce_count(), 1);
    assert_eq!(h.cursor.coalesce_count(), 0);
}

#[test]
fn segment_size_ceiling_holds_after_coalescing() {
    let mut h = Harness::new(
        ArenaOptions::default(),
        CursorOptions::default().max_segment_size(512),
    );
    let head = h.packet(&[90; 16]);
    let before = chain_bytes(&h.arena, head);

    let (result, segments) = h.translate(head, 4, true);

    let count = result.expect("fits in four 512-byte segments");
    assert!(count <= 4);
    assert_well_formed(&segments, 512);
    assert_eq!(segments.iter().map(|s| s.length).sum::<usize>(), 1440);
    assert_eq!(chain_bytes(&h.arena, head), before);
}
