//! Byte mover between an original chain and a planned chain.

use tracing::trace;

use crate::chain::{BufferPool, NodeId};

/// What a splice did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SpliceStats {
    /// Bytes copied into the destination chain.
    pub bytes: usize,
    /// Source nodes returned to the pool.
    pub freed: usize,
    /// Whether unconsumed source nodes were linked after the destination tail.
    pub leftover: bool,
}

/// Copies `source`'s bytes into `dest`, whose node lengths give the number
/// of bytes each destination node receives.
///
/// Source nodes are freed as soon as they are drained, except `source`
/// itself, which the caller keeps and relinks. When the destination runs out
/// exactly at a source node boundary, the rest of the source chain is linked
/// after the destination tail unchanged.
pub fn splice<P: BufferPool + ?Sized>(pool: &mut P, source: NodeId, dest: NodeId) -> SpliceStats {
    let head = source;
    let mut stats = SpliceStats::default();

    let mut src = source;
    let mut src_off = 0;
    let mut src_len = pool.node(src).len();
    let mut dst = dest;
    let mut dst_off = 0;
    let mut dst_len = pool.node(dst).len();

    loop {
        if src_len < dst_len {
            pool.copy_bytes(src, src_off, dst, dst_off, src_len);
            stats.bytes += src_len;
            dst_off += src_len;
            dst_len -= src_len;

            let Some(next) = pool.node(src).next() else {
                debug_assert!(false, "source chain shorter than destination");
                break;
            };
            release(pool, src, head, &mut stats);
            src = next;
            src_off = 0;
            src_len = pool.node(src).len();
        } else if src_len > dst_len {
            pool.copy_bytes(src, src_off, dst, dst_off, dst_len);
            stats.bytes += dst_len;
            src_off += dst_len;
            src_len -= dst_len;

            let Some(next) = pool.node(dst).next() else {
                debug_assert!(false, "destination chain shorter than source");
                break;
            };
            dst = next;
            dst_off = 0;
            dst_len = pool.node(dst).len();
        } else {
            pool.copy_bytes(src, src_off, dst, dst_off, src_len);
            stats.bytes += src_len;

            let src_next = pool.node(src).next();
            release(pool, src, head, &mut stats);

            let Some(next_dst) = pool.node(dst).next() else {
                pool.node_mut(dst).set_next(src_next);
                stats.leftover = src_next.is_some();
                break;
            };
            let Some(next_src) = src_next else {
                debug_assert!(false, "source chain ended before destination");
                break;
            };
            dst = next_dst;
            dst_off = 0;
            dst_len = pool.node(dst).len();
            src = next_src;
            src_off = 0;
            src_len = pool.node(src).len();
        }
    }

    trace!(
        bytes = stats.bytes,
        freed = stats.freed,
        leftover = stats.leftover,
        "splice.done"
    );
    stats
}

fn release<P: BufferPool + ?Sized>(pool: &mut P, id: NodeId, head: NodeId, stats: &mut SpliceStats) {
    if id != head {
        pool.free(id);
        stats.freed += 1;
    }
}
