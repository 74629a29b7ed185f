//! Repacks an over-budget chain into fewer, larger buffers.
//!
//! The planner lays out a new chain one output node at a time. Each output
//! node starts plain and is promoted to a cluster the first time the bytes
//! assigned to it overflow. Input nodes are consumed whole, in order, until
//! the projected segment count (full output nodes + the partial output node
//! + whatever the unconsumed inputs still need) fits the budget. Nothing in
//! the original chain changes unless the plan succeeds.

use smallvec::SmallVec;
use tracing::debug;

use super::cache::SegmentCountCache;
use super::splice::{splice, SpliceStats};
use super::Stride;
use crate::chain::{BufferPool, NodeId};

/// Why a plan was abandoned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlanAbort {
    /// The pool refused a plain node or a cluster.
    Allocation,
    /// Output nodes alone already need more segments than the budget.
    OverBudget {
        /// Segments the output chain needs so far.
        committed: usize,
        /// Segment budget.
        budget: usize,
    },
    /// Every input node was consumed and the projection still overflows.
    InputExhausted {
        /// Projected segment count after consuming all input.
        projected: usize,
        /// Segment budget.
        budget: usize,
    },
}

/// Outcome of a successful plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlanSummary {
    /// Nodes in the new chain, excluding reattached leftovers.
    pub output_nodes: usize,
    /// Original nodes whose bytes were moved.
    pub consumed_inputs: usize,
    /// Segment count the retried walk is expected to produce.
    pub projected_segments: usize,
    /// What the splice did.
    pub splice: SpliceStats,
}

/// Inputs to [`plan`].
pub struct PlanRequest<'a> {
    /// Head of the packet to repack.
    pub packet: NodeId,
    /// Per-node counts from the walk that overflowed.
    pub cache: &'a SegmentCountCache,
    /// Segments that walk counted in total.
    pub total_segments: usize,
    /// Segment budget.
    pub max_segs: usize,
    /// Stride used to count segments.
    pub stride: Stride,
}

type OutputNodes = SmallVec<[NodeId; 8]>;

struct Layout {
    first: NodeId,
    last: NodeId,
    last_len: usize,
    consumed: usize,
    projected: usize,
}

/// Plans a repacked chain and, on success, splices the packet's bytes into
/// it.
///
/// The layout runs in three steps:
/// 1. Allocate a plain output node and assign input nodes to it whole
/// 2. Promote it to a cluster on first overflow; start a new plain node when the cluster fills
/// 3. Stop once the output nodes plus the untouched inputs fit `max_segs`
///
/// The packet head keeps its identity: its length becomes 0 and it links to
/// the new chain. Inputs past the last consumed one are relinked unchanged.
///
/// # Returns
///
/// A [`PlanSummary`] whose `projected_segments` equals what the next walk
/// of the chain counts. On `Err` every new node has been freed and the
/// packet is untouched.
pub fn plan<P: BufferPool + ?Sized>(
    pool: &mut P,
    request: PlanRequest<'_>,
) -> Result<PlanSummary, PlanAbort> {
    let mut outputs = OutputNodes::new();
    let layout = match lay_out(pool, &request, &mut outputs) {
        Ok(layout) => layout,
        Err(abort) => {
            for id in outputs {
                pool.free(id);
            }
            debug!(?abort, segments = request.total_segments, "planner.abort");
            return Err(abort);
        }
    };

    pool.node_mut(layout.last).set_len(layout.last_len);
    let stats = splice(pool, request.packet, layout.first);
    let head = pool.node_mut(request.packet);
    head.set_len(0);
    head.set_next(Some(layout.first));

    let summary = PlanSummary {
        output_nodes: outputs.len(),
        consumed_inputs: layout.consumed,
        projected_segments: layout.projected,
        splice: stats,
    };
    debug!(
        output_nodes = summary.output_nodes,
        consumed = summary.consumed_inputs,
        projected = summary.projected_segments,
        budget = request.max_segs,
        "planner.commit"
    );
    Ok(summary)
}

fn lay_out<P: BufferPool + ?Sized>(
    pool: &mut P,
    request: &PlanRequest<'_>,
    outputs: &mut OutputNodes,
) -> Result<Layout, PlanAbort> {
    let budget = request.max_segs;
    let stride = request.stride;

    let first = pool.alloc_plain().ok_or(PlanAbort::Allocation)?;
    outputs.push(first);
    let mut out = first;
    let mut out_cap = pool.node(out).capacity();
    let mut out_is_cluster = false;
    let mut out_len = 0usize;
    let mut out_segs = 0usize;
    let mut committed = 0usize;
    let mut owed = request.total_segments;

    let mut input = Some(request.packet);
    let mut index = 0usize;
    while let Some(id) = input {
        let node = pool.node(id);
        let (in_addr, in_len, in_next) = (node.data_addr(), node.len(), node.next());
        out_len += in_len;

        while out_len > out_cap {
            if !out_is_cluster {
                if !pool.attach_cluster(out) {
                    return Err(PlanAbort::Allocation);
                }
                out_cap = pool.node(out).capacity();
                out_is_cluster = true;
                continue;
            }

            let filled = out_cap;
            let addr = pool.node(out).data_addr();
            pool.node_mut(out).set_len(filled);
            committed += stride.segments(addr, filled);
            if committed + 1 > budget {
                return Err(PlanAbort::OverBudget { committed, budget });
            }

            let fresh = pool.alloc_plain().ok_or(PlanAbort::Allocation)?;
            outputs.push(fresh);
            pool.node_mut(out).set_next(Some(fresh));
            out = fresh;
            out_cap = pool.node(out).capacity();
            out_is_cluster = false;
            out_len -= filled;
        }

        out_segs = stride.segments(pool.node(out).data_addr(), out_len);
        if committed + out_segs > budget {
            return Err(PlanAbort::OverBudget {
                committed: committed + out_segs,
                budget,
            });
        }

        let in_segs = request
            .cache
            .get(index)
            .unwrap_or_else(|| stride.segments(in_addr, in_len));
        owed = owed.saturating_sub(in_segs);
        input = in_next;
        index += 1;

        if owed + committed + out_segs <= budget {
            break;
        }
    }

    let projected = owed + committed + out_segs;
    if projected > budget {
        return Err(PlanAbort::InputExhausted { projected, budget });
    }
    Ok(Layout {
        first,
        last: out,
        last_len: out_len,
        consumed: index,
        projected,
    })
}
