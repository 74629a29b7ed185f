use serde::Serialize;
use tracing::trace;

use super::{BufferNode, BufferPool, NodeId, NodeKind, PacketHeader};
use crate::error::{CursorError, Result};
use crate::types::page::is_power_of_two;
use crate::types::{VirtAddr, PAGE_SIZE};

/// Layout and limits for a [`BufferArena`].
#[derive(Clone, Debug)]
pub struct ArenaOptions {
    /// Page size buffers are laid out against.
    pub page_size: usize,
    /// Capacity of a plain node (aligned to its own size).
    pub plain_size: usize,
    /// Capacity of a cluster (aligned to its own size).
    pub cluster_size: usize,
    /// First virtual address handed out. Must be page aligned and non-zero.
    pub base_addr: u64,
    /// Ceiling on simultaneously live nodes.
    pub max_nodes: Option<usize>,
    /// Ceiling on simultaneously live clusters.
    pub max_clusters: Option<usize>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            plain_size: 256,
            cluster_size: 2048,
            base_addr: 0x1000_0000,
            max_nodes: None,
            max_clusters: None,
        }
    }
}

impl ArenaOptions {
    /// Sets the ceiling on live nodes.
    pub fn max_nodes(mut self, limit: usize) -> Self {
        self.max_nodes = Some(limit);
        self
    }

    /// Sets the ceiling on live clusters.
    pub fn max_clusters(mut self, limit: usize) -> Self {
        self.max_clusters = Some(limit);
        self
    }

    /// Sets the cluster size.
    pub fn cluster_size(mut self, bytes: usize) -> Self {
        self.cluster_size = bytes;
        self
    }

    /// Checks sizes are powers of two with `plain <= cluster <= page`.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("page_size", self.page_size),
            ("plain_size", self.plain_size),
            ("cluster_size", self.cluster_size),
        ] {
            if !is_power_of_two(value) {
                return Err(CursorError::InvalidArgument(format!(
                    "{name} {value} is not a power of two"
                )));
            }
        }
        if self.plain_size > self.cluster_size || self.cluster_size > self.page_size {
            return Err(CursorError::InvalidArgument(format!(
                "expected plain_size <= cluster_size <= page_size, got {} / {} / {}",
                self.plain_size, self.cluster_size, self.page_size
            )));
        }
        if self.base_addr == 0 || self.base_addr % self.page_size as u64 != 0 {
            return Err(CursorError::InvalidArgument(format!(
                "base_addr {:#x} must be non-zero and page aligned",
                self.base_addr
            )));
        }
        Ok(())
    }
}

/// Allocation counters for a [`BufferArena`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ArenaStats {
    /// Nodes handed out.
    pub allocs: u64,
    /// Nodes returned.
    pub frees: u64,
    /// Clusters handed out or attached.
    pub cluster_allocs: u64,
    /// Requests refused by a ceiling.
    pub failed_allocs: u64,
}

struct Slot {
    generation: u32,
    node: Option<BufferNode>,
}

/// Slab-backed [`BufferPool`] with bump-allocated virtual addresses.
///
/// Plain nodes and clusters are aligned to their own size, so neither ever
/// straddles a page. Virtual ranges are never reused; node slots are.
pub struct BufferArena {
    options: ArenaOptions,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    next_addr: u64,
    live: usize,
    live_clusters: usize,
    stats: ArenaStats,
}

impl BufferArena {
    /// Creates an empty arena.
    pub fn new(options: ArenaOptions) -> Result<Self> {
        options.validate()?;
        let next_addr = options.base_addr;
        Ok(Self {
            options,
            slots: Vec::new(),
            free_slots: Vec::new(),
            next_addr,
            live: 0,
            live_clusters: 0,
            stats: ArenaStats::default(),
        })
    }

    /// Arena configuration.
    pub fn options(&self) -> &ArenaOptions {
        &self.options
    }

    /// Number of live nodes.
    pub fn live_nodes(&self) -> usize {
        self.live
    }

    /// Number of live cluster-backed nodes.
    pub fn live_clusters(&self) -> usize {
        self.live_clusters
    }

    /// Allocation counters.
    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Allocates a node over `capacity` bytes whose data starts `page_offset`
    /// bytes into a page. Such a node may straddle page boundaries.
    pub fn alloc_external(&mut self, capacity: usize, page_offset: usize) -> Option<NodeId> {
        if !self.node_budget_left() {
            self.stats.failed_allocs += 1;
            return None;
        }
        let page_offset = page_offset % self.options.page_size;
        let page = self.reserve(page_offset + capacity.max(1), self.options.page_size);
        let node = BufferNode::new(page + page_offset, capacity, NodeKind::External);
        Some(self.insert(node))
    }

    /// Builds a packet with one node per slice. Each slice goes into the
    /// smallest node kind that holds it.
    pub fn packet_from_slices(&mut self, parts: &[&[u8]]) -> Result<NodeId> {
        let mut nodes = Vec::with_capacity(parts.len());
        for part in parts {
            let id = if part.len() <= self.options.plain_size {
                self.alloc_plain()
            } else if part.len() <= self.options.cluster_size {
                self.alloc_cluster()
            } else {
                self.alloc_external(part.len(), 0)
            };
            let Some(id) = id else {
                for id in nodes {
                    self.free(id);
                }
                return Err(CursorError::AllocationFailed("packet node"));
            };
            self.node_mut(id).fill(part);
            nodes.push(id);
        }
        self.link_packet(&nodes)
    }

    /// Links pre-filled nodes into a packet and stamps the head's header.
    pub fn link_packet(&mut self, nodes: &[NodeId]) -> Result<NodeId> {
        let Some(&head) = nodes.first() else {
            return Err(CursorError::InvalidArgument("packet needs at least one node".into()));
        };
        let mut total = 0;
        for (pos, &id) in nodes.iter().enumerate() {
            let next = nodes.get(pos + 1).copied();
            let node = self
                .get_mut(id)
                .ok_or_else(|| CursorError::InvalidArgument(format!("node {id} is not live")))?;
            node.set_next(next);
            node.set_header(None);
            total += node.len();
        }
        self.node_mut(head)
            .set_header(Some(PacketHeader { len: total }));
        Ok(head)
    }

    fn node_budget_left(&self) -> bool {
        self.options.max_nodes.map_or(true, |max| self.live < max)
    }

    fn cluster_budget_left(&self) -> bool {
        self.options
            .max_clusters
            .map_or(true, |max| self.live_clusters < max)
    }

    fn reserve(&mut self, len: usize, align: usize) -> VirtAddr {
        let align = align as u64;
        let start = (self.next_addr + align - 1) & !(align - 1);
        self.next_addr = start + len as u64;
        VirtAddr(start)
    }

    fn insert(&mut self, node: BufferNode) -> NodeId {
        if node.kind() == NodeKind::Cluster {
            self.live_clusters += 1;
            self.stats.cluster_allocs += 1;
        }
        self.live += 1;
        self.stats.allocs += 1;
        let id = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.node = Some(node);
                NodeId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId::new((self.slots.len() - 1) as u32, 0)
            }
        };
        trace!(node = %id, "arena.alloc");
        id
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
    }
}

impl BufferPool for BufferArena {
    fn page_size(&self) -> usize {
        self.options.page_size
    }

    fn plain_size(&self) -> usize {
        self.options.plain_size
    }

    fn cluster_size(&self) -> usize {
        self.options.cluster_size
    }

    fn alloc_plain(&mut self) -> Option<NodeId> {
        if !self.node_budget_left() {
            self.stats.failed_allocs += 1;
            return None;
        }
        let size = self.options.plain_size;
        let base = self.reserve(size, size);
        Some(self.insert(BufferNode::new(base, size, NodeKind::Plain)))
    }

    fn alloc_cluster(&mut self) -> Option<NodeId> {
        if !self.node_budget_left() || !self.cluster_budget_left() {
            self.stats.failed_allocs += 1;
            return None;
        }
        let size = self.options.cluster_size;
        let base = self.reserve(size, size);
        Some(self.insert(BufferNode::new(base, size, NodeKind::Cluster)))
    }

    fn attach_cluster(&mut self, id: NodeId) -> bool {
        if !self.cluster_budget_left() {
            self.stats.failed_allocs += 1;
            return false;
        }
        match self.get(id).map(BufferNode::kind) {
            Some(NodeKind::Plain) => {}
            _ => return false,
        }
        let size = self.options.cluster_size;
        let base = self.reserve(size, size);
        self.node_mut(id)
            .replace_storage(base, size, NodeKind::Cluster);
        self.live_clusters += 1;
        self.stats.cluster_allocs += 1;
        true
    }

    fn free(&mut self, id: NodeId) {
        let Some(slot) = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
        else {
            debug_assert!(false, "free of stale node {id}");
            return;
        };
        let Some(node) = slot.node.take() else {
            debug_assert!(false, "double free of node {id}");
            return;
        };
        if node.kind() == NodeKind::Cluster {
            self.live_clusters -= 1;
        }
        self.live -= 1;
        self.stats.frees += 1;
        self.free_slots.push(id.index() as u32);
        trace!(node = %id, "arena.free");
    }

    fn get(&self, id: NodeId) -> Option<&BufferNode> {
        self.slot(id).and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut BufferNode> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn copy_bytes(&mut self, src: NodeId, src_off: usize, dst: NodeId, dst_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        let (si, di) = (src.index(), dst.index());
        if si == di {
            let node = self.node_mut(dst);
            let start = node.offset;
            node.storage
                .copy_within(start + src_off..start + src_off + len, start + dst_off);
            return;
        }
        let (src_slot, dst_slot) = if si < di {
            let (lo, hi) = self.slots.split_at_mut(di);
            (&lo[si], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(si);
            (&hi[0], &mut lo[di])
        };
        let (Some(src_node), Some(dst_node)) = (src_slot.node.as_ref(), dst_slot.node.as_mut())
        else {
            panic!("copy between stale nodes {src} -> {dst}");
        };
        dst_node.window_mut()[dst_off..dst_off + len]
            .copy_from_slice(&src_node.data()[src_off..src_off + len]);
    }
}
