#![forbid(unsafe_code)]
//! Packet buffer chains.
//!
//! A packet is a singly linked chain of [`BufferNode`]s living in a
//! [`BufferPool`]. Links are [`NodeId`] handles rather than pointers, so a
//! chain can be rewritten in place while outside holders of the head id stay
//! valid. Only the head node carries a [`PacketHeader`].

use std::fmt;

use crate::types::VirtAddr;

mod arena;

pub use arena::{ArenaOptions, ArenaStats, BufferArena};

/// Handle to a node slot in a [`BufferPool`].
///
/// The generation distinguishes a live node from a freed slot that has
/// since been reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Builds a handle from a slot index and generation.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the owning pool.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Slot generation at allocation time.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What kind of storage backs a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Small inline buffer.
    Plain,
    /// Cluster-sized, cluster-aligned buffer.
    Cluster,
    /// Caller-supplied storage of arbitrary size and alignment.
    External,
}

/// Aggregate packet metadata carried by the head node only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    /// Total bytes across the whole chain.
    pub len: usize,
}

/// One link in a buffer chain.
#[derive(Debug)]
pub struct BufferNode {
    storage: Box<[u8]>,
    base: VirtAddr,
    offset: usize,
    len: usize,
    kind: NodeKind,
    next: Option<NodeId>,
    header: Option<PacketHeader>,
}

impl BufferNode {
    /// Creates an empty node over `capacity` bytes of storage mapped at `base`.
    pub fn new(base: VirtAddr, capacity: usize, kind: NodeKind) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            base,
            offset: 0,
            len: 0,
            kind,
            next: None,
            header: None,
        }
    }

    /// Virtual address of the first valid byte.
    pub fn data_addr(&self) -> VirtAddr {
        self.base + self.offset
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the node holds no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available from the data start to the end of storage.
    pub fn capacity(&self) -> usize {
        self.storage.len() - self.offset
    }

    /// Storage kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Following node, if any.
    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    /// Packet header, present only on a chain head.
    pub fn header(&self) -> Option<PacketHeader> {
        self.header
    }

    /// Whether this node heads a packet.
    pub fn is_header(&self) -> bool {
        self.header.is_some()
    }

    /// Aggregate packet length, or 0 for interior nodes.
    pub fn packet_len(&self) -> usize {
        self.header.map(|h| h.len).unwrap_or(0)
    }

    /// Valid bytes.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    /// Valid bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.offset + self.len;
        &mut self.storage[self.offset..end]
    }

    /// Everything from the data start to the end of storage.
    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..]
    }

    /// Sets the valid length, clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity(), "length {len} beyond capacity");
        self.len = len.min(self.capacity());
    }

    /// Moves the data start `offset` bytes into storage, dropping any valid bytes.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.storage.len());
        self.len = 0;
    }

    /// Relinks this node.
    pub fn set_next(&mut self, next: Option<NodeId>) {
        self.next = next;
    }

    /// Installs or clears the packet header.
    pub fn set_header(&mut self, header: Option<PacketHeader>) {
        self.header = header;
    }

    /// Copies `bytes` to the data start and sets the valid length.
    pub fn fill(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.capacity());
        self.window_mut()[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
    }

    /// Swaps in fresh storage; used when a cluster is attached to a plain node.
    pub fn replace_storage(&mut self, base: VirtAddr, capacity: usize, kind: NodeKind) {
        self.storage = vec![0u8; capacity].into_boxed_slice();
        self.base = base;
        self.offset = 0;
        self.len = 0;
        self.kind = kind;
    }
}

/// Node storage plus allocator.
///
/// This is the seam to the external buffer allocator: nodes come from
/// `alloc_plain`/`alloc_cluster`, a plain node can be promoted in place with
/// `attach_cluster`, and every node ends in `free`. Allocation failures are
/// reported as `None`/`false`, never as panics.
///
/// The cursor relies on a few layout guarantees from implementations:
///
/// - A plain node or cluster never crosses a page boundary
/// - `attach_cluster` keeps the node id and its `next` link
/// - `free` makes the id stale, so later `get` calls return `None`
///
/// A cluster that crosses a page is rejected by the single-segment copy
/// rather than emitted.
pub trait BufferPool {
    /// Physical page size the pool lays buffers out against.
    fn page_size(&self) -> usize;

    /// Capacity of a plain node.
    fn plain_size(&self) -> usize;

    /// Capacity of a cluster.
    fn cluster_size(&self) -> usize;

    /// Allocates a small node.
    fn alloc_plain(&mut self) -> Option<NodeId>;

    /// Allocates a node backed by a cluster.
    fn alloc_cluster(&mut self) -> Option<NodeId>;

    /// Replaces a plain node's storage with a cluster. Valid bytes are discarded.
    fn attach_cluster(&mut self, id: NodeId) -> bool;

    /// Returns a node to the pool. Its `next` link is not followed.
    fn free(&mut self, id: NodeId);

    /// Looks up a live node.
    fn get(&self, id: NodeId) -> Option<&BufferNode>;

    /// Looks up a live node mutably.
    fn get_mut(&mut self, id: NodeId) -> Option<&mut BufferNode>;

    /// Copies `len` bytes from `src`'s data at `src_off` into `dst`'s storage
    /// at `dst_off`, both relative to the nodes' data starts.
    fn copy_bytes(&mut self, src: NodeId, src_off: usize, dst: NodeId, dst_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        let bytes = self.node(src).data()[src_off..src_off + len].to_vec();
        self.node_mut(dst).window_mut()[dst_off..dst_off + len].copy_from_slice(&bytes);
    }

    /// Live node lookup. Panics on a stale handle.
    fn node(&self, id: NodeId) -> &BufferNode {
        self.get(id)
            .unwrap_or_else(|| panic!("buffer node {id} used after free"))
    }

    /// Live node lookup, mutably. Panics on a stale handle.
    fn node_mut(&mut self, id: NodeId) -> &mut BufferNode {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("buffer node {id} used after free"))
    }

    /// Frees `first` and every node linked after it.
    fn free_chain(&mut self, first: Option<NodeId>) {
        let mut cur = first;
        while let Some(id) = cur {
            cur = self.node(id).next();
            self.free(id);
        }
    }
}

/// Iterator over the node ids of a chain.
pub struct ChainIter<'a, P: BufferPool + ?Sized> {
    pool: &'a P,
    cur: Option<NodeId>,
}

impl<P: BufferPool + ?Sized> Iterator for ChainIter<'_, P> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.pool.node(id).next();
        Some(id)
    }
}

/// Walks the chain starting at `head`.
pub fn iter<P: BufferPool + ?Sized>(pool: &P, head: NodeId) -> ChainIter<'_, P> {
    ChainIter {
        pool,
        cur: Some(head),
    }
}

/// Sum of valid bytes across the chain.
pub fn chain_len<P: BufferPool + ?Sized>(pool: &P, head: NodeId) -> usize {
    iter(pool, head).map(|id| pool.node(id).len()).sum()
}

/// Number of nodes in the chain.
pub fn chain_nodes<P: BufferPool + ?Sized>(pool: &P, head: NodeId) -> usize {
    iter(pool, head).count()
}

/// Concatenated valid bytes of the chain.
pub fn chain_bytes<P: BufferPool + ?Sized>(pool: &P, head: NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(chain_len(pool, head));
    for id in iter(pool, head) {
        out.extend_from_slice(pool.node(id).data());
    }
    out
}
