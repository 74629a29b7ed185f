/// Nodes whose segment counts are remembered between a walk and the planner.
pub const SEGMENT_CACHE_SIZE: usize = 16;

/// Per-node segment counts from the most recent walk over a chain.
///
/// Only the first [`SEGMENT_CACHE_SIZE`] nodes are remembered; the planner
/// recomputes the rest from their virtual ranges.
#[derive(Clone, Debug, Default)]
pub struct SegmentCountCache {
    counts: [u32; SEGMENT_CACHE_SIZE],
    filled: usize,
}

impl SegmentCountCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Records the count for node `index`; indices past capacity are dropped.
    pub fn record(&mut self, index: usize, segments: usize) {
        if let Some(slot) = self.counts.get_mut(index) {
            *slot = segments as u32;
            self.filled = self.filled.max(index + 1);
        }
    }

    /// Count recorded for node `index`, if any.
    pub fn get(&self, index: usize) -> Option<usize> {
        if index < self.filled {
            Some(self.counts[index] as usize)
        } else {
            None
        }
    }

    /// Number of leading nodes with a recorded count.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}
