use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Observer for cursor outcomes.
///
/// Implementations receive one call per notable event during translation.
/// They run on the translating thread and must be cheap.
pub trait CursorMetrics: Send + Sync {
    /// A single-node packet was translated without walking.
    fn fast_path(&self);

    /// A packet overflowed its budget and was repacked by the planner.
    fn packet_coalesced(&self);

    /// A packet was copied into one cluster and emitted as one segment.
    fn single_segment_copy(&self);

    /// A packet could not be made to fit its segment budget.
    fn packet_too_big(&self);

    /// Address translation refused a virtual address.
    fn unmapped_address(&self);

    /// A translation succeeded with `count` segments.
    fn segments_emitted(&self, count: usize);
}

/// A [`CursorMetrics`] that records nothing.
#[derive(Default)]
pub struct NoopMetrics;

impl CursorMetrics for NoopMetrics {
    fn fast_path(&self) {}
    fn packet_coalesced(&self) {}
    fn single_segment_copy(&self) {}
    fn packet_too_big(&self) {}
    fn unmapped_address(&self) {}
    fn segments_emitted(&self, _count: usize) {}
}

/// Atomic counters for every [`CursorMetrics`] event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Fast-path translations.
    pub fast_paths: AtomicU64,
    /// Packets repacked by the planner.
    pub coalesced: AtomicU64,
    /// Packets copied into a single cluster.
    pub single_copies: AtomicU64,
    /// Packets rejected as too big.
    pub too_big: AtomicU64,
    /// Refused address translations.
    pub unmapped: AtomicU64,
    /// Successful translations.
    pub packets: AtomicU64,
    /// Segments across successful translations.
    pub segments: AtomicU64,
}

/// Point-in-time copy of a [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Fast-path translations.
    pub fast_paths: u64,
    /// Packets repacked by the planner.
    pub coalesced: u64,
    /// Packets copied into a single cluster.
    pub single_copies: u64,
    /// Packets rejected as too big.
    pub too_big: u64,
    /// Refused address translations.
    pub unmapped: u64,
    /// Successful translations.
    pub packets: u64,
    /// Segments across successful translations.
    pub segments: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fast_paths: self.fast_paths.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            single_copies: self.single_copies.load(Ordering::Relaxed),
            too_big: self.too_big.load(Ordering::Relaxed),
            unmapped: self.unmapped.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
        }
    }
}

impl CursorMetrics for CounterMetrics {
    fn fast_path(&self) {
        self.fast_paths.fetch_add(1, Ordering::Relaxed);
    }

    fn packet_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    fn single_segment_copy(&self) {
        self.single_copies.fetch_add(1, Ordering::Relaxed);
    }

    fn packet_too_big(&self) {
        self.too_big.fetch_add(1, Ordering::Relaxed);
    }

    fn unmapped_address(&self) {
        self.unmapped.fetch_add(1, Ordering::Relaxed);
    }

    fn segments_emitted(&self, count: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.segments.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, a shared [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn CursorMetrics> {
    Arc::new(NoopMetrics)
}
