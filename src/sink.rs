#![forbid(unsafe_code)]
//! Consumers of emitted physical segments.
//!
//! A translation attempt emits indices `0, 1, 2, ...` without gaps. A retried
//! attempt starts again at 0, so a sink must let later emissions replace
//! earlier ones at the same index. Only the count returned by the cursor says
//! which entries are valid.

use crate::types::PhysicalSegment;

/// Receives physical segments in increasing index order.
pub trait SegmentSink {
    /// Accepts the segment for descriptor slot `index`.
    fn emit(&mut self, segment: PhysicalSegment, index: usize);
}

impl<S: SegmentSink + ?Sized> SegmentSink for &mut S {
    fn emit(&mut self, segment: PhysicalSegment, index: usize) {
        (**self).emit(segment, index)
    }
}

/// Keeps exactly the segments of the latest attempt.
impl SegmentSink for Vec<PhysicalSegment> {
    fn emit(&mut self, segment: PhysicalSegment, index: usize) {
        self.truncate(index);
        self.push(segment);
    }
}

/// Adapts a closure into a [`SegmentSink`].
pub struct FnSink<F>(pub F);

impl<F> SegmentSink for FnSink<F>
where
    F: FnMut(PhysicalSegment, usize),
{
    fn emit(&mut self, segment: PhysicalSegment, index: usize) {
        (self.0)(segment, index)
    }
}

/// Fixed-capacity descriptor table, the shape a DMA ring slot takes.
#[derive(Clone, Debug)]
pub struct SegmentTable {
    slots: Box<[PhysicalSegment]>,
    written: usize,
}

impl SegmentTable {
    /// Creates a table with room for `capacity` descriptors.
    ///
    /// `capacity` should be at least the segment budget passed to
    /// [`MbufCursor::translate`](crate::MbufCursor::translate). Emissions past
    /// the last slot are not stored; [`SegmentTable::overflowed`] reports them.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![PhysicalSegment::default(); capacity].into_boxed_slice(),
            written: 0,
        }
    }

    /// Descriptor slots available.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The first `count` descriptors, as returned by a successful translation.
    pub fn segments(&self, count: usize) -> &[PhysicalSegment] {
        &self.slots[..count.min(self.slots.len())]
    }

    /// Highest index emitted plus one, across all attempts. May exceed
    /// [`SegmentTable::capacity`] when the table was too small.
    pub fn high_water(&self) -> usize {
        self.written
    }

    /// Whether any emission landed beyond the last slot.
    pub fn overflowed(&self) -> bool {
        self.written > self.slots.len()
    }
}

impl SegmentSink for SegmentTable {
    fn emit(&mut self, segment: PhysicalSegment, index: usize) {
        self.written = self.written.max(index + 1);
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = segment;
        }
    }
}
