use std::sync::Arc;

use crate::metrics::CursorMetrics;
use crate::types::PAGE_SIZE;

/// Configuration supplied when constructing a [`super::MbufCursor`].
#[derive(Clone)]
pub struct CursorOptions {
    /// Physical page size; segments never straddle a page.
    pub page_size: usize,
    /// Segment length ceiling. 0, or anything above `page_size`, means `page_size`.
    pub max_segment_size: usize,
    /// Budget used when a caller passes 0. 0 means callers must always supply one.
    pub max_num_segments: usize,
    /// Ceiling for the single-segment copy fallback. `None` means one cluster.
    pub single_copy_limit: Option<usize>,
    /// Optional observer for translation outcomes.
    pub metrics: Option<Arc<dyn CursorMetrics>>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            max_segment_size: PAGE_SIZE,
            max_num_segments: 0,
            single_copy_limit: None,
            metrics: None,
        }
    }
}

impl CursorOptions {
    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the segment length ceiling.
    pub fn max_segment_size(mut self, bytes: usize) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Sets the default segment budget.
    pub fn max_num_segments(mut self, count: usize) -> Self {
        self.max_num_segments = count;
        self
    }

    /// Sets the single-segment copy ceiling.
    pub fn single_copy_limit(mut self, bytes: usize) -> Self {
        self.single_copy_limit = Some(bytes);
        self
    }

    /// Sets the metrics observer.
    pub fn metrics(mut self, metrics: Arc<dyn CursorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
