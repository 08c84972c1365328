/// Snapshot of the heap counters.
///
/// `bytes_allocated` counts requested payload sizes, `bytes_used` counts block
/// spans (headers, guard bands, padding and unsplit slack included).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_allocations: usize,
    pub current_allocations: usize,
    pub maximum_allocations: usize,
    pub total_frees: usize,

    pub total_bytes_allocated: usize,
    pub current_bytes_allocated: usize,
    pub maximum_bytes_allocated: usize,

    pub total_bytes_used: usize,
    pub current_bytes_used: usize,
    pub maximum_bytes_used: usize,

    /// Spans of the free blocks, fixed nodes excluded.
    pub current_bytes_free: usize,

    /// Spans obtained from the page source.
    pub system_allocations: usize,
    /// Effective size of those spans.
    pub system_bytes: usize,
}

impl HeapStats {
    pub(crate) fn record_allocation(&mut self, size: usize, span: usize) {
        self.total_allocations += 1;
        self.current_allocations += 1;
        self.maximum_allocations = self.maximum_allocations.max(self.current_allocations);

        self.total_bytes_allocated += size;
        self.current_bytes_allocated += size;
        self.maximum_bytes_allocated = self.maximum_bytes_allocated.max(self.current_bytes_allocated);

        self.total_bytes_used += span;
        self.current_bytes_used += span;
        self.maximum_bytes_used = self.maximum_bytes_used.max(self.current_bytes_used);

        self.current_bytes_free -= span;
    }

    pub(crate) fn record_free(&mut self, size: usize, span: usize) {
        self.total_frees += 1;
        self.current_allocations -= 1;
        self.current_bytes_allocated -= size;
        self.current_bytes_used -= span;
        self.current_bytes_free += span;
    }

    pub(crate) fn record_system_allocation(&mut self, size: usize, free: usize) {
        self.system_allocations += 1;
        self.system_bytes += size;
        self.current_bytes_free += free;
    }
}
