use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
};

use crate::{
    config::HeapConfig,
    error::HeapError,
    flags::Flags,
    heap::Heap,
    interface::{ExternalInterface, LiveAllocation, Operation, SystemPages},
    kernel,
};

/// Interface that keeps everything the heap reports and never terminates.
pub(crate) struct Recorder {
    pub errors: Vec<HeapError>,
    pub operations: Vec<Operation>,
    pub leaks: Vec<LiveAllocation>,
    /// Number of spans handed to the heap.
    pub requests: usize,
    /// Number of upcoming page requests to refuse.
    pub refused_requests: usize,
    granularity: usize,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            operations: Vec::new(),
            leaks: Vec::new(),
            requests: 0,
            refused_requests: 0,
            granularity: 1024 * 1024,
        }
    }
}

impl ExternalInterface for Recorder {
    fn request_pages(&mut self, size: usize) -> Option<SystemPages> {
        if self.refused_requests > 0 {
            self.refused_requests -= 1;
            return None;
        }

        let size = size
            .checked_next_multiple_of(self.granularity)?
            .checked_next_multiple_of(kernel::page_size())?;
        let memory = unsafe { kernel::request_memory(size)? };

        self.requests += 1;
        Some(SystemPages { memory, size })
    }

    fn release_pages(&mut self, pages: SystemPages) {
        unsafe { kernel::return_memory(pages.memory, pages.size) };
    }

    fn report_operation(&mut self, operation: &Operation) {
        self.operations.push(*operation);
    }

    fn report_allocation(&mut self, allocation: &LiveAllocation) {
        self.leaks.push(*allocation);
    }

    fn error(&mut self, error: &HeapError) {
        self.errors.push(error.clone());
    }
}

/// Heap over a [`Recorder`] with the given heap wide flags.
pub(crate) fn heap(flags: Flags) -> Heap<Recorder> {
    Heap::new(Recorder::new(), HeapConfig::fast().with_flags(flags))
}

/// Global allocator of the test binary. Counts the allocations of each thread
/// so tests can check that the heap never calls into it.
struct CountingAllocator;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Runs `f` and returns its result with the number of global allocations it
/// made on this thread.
pub(crate) fn allocations_during<T>(f: impl FnOnce() -> T) -> (T, usize) {
    let before = ALLOCATIONS.with(Cell::get);
    let result = f();
    (result, ALLOCATIONS.with(Cell::get) - before)
}
