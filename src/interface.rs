use std::{fmt, ptr::NonNull};

use crate::{block::Owner, error::HeapError, flags::Flags, kernel};

/// A span handed to the heap by [`ExternalInterface::request_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPages {
    /// Start of the span, aligned to [`crate::ALIGNMENT`] at least.
    pub memory: NonNull<u8>,
    /// Effective size, which may exceed the request.
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Allocate,
    Free,
}

/// One traced allocate or free call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Payload returned by the allocation, or the payload being freed.
    pub memory: usize,
    pub size: usize,
    pub alignment: usize,
    pub owner: Owner,
    pub flags: Flags,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperationKind::Allocate => write!(
                f,
                "op=alloc result={:#x} size={} align={} owner={} flags={:x}",
                self.memory, self.size, self.alignment, self.owner, self.flags
            ),
            OperationKind::Free => write!(
                f,
                "op=free memory={:#x} size={} owner={} flags={:x}",
                self.memory, self.size, self.owner, self.flags
            ),
        }
    }
}

/// An allocation that is still live, as enumerated by
/// [`crate::Heap::report_allocations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAllocation {
    pub memory: usize,
    pub size: usize,
    pub owner: Owner,
    pub flags: Flags,
}

impl fmt::Display for LiveAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation memory={:#x} size={} owner={} flags={:x}",
            self.memory, self.size, self.owner, self.flags
        )
    }
}

/// Everything the heap needs from the outside world: memory, somewhere to
/// send its reports and a way to stop the process.
///
/// Only [`ExternalInterface::request_pages`] has no default.
pub trait ExternalInterface {
    /// Returns a span of at least `size` bytes, or `None` when out of memory.
    fn request_pages(&mut self, size: usize) -> Option<SystemPages>;

    /// Takes back a span obtained from [`ExternalInterface::request_pages`].
    /// Only called when the heap is dropped.
    fn release_pages(&mut self, _pages: SystemPages) {}

    fn report_operation(&mut self, operation: &Operation) {
        log::info!("{operation}");
    }

    fn report_allocation(&mut self, allocation: &LiveAllocation) {
        log::warn!("{allocation}");
    }

    /// Receives every failure detected by the heap. The default prints the
    /// diagnostic and calls [`ExternalInterface::terminate`].
    fn error(&mut self, error: &HeapError) {
        if log::log_enabled!(log::Level::Error) {
            log::error!("{error}");
        } else {
            eprintln!("{error}");
        }
        self.terminate();
    }

    /// Ends the process. When this returns the heap abandons the failed
    /// operation and carries on, with no promise about its consistency.
    fn terminate(&mut self) {
        std::process::abort();
    }
}

/// Page source backed by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultInterface {
    /// Every request is rounded up to this many bytes.
    pub granularity: usize,
    /// Keep running after an error instead of aborting.
    pub permissive: bool,
    /// Log traced operations. Without it operation records are dropped.
    pub report_operations: bool,
}

impl DefaultInterface {
    pub const DEFAULT_GRANULARITY: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            granularity: Self::DEFAULT_GRANULARITY,
            permissive: false,
            report_operations: true,
        }
    }

    /// `granularity` is rounded up to a power of two.
    pub fn with_granularity(granularity: usize) -> Self {
        Self {
            granularity: granularity.max(1).next_power_of_two(),
            ..Self::new()
        }
    }

    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }
}

impl Default for DefaultInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalInterface for DefaultInterface {
    fn request_pages(&mut self, size: usize) -> Option<SystemPages> {
        let size = size
            .checked_next_multiple_of(self.granularity)?
            .checked_next_multiple_of(kernel::page_size())?;

        let memory = unsafe { kernel::request_memory(size)? };
        log::debug!("mapped {size} bytes at {memory:p}");

        Some(SystemPages { memory, size })
    }

    fn release_pages(&mut self, pages: SystemPages) {
        log::debug!("unmapping {} bytes at {:p}", pages.size, pages.memory);
        unsafe { kernel::return_memory(pages.memory, pages.size) };
    }

    fn report_operation(&mut self, operation: &Operation) {
        if self.report_operations {
            log::info!("{operation}");
        }
    }

    fn terminate(&mut self) {
        if !self.permissive {
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_up_to_the_granularity() {
        let mut interface = DefaultInterface::with_granularity(64 * 1024);
        let pages = interface.request_pages(1).expect("out of memory");
        assert_eq!(pages.size, 64 * 1024);
        interface.release_pages(pages);

        let pages = interface.request_pages(64 * 1024 + 1).expect("out of memory");
        assert_eq!(pages.size, 128 * 1024);
        interface.release_pages(pages);

        assert_eq!(interface.request_pages(usize::MAX), None);
    }

    #[test]
    fn granularity_is_a_power_of_two() {
        assert_eq!(DefaultInterface::with_granularity(3000).granularity, 4096);
        assert_eq!(DefaultInterface::new().granularity, 16 * 1024 * 1024);
        assert!(DefaultInterface::new().permissive().permissive);
    }

    #[test]
    fn records_print_as_one_line() {
        let operation = Operation {
            kind: OperationKind::Allocate,
            memory: 0x1000,
            size: 10,
            alignment: 0,
            owner: Owner(0x42),
            flags: Flags::MALLOC,
        };
        assert_eq!(
            operation.to_string(),
            "op=alloc result=0x1000 size=10 align=0 owner=0x42 flags=10"
        );

        let live = LiveAllocation {
            memory: 0x2000,
            size: 3,
            owner: Owner::NONE,
            flags: Flags::NEW_SCALAR,
        };
        assert_eq!(live.to_string(), "allocation memory=0x2000 size=3 owner=0x0 flags=3");
    }
}
