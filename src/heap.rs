use std::ptr::{self, NonNull};

use crate::{
    block::{
        address, Allocation, Block, BlockStatus, Owner, TreeLinks, ALIGNMENT, ALLOCATION_FILL,
        FREE_FILL, GUARD_BAND_FILL, GUARD_BAND_SIZE, HEADER_SIZE, SPLIT_SIZE,
    },
    config::HeapConfig,
    error::HeapError,
    flags::Flags,
    freelist::FreeTree,
    interface::{DefaultInterface, ExternalInterface, LiveAllocation, Operation, OperationKind, SystemPages},
    region::{self, Spans, SystemAllocation, SYSTEM_ALLOCATION_OVERHEAD},
    stats::HeapStats,
    utils::padding,
};

/// Debugging heap allocator.
///
/// Memory comes in large spans from an [`ExternalInterface`]. Every span is
/// cut into blocks that are linked in address order, and the free ones are
/// indexed by size in a ternary search tree so that every allocation gets the
/// best fit:
///
/// ```text
///  +--------+----------+------------------+--------------+-----+----------+
///  | Record | Sentinel |    Allocated     |     Free     | ... | Sentinel |
///  +--------+----------+------------------+--------------+-----+----------+
///                      | header | guard | payload | pad | guard |
///                      +--------+-------+---------+-----+-------+
///                                       ^
///                                       pointer handed to the client
/// ```
///
/// Every failure goes through [`ExternalInterface::error`] instead of a return
/// value. If the interface lets the process live, the failed operation is
/// abandoned: allocations return null and frees leak.
///
/// The heap is not synchronized. Wrap it in a lock to share it.
pub struct Heap<E: ExternalInterface = DefaultInterface> {
    pub(crate) external: E,
    /// Heap wide flags, without provenance bits.
    pub(crate) flags: Flags,
    /// [`GUARD_BAND_SIZE`] when guard bands are on, zero otherwise.
    pub(crate) guard_band_size: usize,
    fixed_node_sizes: Vec<usize>,
    pub(crate) free_tree: FreeTree,
    pub(crate) first_system_allocation: Option<NonNull<SystemAllocation>>,
    last_system_allocation: Option<NonNull<SystemAllocation>>,
    pub(crate) stats: HeapStats,
    errors: usize,
}

// SAFETY: the heap exclusively owns every span it links to.
unsafe impl<E: ExternalInterface + Send> Send for Heap<E> {}

impl<E: ExternalInterface> Heap<E> {
    /// Builds a heap on top of `external`. No memory is requested until the
    /// first allocation, unless fixed nodes have to be placed.
    pub fn new(external: E, config: HeapConfig) -> Self {
        let flags = config.flags - Flags::PROVENANCE;
        let guard_band_size = if flags.contains(Flags::GUARD_BANDS) { GUARD_BAND_SIZE } else { 0 };

        let mut heap = Self {
            external,
            flags,
            guard_band_size,
            fixed_node_sizes: Vec::new(),
            free_tree: FreeTree::new(),
            first_system_allocation: None,
            last_system_allocation: None,
            stats: HeapStats::default(),
            errors: 0,
        };

        let mut fixed_node_sizes = Vec::with_capacity(config.fixed_node_sizes.len());
        for size in config.fixed_node_sizes {
            let valid = size >= SPLIT_SIZE && size % ALIGNMENT == 0 && !fixed_node_sizes.contains(&size);
            if heap_assert!(heap, valid, "fixed node size is a distinct multiple of ALIGNMENT >= SPLIT_SIZE") {
                fixed_node_sizes.push(size);
            }
        }
        heap.fixed_node_sizes = fixed_node_sizes;

        if !heap.fixed_node_sizes.is_empty() {
            if let Err(error) = heap.allocate_from_system(0) {
                heap.report(error);
            }
        }

        log::debug!(
            "heap created with flags {:x}, {} fixed nodes",
            heap.flags,
            heap.fixed_node_sizes.len()
        );

        heap
    }

    /// Sends `error` to the interface.
    pub(crate) fn report(&mut self, error: HeapError) {
        self.errors += 1;
        self.external.error(&error);
    }

    /// Allocates `size` bytes aligned to `alignment`, which can't exceed
    /// [`ALIGNMENT`]. Zero means the default alignment.
    ///
    /// `flags` are combined with the heap flags and must carry the provenance
    /// of the call, which is checked again when the memory is freed.
    ///
    /// Returns null only after a failure has been reported.
    pub fn allocate(&mut self, size: usize, alignment: usize, flags: Flags, owner: Owner) -> *mut u8 {
        self.try_allocate(size, alignment, flags, owner)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    fn try_allocate(&mut self, size: usize, alignment: usize, flags: Flags, owner: Owner) -> Option<NonNull<u8>> {
        if !heap_assert!(self, alignment <= ALIGNMENT) {
            return None;
        }

        let flags = flags | self.flags;
        let Some(block_size) = self.block_size(size) else {
            self.report(HeapError::OutOfMemory { size });
            return None;
        };

        let mut block = self.find_free_block(block_size)?;

        unsafe {
            heap_check!(self, self.free_tree.remove(block))?;

            // Leftovers too small for a block of their own stay as slack
            if block.as_ref().size - block_size >= SPLIT_SIZE {
                let remainder = region::split(block, block_size);
                heap_check!(self, self.free_tree.insert(remainder))?;
            }

            let header = block.as_mut();
            header.set_status(BlockStatus::Allocated);
            *header.allocation_mut() = Allocation {
                size,
                owner,
                flags,
                alignment: alignment as u32,
            };

            let span = header.size;
            self.stats.record_allocation(size, span);

            let memory = Block::payload(block).add(self.guard_band_size);

            if self.guard_band_size > 0 && flags.contains(Flags::FILL_GUARD_BANDS) {
                let post = padding(size, ALIGNMENT) + self.guard_band_size;
                ptr::write_bytes(Block::payload(block).as_ptr(), GUARD_BAND_FILL, self.guard_band_size);
                ptr::write_bytes(memory.as_ptr().add(size), GUARD_BAND_FILL, post);
            }

            if flags.contains(Flags::MALLOC_CALLOC) {
                ptr::write_bytes(memory.as_ptr(), 0, size);
            } else if flags.contains(Flags::FILL_ALLOCATIONS) {
                ptr::write_bytes(memory.as_ptr(), ALLOCATION_FILL, size);
            }

            if flags.contains(Flags::REPORT_ALLOCATION) {
                self.external.report_operation(&Operation {
                    kind: OperationKind::Allocate,
                    memory: address(memory),
                    size,
                    alignment,
                    owner,
                    flags,
                });
            }

            log::trace!("allocated {size} bytes at {memory:p}, block of {span} bytes");

            Some(memory)
        }
    }

    /// Header, guard bands, payload and padding of an allocation of `size`.
    fn block_size(&self, size: usize) -> Option<usize> {
        size.checked_add(padding(size, ALIGNMENT))?
            .checked_add(HEADER_SIZE + 2 * self.guard_band_size)
    }

    /// Best fit for `block_size`, growing the heap once if nothing fits.
    fn find_free_block(&mut self, block_size: usize) -> Option<NonNull<Block>> {
        if let Some(block) = unsafe { self.free_tree.search(block_size) } {
            return Some(block);
        }

        if let Err(error) = self.allocate_from_system(block_size) {
            self.report(error);
            return None;
        }

        let block = unsafe { self.free_tree.search(block_size) };
        heap_assert!(self, block.is_some(), "free_tree.search(block_size) != null");
        block
    }

    /// Requests a new span big enough for a block of `minimum_size` bytes and
    /// adds its free block to the tree.
    ///
    /// The first span also receives the fixed nodes.
    pub(crate) fn allocate_from_system(&mut self, minimum_size: usize) -> Result<(), HeapError> {
        let fixed: &[usize] = if self.first_system_allocation.is_none() {
            &self.fixed_node_sizes
        } else {
            &[]
        };

        let overhead = SYSTEM_ALLOCATION_OVERHEAD + fixed.len() * HEADER_SIZE;
        let request = minimum_size
            .max(SPLIT_SIZE)
            .checked_add(overhead)
            .ok_or(HeapError::OutOfMemory { size: minimum_size })?;

        let pages = self
            .external
            .request_pages(request)
            .ok_or(HeapError::OutOfMemory { size: request })?;

        if address(pages.memory) % ALIGNMENT != 0 {
            return Err(assertion!("system allocation is aligned to ALIGNMENT"));
        }
        if pages.size < request {
            return Err(assertion!("system allocation size >= requested size"));
        }

        let usable = pages.size & !(ALIGNMENT - 1);
        let fill = self.flags.contains(Flags::FILL_FREES);

        unsafe {
            let record = SystemAllocation::carve(pages.memory, pages.size, fixed, fill);

            match self.last_system_allocation {
                Some(mut last) => last.as_mut().next = Some(record),
                None => self.first_system_allocation = Some(record),
            }
            self.last_system_allocation = Some(record);

            // Fixed nodes go first so they become the top of the tree
            let mut free = 0;
            for block in record.as_ref().blocks() {
                if !block.as_ref().is_fixed() {
                    free += block.as_ref().size;
                }
                self.free_tree.insert(block).map_err(|expression| assertion!(expression))?;
            }

            self.stats.record_system_allocation(usable, free);
        }

        log::debug!(
            "system allocation of {} bytes at {:p} for a block of {minimum_size} bytes",
            pages.size,
            pages.memory
        );

        Ok(())
    }

    /// Releases memory returned by [`Heap::allocate`]. Null is ignored.
    ///
    /// The provenance bits of `flags` must match the ones the memory was
    /// allocated with, otherwise the error is reported and the memory leaked.
    ///
    /// **SAFETY**: the heap validates `memory` before touching it, but a
    /// pointer into memory that is not mapped can still fault.
    pub unsafe fn free(&mut self, memory: *mut u8, flags: Flags) {
        let Some(memory) = NonNull::new(memory) else {
            return;
        };
        let Some(mut block) = self.allocated_header(memory) else {
            return;
        };

        let flags = flags | self.flags;
        let allocation = unsafe { *block.as_ref().allocation() };

        if allocation.flags.provenance() != flags.provenance() {
            self.report(HeapError::MismatchedFree {
                memory: address(memory),
                size: allocation.size,
                allocation_flags: allocation.flags,
                free_flags: flags,
            });
            return;
        }

        if self.guard_band_size > 0
            && allocation.flags.contains(Flags::FILL_GUARD_BANDS)
            && (allocation.flags | flags).contains(Flags::VALIDATE_GUARD_BANDS)
        {
            self.check_guard_bands(block);
        }

        if flags.contains(Flags::REPORT_FREE) {
            self.external.report_operation(&Operation {
                kind: OperationKind::Free,
                memory: address(memory),
                size: allocation.size,
                alignment: allocation.alignment as usize,
                owner: allocation.owner,
                flags,
            });
        }

        let fill = flags.contains(Flags::FILL_FREES);

        unsafe {
            let span = block.as_ref().size;
            self.stats.record_free(allocation.size, span);

            if fill {
                ptr::write_bytes(Block::payload(block).as_ptr(), FREE_FILL, span - HEADER_SIZE);
            }
            block.as_mut().set_status(BlockStatus::Unknown);

            if heap_check!(self, region::merge_with_next(block, &mut self.free_tree, fill)).is_none() {
                return;
            }
            let Some(mut merged) = heap_check!(self, region::merge_with_prev(block, &mut self.free_tree, fill))
            else {
                return;
            };

            let header = merged.as_mut();
            header.set_status(BlockStatus::Free);
            *header.links_mut() = TreeLinks::default();
            heap_check!(self, self.free_tree.insert(merged));
        }

        log::trace!("freed {} bytes at {memory:p}", allocation.size);
    }

    /// Moves an allocation into a block of `size` bytes, copying what fits.
    ///
    /// The memory must come from the malloc family. The new block keeps the
    /// owner and flags of the old one. Null behaves like an allocation with
    /// [`Flags::MALLOC`].
    ///
    /// **SAFETY**: see [`Heap::free`].
    pub unsafe fn reallocate(&mut self, memory: *mut u8, size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(memory) else {
            return self.allocate(size, 0, Flags::MALLOC, Owner::NONE);
        };
        let Some(block) = self.allocated_header(old) else {
            return ptr::null_mut();
        };

        let allocation = unsafe { *block.as_ref().allocation() };
        if allocation.flags.provenance() != Flags::MALLOC {
            self.report(HeapError::MismatchedFree {
                memory: address(old),
                size: allocation.size,
                allocation_flags: allocation.flags,
                free_flags: Flags::MALLOC | self.flags,
            });
            return ptr::null_mut();
        }

        let new = self.allocate(size, allocation.alignment as usize, allocation.flags, allocation.owner);
        if new.is_null() {
            return new;
        }

        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new, allocation.size.min(size));
            self.free(old.as_ptr(), Flags::MALLOC);
        }

        new
    }

    /// Gives an allocation a new owner and returns it, or null if `memory`
    /// is not a live allocation.
    ///
    /// **SAFETY**: see [`Heap::free`].
    pub unsafe fn own(&mut self, memory: *mut u8, owner: Owner) -> *mut u8 {
        let Some(memory) = NonNull::new(memory) else {
            return ptr::null_mut();
        };
        let Some(mut block) = self.allocated_header(memory) else {
            return ptr::null_mut();
        };

        unsafe { block.as_mut().allocation_mut().owner = owner };
        memory.as_ptr()
    }

    /// Size requested when `memory` was allocated. Zero for null or rejected
    /// pointers.
    ///
    /// **SAFETY**: see [`Heap::free`].
    pub unsafe fn allocation_size(&mut self, memory: *mut u8) -> usize {
        NonNull::new(memory)
            .and_then(|memory| self.allocated_header(memory))
            .map_or(0, |block| unsafe { block.as_ref().allocation().size })
    }

    /// Sends every live allocation to [`ExternalInterface::report_allocation`]
    /// in address order and returns how many there were.
    pub fn report_allocations(&mut self) -> usize {
        let mut count = 0;

        for span in Spans::new(self.first_system_allocation) {
            for block in unsafe { span.as_ref() }.blocks() {
                let header = unsafe { block.as_ref() };
                if !header.is(BlockStatus::Allocated) {
                    continue;
                }

                let allocation = header.allocation();
                let memory = address(unsafe { Block::payload(block) }) + self.guard_band_size;
                self.external.report_allocation(&LiveAllocation {
                    memory,
                    size: allocation.size,
                    owner: allocation.owner,
                    flags: allocation.flags,
                });
                count += 1;
            }
        }

        count
    }

    /// Recovers and validates the header of a live allocation. Every failed
    /// check is reported.
    pub(crate) fn allocated_header(&mut self, memory: NonNull<u8>) -> Option<NonNull<Block>> {
        let offset = HEADER_SIZE + self.guard_band_size;
        let span = self.span_holding(address(memory).wrapping_sub(offset));
        let Some(span) = span else {
            heap_assert!(self, false, "memory belongs to the heap");
            return None;
        };

        // The span holds the header, so this stays inside it
        let block = NonNull::new(memory.as_ptr().wrapping_sub(offset))?.cast::<Block>();
        let (span, header) = unsafe { (span.as_ref(), block.as_ref()) };

        if !heap_assert!(self, header.has_marker(), "block.marker == MARKER")
            || !heap_assert!(self, header.is(BlockStatus::Allocated), "block.status == Allocated")
        {
            return None;
        }

        let linked = match (header.previous, header.next) {
            (Some(previous), Some(next)) => unsafe {
                span.owns(address(previous))
                    && span.owns(address(next))
                    && previous.as_ref().next == Some(block)
                    && next.as_ref().previous == Some(block)
            },
            _ => false,
        };
        if !heap_assert!(self, linked, "block.previous.next == block && block.next.previous == block") {
            return None;
        }

        Some(block)
    }

    /// The span with a block header at `addr`.
    fn span_holding(&self, addr: usize) -> Option<NonNull<SystemAllocation>> {
        Spans::new(self.first_system_allocation).find(|span| unsafe { span.as_ref() }.holds_block(addr))
    }

    /// True if `addr` is a block header position inside one of the spans.
    pub(crate) fn owns_block(&self, addr: usize) -> bool {
        self.span_holding(addr).is_some()
    }

    pub fn interface(&self) -> &E {
        &self.external
    }

    pub fn interface_mut(&mut self) -> &mut E {
        &mut self.external
    }

    /// Heap wide flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Bytes in each guard band, zero when guard bands are off.
    pub fn guard_band_size(&self) -> usize {
        self.guard_band_size
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Blocks in the free tree, fixed nodes included.
    pub fn free_block_count(&self) -> usize {
        self.free_tree.len()
    }

    /// Number of failures reported so far. Only grows past zero when the
    /// interface lets the process survive an error.
    pub fn error_count(&self) -> usize {
        self.errors
    }
}

impl Default for Heap<DefaultInterface> {
    fn default() -> Self {
        Self::new(DefaultInterface::new(), HeapConfig::default())
    }
}

impl<E: ExternalInterface> Drop for Heap<E> {
    fn drop(&mut self) {
        // The iterator reads `next` before handing a span out
        for span in Spans::new(self.first_system_allocation.take()) {
            let size = unsafe { span.as_ref().size };
            self.external.release_pages(SystemPages {
                memory: span.cast::<u8>(),
                size,
            });
        }
        self.last_system_allocation = None;
    }
}
