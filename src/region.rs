use std::{mem, ptr::{self, NonNull}};

use static_assertions::const_assert;

use crate::{
    block::{address, Block, BlockStatus, ALIGNMENT, FREE_FILL, HEADER_SIZE},
    freelist::FreeTree,
};

const_assert!(mem::size_of::<SystemAllocation>() <= HEADER_SIZE);

/// Headers that every system allocation spends on itself: the record and the
/// two sentinels.
pub(crate) const SYSTEM_ALLOCATION_OVERHEAD: usize = 3 * HEADER_SIZE;

/// Record placed at the very start of every span obtained from the page source.
///
/// The page source gives us spans that we cannot assume are adjacent, so each
/// one is laid out on its own and bounded by two sentinels that are never free,
/// which removes the boundary special cases from walking and coalescing:
///
/// ```text
/// +--------+----------+-------+-------+-------+-------------+----------+
/// | Record | Sentinel | Fixed |  ...  | Fixed |    Free     | Sentinel |
/// +--------+----------+-------+-------+-------+-------------+----------+
///             start     (first span only)                      end
/// ```
///
/// Records form a singly linked list in the order the spans were obtained.
#[repr(C)]
pub(crate) struct SystemAllocation {
    pub start: NonNull<Block>,
    pub end: NonNull<Block>,
    pub next: Option<NonNull<SystemAllocation>>,
    /// Size returned by the page source.
    pub size: usize,
}

impl SystemAllocation {
    /// Lays out a new span of `size` bytes at `memory` and returns its record.
    ///
    /// Only the free block and the fixed nodes come back unlinked from the free
    /// tree; inserting them is up to the caller.
    ///
    /// **SAFETY**: `memory` must be valid for writes of `size` bytes, aligned to
    /// [`ALIGNMENT`], and `size` (rounded down to [`ALIGNMENT`]) must leave room
    /// for the overhead, the fixed nodes and a free block of two headers.
    pub unsafe fn carve(memory: NonNull<u8>, size: usize, fixed: &[usize], fill: bool) -> NonNull<SystemAllocation> {
        let usable = size & !(ALIGNMENT - 1);

        unsafe {
            let start = Block::write(memory.add(HEADER_SIZE), Block::new(BlockStatus::Sentinel, HEADER_SIZE));
            let mut offset = 2 * HEADER_SIZE;
            let mut previous = start;

            for &fixed_size in fixed {
                let node = Block::write(memory.add(offset), Block::fixed(fixed_size));
                link(previous, node);
                previous = node;
                offset += HEADER_SIZE;
            }

            let free_size = usable - offset - HEADER_SIZE;
            let free = Block::write(memory.add(offset), Block::new(BlockStatus::Free, free_size));
            if fill {
                ptr::write_bytes(Block::payload(free).as_ptr(), FREE_FILL, free_size - HEADER_SIZE);
            }
            link(previous, free);

            let end = Block::write(memory.add(offset + free_size), Block::new(BlockStatus::Sentinel, HEADER_SIZE));
            link(free, end);

            let record = memory.cast::<SystemAllocation>();
            record.as_ptr().write(SystemAllocation {
                start,
                end,
                next: None,
                size,
            });
            record
        }
    }

    /// True if `addr` is a header position between the two sentinels, bounds
    /// included.
    pub fn owns(&self, addr: usize) -> bool {
        let start = address(self.start);
        addr >= start && addr <= address(self.end) && (addr - start) % ALIGNMENT == 0
    }

    /// True if `addr` is a header position strictly between the sentinels.
    pub fn holds_block(&self, addr: usize) -> bool {
        self.owns(addr) && addr != address(self.start) && addr != address(self.end)
    }

    /// Walks the blocks between the sentinels in address order.
    ///
    /// The walk stops early if a `next` link leaves the span.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            allocation: self,
            current: unsafe { self.start.as_ref().next },
        }
    }
}

pub(crate) struct Blocks<'a> {
    allocation: &'a SystemAllocation,
    current: Option<NonNull<Block>>,
}

impl Iterator for Blocks<'_> {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current.filter(|&block| self.allocation.holds_block(address(block)))?;
        self.current = unsafe { block.as_ref().next };
        Some(block)
    }
}

/// Walks the list of system allocations.
pub(crate) struct Spans {
    current: Option<NonNull<SystemAllocation>>,
}

impl Spans {
    pub fn new(first: Option<NonNull<SystemAllocation>>) -> Self {
        Self { current: first }
    }
}

impl Iterator for Spans {
    type Item = NonNull<SystemAllocation>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.current?;
        self.current = unsafe { span.as_ref().next };
        Some(span)
    }
}

#[inline]
unsafe fn link(mut previous: NonNull<Block>, mut next: NonNull<Block>) {
    unsafe {
        previous.as_mut().next = Some(next);
        next.as_mut().previous = Some(previous);
    }
}

/// Shrinks `block` to `block_size` bytes and turns the rest of its span into a
/// new free block, which is returned unlinked from the free tree.
///
/// **SAFETY**: `block` must be a linked header whose span exceeds `block_size`
/// by at least two headers; `block_size` must be a multiple of [`ALIGNMENT`].
pub(crate) unsafe fn split(mut block: NonNull<Block>, block_size: usize) -> NonNull<Block> {
    unsafe {
        let header = block.as_mut();
        let remainder_size = header.size - block_size;
        let after = header.next;
        header.size = block_size;

        let remainder = Block::write(
            block.cast::<u8>().add(block_size),
            Block::new(BlockStatus::Free, remainder_size),
        );
        link(block, remainder);
        if let Some(after) = after {
            link(remainder, after);
        }
        remainder
    }
}

/// Tries to merge the given block with the next one in address order. This
/// can be performed if that next block is free and not a fixed node.
///
/// The next block leaves the free tree and its header is destroyed.
///
/// **SAFETY**: `block` must be a linked header that is not in the free tree.
pub(crate) unsafe fn merge_with_next(
    mut block: NonNull<Block>,
    free_tree: &mut FreeTree,
    fill: bool,
) -> Result<bool, &'static str> {
    unsafe {
        let next = block.as_ref().next.ok_or("block.next != null")?;
        let next_block = next.as_ref();
        if !next_block.is(BlockStatus::Free) || next_block.is_fixed() {
            return Ok(false);
        }

        free_tree.remove(next)?;

        let after = next_block.next.ok_or("next.next != null")?;
        let absorbed = next_block.size;

        let header = block.as_mut();
        header.size += absorbed;
        header.next = Some(after);
        (*after.as_ptr()).previous = Some(block);

        Block::destroy(next, fill);
        Ok(true)
    }
}

/// Tries to merge the given block with the previous one in address order. This
/// can be performed if that previous block is free and not a fixed node.
///
/// Returns the block that now covers the merged span: the previous one when
/// merged, `block` otherwise. The returned block is not in the free tree.
///
/// **SAFETY**: `block` must be a linked header that is not in the free tree.
pub(crate) unsafe fn merge_with_prev(
    block: NonNull<Block>,
    free_tree: &mut FreeTree,
    fill: bool,
) -> Result<NonNull<Block>, &'static str> {
    unsafe {
        let mut previous = block.as_ref().previous.ok_or("block.previous != null")?;
        let previous_block = previous.as_ref();
        if !previous_block.is(BlockStatus::Free) || previous_block.is_fixed() {
            return Ok(block);
        }

        free_tree.remove(previous)?;

        let (size, after) = {
            let header = block.as_ref();
            (header.size, header.next.ok_or("block.next != null")?)
        };

        let merged = previous.as_mut();
        merged.set_status(BlockStatus::Unknown);
        merged.size += size;
        merged.next = Some(after);
        (*after.as_ptr()).previous = Some(previous);

        Block::destroy(block, fill);
        Ok(previous)
    }
}
