use std::{ptr::NonNull, slice};

use crate::{
    block::{address, Block, BlockStatus, Link, TreeLinks, ALIGNMENT, FREE_FILL, GUARD_BAND_FILL, HEADER_SIZE},
    error::{CorruptionMap, HeapError},
    flags::Flags,
    heap::Heap,
    interface::ExternalInterface,
    region::Spans,
    utils::padding,
};

/// Child slots of a tree node, in the order the tree walk visits them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Child {
    Less,
    Greater,
    Equal,
}

impl Child {
    const ALL: [Child; 3] = [Child::Less, Child::Greater, Child::Equal];

    fn of(self, links: &TreeLinks) -> Link {
        match self {
            Child::Less => links.less,
            Child::Greater => links.greater,
            Child::Equal => links.equal,
        }
    }
}

impl<E: ExternalInterface> Heap<E> {
    /// Checks the whole heap and reports every inconsistency found. Returns
    /// true when nothing was reported.
    ///
    /// Every span is walked in address order checking markers, statuses, sizes
    /// and links. With [`Flags::VALIDATE_GUARD_BANDS`] the guard bands of every
    /// allocation that filled them are checked, and with [`Flags::VALIDATE_FREE`]
    /// the free pattern of every free block if the heap fills frees. The free
    /// tree is then walked checking its order and parent links, and must hold
    /// exactly the free blocks found by the linear walk.
    pub fn verify(&mut self, flags: Flags) -> bool {
        let errors = self.error_count();

        let free_blocks = self.verify_spans(flags);
        let tree_blocks = self.verify_free_tree();

        heap_assert!(self, tree_blocks == free_blocks, "free tree block count == free block count");
        heap_assert!(self, self.free_tree.len() == free_blocks, "free_tree.len() == free block count");

        self.error_count() == errors
    }

    /// Linear walk of every span. Returns the number of free blocks seen.
    fn verify_spans(&mut self, flags: Flags) -> usize {
        let validate_guard_bands = flags.contains(Flags::VALIDATE_GUARD_BANDS) && self.guard_band_size > 0;
        let validate_free = flags.contains(Flags::VALIDATE_FREE) && self.flags.contains(Flags::FILL_FREES);
        let mut free_blocks = 0;

        for span in Spans::new(self.first_system_allocation) {
            let span = unsafe { span.as_ref() };
            let start = unsafe { span.start.as_ref() };

            if !heap_assert!(self, start.has_marker() && start.is(BlockStatus::Sentinel), "start sentinel is intact") {
                continue;
            }

            let mut previous = span.start;
            let mut current = start.next;

            loop {
                let Some(block) = current else {
                    heap_assert!(self, false, "block.next != null");
                    break;
                };
                if !heap_assert!(self, span.owns(address(block)), "block lies inside its system allocation") {
                    break;
                }

                let header = unsafe { block.as_ref() };
                if !heap_assert!(self, header.has_marker(), "block.marker == MARKER")
                    || !heap_assert!(self, header.previous == Some(previous), "block.previous.next == block")
                {
                    break;
                }

                if block == span.end {
                    heap_assert!(self, header.is(BlockStatus::Sentinel), "end sentinel is intact");
                    break;
                }

                let size_valid = header.size % ALIGNMENT == 0 && header.size >= HEADER_SIZE;
                if !heap_assert!(self, size_valid, "block.size % ALIGNMENT == 0")
                    || !heap_assert!(
                        self,
                        header.next.map(address) == Some(address(block) + header.footprint()),
                        "block.next == block + block.size"
                    )
                {
                    break;
                }

                match header.status() {
                    Some(BlockStatus::Free) => {
                        free_blocks += 1;
                        if validate_free && !header.is_fixed() {
                            self.check_free_pattern(block);
                        }
                    }
                    Some(BlockStatus::Allocated) => {
                        if validate_guard_bands && header.allocation().flags.contains(Flags::FILL_GUARD_BANDS) {
                            self.check_guard_bands(block);
                        }
                    }
                    _ => {
                        heap_assert!(self, false, "block.status == Free || block.status == Allocated");
                    }
                }

                previous = block;
                current = header.next;
            }
        }

        free_blocks
    }

    /// Walks the free tree and its equal chains. Returns the number of blocks
    /// reached.
    ///
    /// The walk climbs back through the `parent` links, so it needs no memory
    /// of its own. A parent link is only followed after it has been checked on
    /// the way down, and the walk stops at the first block it can't trust.
    fn verify_free_tree(&mut self) -> usize {
        // More blocks than headers fit in the heap means a cycle
        let limit = self.stats.system_bytes / HEADER_SIZE;
        let mut count = 0;

        let Some(mut node) = self.free_tree.root() else {
            return 0;
        };
        let mut parent: Link = None;
        let mut slot: Option<Child> = None;
        // Child the walk just came back from, none when `node` is new
        let mut returned_from: Option<Child> = None;

        loop {
            if returned_from.is_none() {
                count += 1;
                if !self.verify_tree_node(node, parent, slot, count <= limit) {
                    break;
                }
            }

            let links = unsafe { *node.as_ref().links() };
            let next = Child::ALL
                .into_iter()
                .filter(|&child| returned_from.is_none_or(|from| child > from))
                .find_map(|child| Some((child, child.of(&links)?)));

            if let Some((child, block)) = next {
                parent = Some(node);
                slot = Some(child);
                node = block;
                returned_from = None;
                continue;
            }

            let Some(up) = links.parent else {
                break;
            };
            let up_links = unsafe { *up.as_ref().links() };
            let Some(from) = Child::ALL.into_iter().find(|child| child.of(&up_links) == Some(node)) else {
                heap_assert!(self, false, "block.parent links back to block");
                break;
            };
            returned_from = Some(from);
            node = up;
        }

        count
    }

    /// Checks one block reached through `slot` of `parent`. Returns false when
    /// the walk can't go on from it.
    fn verify_tree_node(&mut self, node: NonNull<Block>, parent: Link, slot: Option<Child>, below_limit: bool) -> bool {
        if !heap_assert!(self, below_limit, "free tree has no cycles")
            || !heap_assert!(self, self.owns_block(address(node)), "free block lies inside the heap")
        {
            return false;
        }

        let header = unsafe { node.as_ref() };
        if !heap_assert!(self, header.has_marker() && header.is(BlockStatus::Free), "free block is marked Free") {
            return false;
        }

        let links = *header.links();
        if !heap_assert!(self, links.parent == parent, "block.parent links back to block") {
            return false;
        }

        let (Some(parent), Some(slot)) = (parent, slot) else {
            return true;
        };
        let parent_size = unsafe { parent.as_ref().size };

        match slot {
            Child::Less => {
                heap_assert!(self, header.size < parent_size, "block.less.size < block.size");
            }
            Child::Greater => {
                heap_assert!(self, header.size > parent_size, "block.greater.size > block.size");
            }
            Child::Equal => {
                heap_assert!(self, header.size == parent_size, "block.equal.size == block.size");
                heap_assert!(
                    self,
                    links.less.is_none() && links.greater.is_none(),
                    "equal chain members have no children"
                );
            }
        }

        true
    }

    /// Compares the guard bands of an allocated block with their fill pattern
    /// and reports any corrupted byte.
    pub(crate) fn check_guard_bands(&mut self, block: NonNull<Block>) -> bool {
        let guard_band_size = self.guard_band_size;
        let header = unsafe { block.as_ref() };
        let size = header.allocation().size;
        let post_len = padding(size, ALIGNMENT) + guard_band_size;

        let fits = size
            .checked_add(HEADER_SIZE + guard_band_size + post_len)
            .is_some_and(|end| end <= header.size);
        if !heap_assert!(self, fits, "allocation fits in its block") {
            return false;
        }

        let (memory, pre, post) = unsafe {
            let pre_start = Block::payload(block);
            let memory = pre_start.add(guard_band_size);
            (
                memory,
                slice::from_raw_parts(pre_start.as_ptr(), guard_band_size),
                slice::from_raw_parts(memory.as_ptr().add(size), post_len),
            )
        };

        let pre = CorruptionMap::scan(pre, GUARD_BAND_FILL);
        let post = CorruptionMap::scan(post, GUARD_BAND_FILL);
        if pre.is_clean() && post.is_clean() {
            return true;
        }

        self.report(HeapError::GuardBandCorruption {
            memory: address(memory),
            size,
            pre,
            post,
        });
        false
    }

    /// Reports the first byte of a free block payload that lost the free
    /// pattern.
    fn check_free_pattern(&mut self, block: NonNull<Block>) -> bool {
        let (size, payload) = unsafe { (block.as_ref().size, Block::payload(block)) };
        let bytes = unsafe { slice::from_raw_parts(payload.as_ptr(), size - HEADER_SIZE) };

        match bytes.iter().position(|&byte| byte != FREE_FILL) {
            None => true,
            Some(index) => {
                self.report(HeapError::FreeCorruption {
                    memory: address(payload),
                    size,
                    index,
                });
                false
            }
        }
    }

    /// Validates the header and guard bands of one live allocation.
    ///
    /// **SAFETY**: see [`Heap::free`].
    pub unsafe fn check_allocation(&mut self, memory: *mut u8) -> bool {
        let Some(memory) = NonNull::new(memory) else {
            return false;
        };
        let Some(block) = self.allocated_header(memory) else {
            return false;
        };

        let filled = unsafe { block.as_ref().allocation().flags.contains(Flags::FILL_GUARD_BANDS) };
        if self.guard_band_size == 0 || !filled {
            return true;
        }

        self.check_guard_bands(block)
    }
}
