use std::ptr::NonNull;

use crate::block::{Block, BlockStatus, Link, TreeLinks};

/// Ternary search tree of free [`Block`]s keyed by span size.
///
/// Every node is the header of a free block, so the tree needs no memory of
/// its own. Blocks of the same size don't grow the tree: the first one becomes
/// the node and the others hang from it in a singly linked `equal` chain whose
/// `parent` pointers point back to the previous member.
///
/// ```text
///                       +-------+
///                       |  512  | ---equal---> [512] -> [512]
///                       +-------+
///                less /           \ greater
///               +-------+       +-------+
///               |  192  |       | 4096  | ---equal---> [4096]
///               +-------+       +-------+
///                              /
///                       +-------+
///                       | 1024  |
///                       +-------+
/// ```
///
/// The `parent` back pointer makes removal O(1) once a block is known, which is
/// what coalescing needs.
pub(crate) struct FreeTree {
    root: Link,
    len: usize,
}

/// The pointer that refers to a node: the root or a child slot of its parent.
#[derive(Clone, Copy)]
enum Slot {
    Root,
    Less(NonNull<Block>),
    Greater(NonNull<Block>),
}

impl FreeTree {
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub fn root(&self) -> Link {
        self.root
    }

    /// Number of blocks in the tree, chains included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Inserts a free `block` whose links are all null.
    ///
    /// **SAFETY**: every block reachable from the tree and `block` itself must
    /// be valid headers.
    pub unsafe fn insert(&mut self, mut block: NonNull<Block>) -> Result<(), &'static str> {
        unsafe {
            let header = block.as_ref();
            if !header.is(BlockStatus::Free) {
                return Err("block.status == Free");
            }
            if !header.links().is_detached() || self.root == Some(block) {
                return Err("block is not linked into the free tree");
            }

            let size = header.size;
            self.len += 1;

            let Some(mut node) = self.root else {
                self.root = Some(block);
                return Ok(());
            };

            loop {
                let current = node.as_mut();

                if size < current.size {
                    match current.links().less {
                        Some(less) => node = less,
                        None => {
                            current.links_mut().less = Some(block);
                            block.as_mut().links_mut().parent = Some(node);
                            return Ok(());
                        }
                    }
                } else if size > current.size {
                    match current.links().greater {
                        Some(greater) => node = greater,
                        None => {
                            current.links_mut().greater = Some(block);
                            block.as_mut().links_mut().parent = Some(node);
                            return Ok(());
                        }
                    }
                } else {
                    // Same size, the block becomes the head of the equal chain
                    let equal = current.links().equal;
                    current.links_mut().equal = Some(block);

                    let links = block.as_mut().links_mut();
                    links.parent = Some(node);
                    links.equal = equal;

                    if let Some(mut equal) = equal {
                        equal.as_mut().links_mut().parent = Some(block);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Removes `block` from the tree and leaves all its links null.
    ///
    /// **SAFETY**: `block` must be a valid header; the tree must be intact.
    pub unsafe fn remove(&mut self, mut block: NonNull<Block>) -> Result<(), &'static str> {
        unsafe {
            if !block.as_ref().is(BlockStatus::Free) {
                return Err("block.status == Free");
            }

            let links = *block.as_ref().links();
            let parent = links.parent;

            let slot = match parent {
                Some(mut parent) => {
                    let parent_links = parent.as_mut().links_mut();

                    // Members of an equal chain unlink like a plain list
                    if parent_links.equal == Some(block) {
                        if let Some(mut equal) = links.equal {
                            equal.as_mut().links_mut().parent = Some(parent);
                        }
                        parent_links.equal = links.equal;
                        *block.as_mut().links_mut() = TreeLinks::default();
                        self.len -= 1;
                        return Ok(());
                    }

                    if parent_links.less == Some(block) {
                        Slot::Less(parent)
                    } else if parent_links.greater == Some(block) {
                        Slot::Greater(parent)
                    } else {
                        return Err("block.parent links back to block");
                    }
                }
                None if self.root == Some(block) => Slot::Root,
                None => return Err("block == root"),
            };

            *block.as_mut().links_mut() = TreeLinks::default();
            self.len -= 1;

            // Promote the next block of the same size, it takes over the children
            if let Some(mut equal) = links.equal {
                let promoted = equal.as_mut().links_mut();
                promoted.parent = parent;
                promoted.less = links.less;
                promoted.greater = links.greater;

                if let Some(mut less) = links.less {
                    less.as_mut().links_mut().parent = Some(equal);
                }
                if let Some(mut greater) = links.greater {
                    greater.as_mut().links_mut().parent = Some(equal);
                }

                self.replace(slot, Some(equal));
                return Ok(());
            }

            match (links.less, links.greater) {
                (None, None) => self.replace(slot, None),
                (Some(mut child), None) | (None, Some(mut child)) => {
                    child.as_mut().links_mut().parent = parent;
                    self.replace(slot, Some(child));
                }
                (Some(mut less), Some(mut greater)) => {
                    // Hang the less subtree below the smallest larger block and
                    // let the greater subtree take the place of the block.
                    let mut smallest_larger = greater;
                    while let Some(next) = smallest_larger.as_ref().links().less {
                        smallest_larger = next;
                    }

                    smallest_larger.as_mut().links_mut().less = Some(less);
                    less.as_mut().links_mut().parent = Some(smallest_larger);

                    greater.as_mut().links_mut().parent = parent;
                    self.replace(slot, Some(greater));
                }
            }

            Ok(())
        }
    }

    /// Returns the free block with the smallest span that is at least `size`.
    ///
    /// Fixed nodes are never returned, but the chain hanging from them is.
    /// When the best fit has an equal chain the chain head is returned instead
    /// since it is cheaper to unlink.
    ///
    /// **SAFETY**: the tree must be intact.
    pub unsafe fn search(&self, size: usize) -> Link {
        unsafe {
            Self::best_fit(self.root, size).map(|block| block.as_ref().links().equal.unwrap_or(block))
        }
    }

    /// Single root to leaf descent. Every time the descent turns left the node
    /// it leaves is the best fit seen so far.
    unsafe fn best_fit(root: Link, size: usize) -> Link {
        let mut best_fit: Link = None;
        let mut node = root;

        unsafe {
            while let Some(current) = node {
                let header = current.as_ref();
                let links = header.links();

                if size < header.size {
                    if !header.is_fixed() {
                        best_fit = Some(current);
                    } else if links.equal.is_some() {
                        best_fit = links.equal;
                    } else {
                        // A bare pivot can't be used, anything in its greater
                        // subtree still beats the fits found above it.
                        return Self::best_fit(links.less, size)
                            .or_else(|| Self::best_fit(links.greater, size))
                            .or(best_fit);
                    }
                    node = links.less;
                } else if size > header.size {
                    node = links.greater;
                } else if !header.is_fixed() {
                    return Some(current);
                } else if links.equal.is_some() {
                    return links.equal;
                } else {
                    node = links.greater;
                }
            }
        }

        best_fit
    }

    unsafe fn replace(&mut self, slot: Slot, node: Link) {
        unsafe {
            match slot {
                Slot::Root => self.root = node,
                Slot::Less(mut parent) => parent.as_mut().links_mut().less = node,
                Slot::Greater(mut parent) => parent.as_mut().links_mut().greater = node,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::HEADER_SIZE;

    #[repr(C, align(64))]
    struct Slot([u8; HEADER_SIZE]);

    /// Headers backed by an aligned buffer, one slot per block.
    struct Arena {
        slots: Vec<Slot>,
    }

    impl Arena {
        fn new(len: usize) -> Self {
            Self {
                slots: (0..len).map(|_| Slot([0; HEADER_SIZE])).collect(),
            }
        }

        fn block(&mut self, index: usize, size: usize) -> NonNull<Block> {
            let addr = NonNull::from(&mut self.slots[index]).cast::<u8>();
            unsafe { Block::write(addr, Block::new(BlockStatus::Free, size)) }
        }

        fn fixed(&mut self, index: usize, size: usize) -> NonNull<Block> {
            let addr = NonNull::from(&mut self.slots[index]).cast::<u8>();
            unsafe { Block::write(addr, Block::fixed(size)) }
        }
    }

    /// Checks order and parent links, returns the number of blocks reachable.
    fn check(tree: &FreeTree) -> usize {
        fn walk(node: NonNull<Block>, parent: Link) -> usize {
            let header = unsafe { node.as_ref() };
            let links = *header.links();
            assert_eq!(links.parent, parent);

            let mut count = 1;
            if let Some(less) = links.less {
                assert!(unsafe { less.as_ref().size } < header.size);
                count += walk(less, Some(node));
            }
            if let Some(greater) = links.greater {
                assert!(unsafe { greater.as_ref().size } > header.size);
                count += walk(greater, Some(node));
            }
            if let Some(equal) = links.equal {
                let equal_links = unsafe { equal.as_ref().links() };
                assert_eq!(unsafe { equal.as_ref().size }, header.size);
                assert!(equal_links.less.is_none() && equal_links.greater.is_none());
                count += walk(equal, Some(node));
            }
            count
        }

        let count = tree.root().map_or(0, |root| walk(root, None));
        assert_eq!(count, tree.len());
        count
    }

    fn insert_all(tree: &mut FreeTree, blocks: &[NonNull<Block>]) {
        for &block in blocks {
            unsafe { tree.insert(block).unwrap() };
        }
    }

    #[test]
    fn new_tree_is_empty() {
        let tree = FreeTree::new();

        assert!(tree.root().is_none());
        assert_eq!(tree.len(), 0);
        assert!(unsafe { tree.search(64) }.is_none());
    }

    #[test]
    fn search_returns_the_best_fit() {
        let mut arena = Arena::new(8);
        let sizes = [1024, 256, 4096, 128, 512, 2048, 8192];
        let blocks: Vec<_> = sizes.iter().enumerate().map(|(i, &size)| arena.block(i, size)).collect();

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &blocks);
        assert_eq!(check(&tree), sizes.len());

        unsafe {
            for request in (64..=8192).step_by(64) {
                let expected = sizes.iter().copied().filter(|&size| size >= request).min().unwrap();
                let found = tree.search(request).unwrap();
                assert_eq!(found.as_ref().size, expected, "request {request}");
            }
            assert!(tree.search(8193).is_none());
            assert_eq!(tree.search(512), Some(blocks[4]));
        }
    }

    #[test]
    fn equal_sizes_share_one_node() {
        let mut arena = Arena::new(4);
        let node = arena.block(0, 512);
        let first = arena.block(1, 512);
        let second = arena.block(2, 512);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[node, first, second]);
        assert_eq!(check(&tree), 3);

        unsafe {
            // Newest block is the chain head, right after the tree node
            assert_eq!(node.as_ref().links().equal, Some(second));
            assert_eq!(second.as_ref().links().equal, Some(first));
            assert_eq!(first.as_ref().links().parent, Some(second));

            // Search prefers the chain head over the tree node
            assert_eq!(tree.search(300), Some(second));
            assert_eq!(tree.search(512), Some(second));

            // Removing the chain head relinks the rest of the chain
            tree.remove(second).unwrap();
            assert!(second.as_ref().links().is_detached());
            assert_eq!(node.as_ref().links().equal, Some(first));
            assert_eq!(first.as_ref().links().parent, Some(node));
            assert_eq!(check(&tree), 2);
        }
    }

    #[test]
    fn removing_deep_chain_members_relinks_the_chain() {
        let mut arena = Arena::new(5);
        let node = arena.block(0, 512);
        let first = arena.block(1, 512);
        let second = arena.block(2, 512);
        let third = arena.block(3, 512);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[node, first, second, third]);

        unsafe {
            // node -> third -> second -> first
            assert_eq!(second.as_ref().links().parent, Some(third));
            assert_eq!(first.as_ref().links().parent, Some(second));

            // Middle of the chain, its parent is another member
            tree.remove(second).unwrap();
            assert!(second.as_ref().links().is_detached());
            assert_eq!(third.as_ref().links().equal, Some(first));
            assert_eq!(first.as_ref().links().parent, Some(third));
            assert_eq!(check(&tree), 3);

            // Tail of the chain
            tree.remove(first).unwrap();
            assert!(first.as_ref().links().is_detached());
            assert_eq!(third.as_ref().links().equal, None);
            assert_eq!(node.as_ref().links().equal, Some(third));
            assert_eq!(check(&tree), 2);

            assert_eq!(tree.search(512), Some(third));
        }
    }

    #[test]
    fn removing_a_node_with_a_chain_promotes_the_chain() {
        let mut arena = Arena::new(6);
        let node = arena.block(0, 512);
        let less = arena.block(1, 256);
        let greater = arena.block(2, 1024);
        let equal = arena.block(3, 512);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[node, less, greater, equal]);

        unsafe {
            tree.remove(node).unwrap();

            assert_eq!(tree.root(), Some(equal));
            let links = *equal.as_ref().links();
            assert_eq!(links.less, Some(less));
            assert_eq!(links.greater, Some(greater));
            assert_eq!(links.parent, None);
            assert_eq!(less.as_ref().links().parent, Some(equal));
            assert!(node.as_ref().links().is_detached());
        }
        assert_eq!(check(&tree), 3);
    }

    #[test]
    fn removing_a_node_with_one_child_splices_it() {
        let mut arena = Arena::new(6);
        let root = arena.block(0, 1024);
        let less = arena.block(1, 512);
        let leaf = arena.block(2, 256);
        let greater = arena.block(3, 2048);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[root, less, leaf, greater]);

        unsafe {
            tree.remove(less).unwrap();
            assert_eq!(root.as_ref().links().less, Some(leaf));
            assert_eq!(leaf.as_ref().links().parent, Some(root));
            assert_eq!(check(&tree), 3);

            tree.remove(leaf).unwrap();
            assert_eq!(root.as_ref().links().less, None);
            assert_eq!(check(&tree), 2);

            tree.remove(root).unwrap();
            assert_eq!(tree.root(), Some(greater));
            assert_eq!(greater.as_ref().links().parent, None);
            assert_eq!(check(&tree), 1);

            tree.remove(greater).unwrap();
        }
        assert!(tree.root().is_none());
        assert_eq!(check(&tree), 0);
    }

    #[test]
    fn removing_a_node_with_two_children_keeps_the_order() {
        let mut arena = Arena::new(8);
        let root = arena.block(0, 512);
        let less = arena.block(1, 256);
        let less_less = arena.block(2, 128);
        let greater = arena.block(3, 2048);
        let greater_less = arena.block(4, 1024);
        let greater_greater = arena.block(5, 4096);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[root, less, less_less, greater, greater_less, greater_greater]);

        unsafe {
            tree.remove(root).unwrap();

            assert_eq!(tree.root(), Some(greater));
            assert_eq!(greater.as_ref().links().parent, None);
            // The less subtree hangs below the smallest larger block
            assert_eq!(greater_less.as_ref().links().less, Some(less));
            assert_eq!(less.as_ref().links().parent, Some(greater_less));
            assert_eq!(less.as_ref().links().less, Some(less_less));

            assert_eq!(tree.search(100), Some(less_less));
            assert_eq!(tree.search(600), Some(greater_less));
        }
        assert_eq!(check(&tree), 5);
    }

    #[test]
    fn insert_rejects_linked_or_busy_blocks() {
        let mut arena = Arena::new(4);
        let root = arena.block(0, 512);
        let child = arena.block(1, 256);
        let busy = arena.block(2, 256);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[root, child]);

        unsafe {
            assert!(tree.insert(root).is_err());
            assert!(tree.insert(child).is_err());

            busy.as_ptr().as_mut().unwrap().set_status(BlockStatus::Allocated);
            assert!(tree.insert(busy).is_err());
            assert!(tree.remove(busy).is_err());
        }
        assert_eq!(check(&tree), 2);
    }

    #[test]
    fn fixed_nodes_are_never_handed_out() {
        let mut arena = Arena::new(6);
        let pivot = arena.fixed(0, 1024);
        let small = arena.block(1, 256);
        let large = arena.block(2, 4096);

        let mut tree = FreeTree::new();
        insert_all(&mut tree, &[pivot, small, large]);

        unsafe {
            assert_eq!(tree.search(1024), Some(large));
            assert_eq!(tree.search(512), Some(large));
            assert_eq!(tree.search(200), Some(small));

            // A real block of the pivot size lives in the pivot's chain
            let same = arena.block(3, 1024);
            tree.insert(same).unwrap();
            assert_eq!(tree.search(1024), Some(same));
            assert_eq!(tree.search(512), Some(same));

            tree.remove(same).unwrap();
            assert_eq!(tree.search(1024), Some(large));
        }
        assert_eq!(check(&tree), 3);
    }
}
