//! This file contains all the helper functions for the heap.
//! This are functions that don't particularly belong to any concrete module of the program.

/// Number of bytes needed after `size` to reach the next multiple of
/// `alignment`, which must be a power of two.
///
/// This never overflows, so it is safe to use on client supplied sizes
/// before they have been range checked.
pub const fn padding(size: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (alignment - (size & mask)) & mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn padding_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, size + padding(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn padding_header_size() {
        let aligments = vec![(1..64, 64), (65..128, 128)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, size + padding(size, 64))
            }
        }
    }

    #[test]
    fn aligned_sizes_need_no_padding() {
        assert_eq!(padding(0, 64), 0);
        assert_eq!(padding(64, 64), 0);
        assert_eq!(padding(4096, 4096), 0);
        assert_eq!(padding(usize::MAX, 64), 1);
    }
}
