use crate::flags::Flags;

/// Construction parameters of a [`crate::Heap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Heap wide flags, combined with the flags of every call. Provenance
    /// bits are ignored here.
    pub flags: Flags,
    /// Pivot sizes reserved as fixed nodes in the first span, in insertion
    /// order. See [`fixed_node_sizes`].
    pub fixed_node_sizes: Vec<usize>,
}

impl HeapConfig {
    /// Guard bands, every fill pattern and guard band validation on free.
    pub fn debug() -> Self {
        Self {
            flags: Flags::HEAP_DEBUG,
            fixed_node_sizes: Vec::new(),
        }
    }

    /// No debugging aids.
    pub fn fast() -> Self {
        Self {
            flags: Flags::HEAP_FAST,
            fixed_node_sizes: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fixed_nodes(mut self, sizes: Vec<usize>) -> Self {
        self.fixed_node_sizes = sizes;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::debug()
    }
}

/// Pivot sizes obtained by repeatedly halving the distance around `base`.
///
/// Level 0 is `base` alone. Every further level halves the step and adds
/// `size - step` and `size + step` for each size of the previous level, so
/// inserting the result in order builds a balanced top for the free tree:
///
/// ```text
/// fixed_node_sizes(32768, 2)
///
///                 32768
///          16384         49152
///      8192   24576  40960   57344
/// ```
pub fn fixed_node_sizes(base: usize, levels: u32) -> Vec<usize> {
    let mut sizes = vec![base];
    let mut level = vec![base];
    let mut step = base;

    for _ in 0..levels {
        step /= 2;
        if step == 0 {
            break;
        }

        level = level.iter().flat_map(|&size| [size - step, size + step]).collect();
        sizes.extend_from_slice(&level);
    }

    sizes
}
