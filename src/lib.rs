//! ThreeHeap, a debugging heap allocator.
//!
//! The heap hands out memory like any general purpose allocator, but every
//! block carries enough metadata to catch the usual memory bugs of the code
//! that uses it: double frees, memory released with the wrong function,
//! overruns into the bytes around an allocation and writes to freed memory.
//!
//! Free blocks are indexed by size in a ternary search tree, where blocks of
//! the same size hang from a single node, so allocation is a best fit found
//! in one descent.
//!
//! ```no_run
//! use threeheap::{Flags, Heap, Owner};
//!
//! let mut heap: Heap = Heap::default();
//!
//! let memory = heap.allocate(100, 0, Flags::NEW_ARRAY, Owner::NONE);
//! unsafe { heap.free(memory, Flags::NEW_ARRAY) };
//!
//! assert!(heap.verify(Flags::VALIDATE_EVERYTHING));
//! ```

#[macro_use]
mod error;

mod block;
mod config;
mod flags;
mod freelist;
mod heap;
mod interface;
mod kernel;
mod region;
mod stats;
mod utils;
mod verify;

#[cfg(test)]
mod testing;

pub use block::{Owner, ALIGNMENT, ALLOCATION_FILL, FREE_FILL, GUARD_BAND_FILL, GUARD_BAND_SIZE, HEADER_SIZE};
pub use config::{fixed_node_sizes, HeapConfig};
pub use error::{CorruptionMap, HeapError, CORRUPTION_MAP_CAPACITY};
pub use flags::Flags;
pub use heap::Heap;
pub use interface::{DefaultInterface, ExternalInterface, LiveAllocation, Operation, OperationKind, SystemPages};
pub use stats::HeapStats;
