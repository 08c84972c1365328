use std::fmt;

use thiserror::Error;

use crate::{block::GUARD_BAND_SIZE, flags::Flags};

/// Reports an [`HeapError::Assert`] through the heap's error channel when
/// `$cond` is false and evaluates to `$cond`, so callers can abandon the
/// operation instead of trusting a header that just failed a check.
macro_rules! heap_assert {
    ($heap:expr, $cond:expr) => {
        heap_assert!($heap, $cond, stringify!($cond))
    };
    ($heap:expr, $cond:expr, $expression:expr) => {{
        let passed: bool = $cond;
        if !passed {
            $heap.report(assertion!($expression));
        }
        passed
    }};
}

/// Reports the broken precondition of a failed free tree or coalescing step
/// and evaluates to `Some(value)` on success.
macro_rules! heap_check {
    ($heap:expr, $result:expr) => {
        match $result {
            Ok(value) => Some(value),
            Err(expression) => {
                $heap.report(assertion!(expression));
                None
            }
        }
    };
}

/// Builds an [`HeapError::Assert`] for the current location.
macro_rules! assertion {
    ($expression:expr) => {
        $crate::error::HeapError::Assert {
            file: file!(),
            line: line!(),
            expression: $expression,
        }
    };
}

/// Longest guard band region a report can describe: padding up to the next
/// alignment boundary plus the band itself.
pub const CORRUPTION_MAP_CAPACITY: usize = 2 * GUARD_BAND_SIZE;

/// One flag per byte of a guard band region, set where the byte no longer
/// holds the guard band pattern.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CorruptionMap {
    bytes: [bool; CORRUPTION_MAP_CAPACITY],
    len: usize,
}

impl CorruptionMap {
    /// Compares every byte of `memory` against `expected`. Bytes past
    /// [`CORRUPTION_MAP_CAPACITY`] are not looked at.
    pub(crate) fn scan(memory: &[u8], expected: u8) -> Self {
        let len = memory.len().min(CORRUPTION_MAP_CAPACITY);
        let mut bytes = [false; CORRUPTION_MAP_CAPACITY];

        for (flag, &byte) in bytes.iter_mut().zip(&memory[..len]) {
            *flag = byte != expected;
        }

        Self { bytes, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.bytes[..self.len]
    }

    /// True when no byte was corrupted.
    pub fn is_clean(&self) -> bool {
        !self.as_slice().contains(&true)
    }

    /// Offsets of the corrupted bytes.
    pub fn corrupted(&self) -> impl Iterator<Item = usize> + '_ {
        self.as_slice().iter().enumerate().filter(|(_, corrupt)| **corrupt).map(|(index, _)| index)
    }
}

/// Prints the map as `X` for corrupted bytes and `.` for intact ones.
impl fmt::Display for CorruptionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &corrupt in self.as_slice() {
            f.write_str(if corrupt { "X" } else { "." })?;
        }
        Ok(())
    }
}

impl fmt::Debug for CorruptionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorruptionMap({self})")
    }
}

/// Failures the heap reports through [`crate::ExternalInterface::error`].
///
/// None of these travel through return values: the default handler prints the
/// error and terminates the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// An internal invariant did not hold, usually because heap metadata was
    /// overwritten or a pointer the heap never returned was passed in.
    #[error("{file}:{line}\n  assert failed: {expression}")]
    Assert {
        file: &'static str,
        line: u32,
        expression: &'static str,
    },

    /// Memory released with a function that does not match how it was
    /// allocated. The free is abandoned and the memory leaked.
    #[error(
        "mismatched allocation/free {memory:#x} {size}\n  alloc was {}, but free is {}",
        .allocation_flags.allocator_name(),
        .free_flags.release_name()
    )]
    MismatchedFree {
        memory: usize,
        size: usize,
        allocation_flags: Flags,
        free_flags: Flags,
    },

    /// Bytes around an allocation were overwritten. `pre` covers the band
    /// before the payload, `post` the padding and band after it.
    #[error(
        "guard band corruption {memory:#x} {size}\n  prefix byte map:\n    {pre}<alloc>\n  postfix byte map:\n    {post}<alloc>"
    )]
    GuardBandCorruption {
        memory: usize,
        size: usize,
        pre: CorruptionMap,
        post: CorruptionMap,
    },

    /// Freed memory was written to. `index` is the offset of the first
    /// corrupted byte from `memory`, the start of the free block payload.
    #[error("free memory corruption {memory:#x} {size}\n  at byte {index}")]
    FreeCorruption { memory: usize, size: usize, index: usize },

    /// The page source could not provide memory.
    #[error("out of memory requesting {size} bytes")]
    OutOfMemory { size: usize },
}
