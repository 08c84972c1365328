use std::{
    fmt,
    mem,
    ptr::{self, NonNull},
};

use static_assertions::const_assert;

use crate::flags::Flags;

/// Alignment of every header and every payload handed out by the heap.
pub const ALIGNMENT: usize = 64;

/// Every block header occupies exactly this many bytes, whatever its status.
pub const HEADER_SIZE: usize = ALIGNMENT;

/// A free block is only split when the leftover can hold a header plus at
/// least one header worth of payload.
pub(crate) const SPLIT_SIZE: usize = HEADER_SIZE * 2;

/// Size of each guard band when [`Flags::GUARD_BANDS`] is enabled heap wide.
pub const GUARD_BAND_SIZE: usize = 64;

pub const GUARD_BAND_FILL: u8 = 0xab;
pub const ALLOCATION_FILL: u8 = 0xcd;
pub const FREE_FILL: u8 = 0xef;

/// `3HPB` in big endian.
pub(crate) const MARKER: u32 = u32::from_be_bytes(*b"3HPB");

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(GUARD_BAND_SIZE % ALIGNMENT == 0);
const_assert!(mem::size_of::<Block>() <= HEADER_SIZE);
const_assert!(mem::align_of::<Block>() <= ALIGNMENT);

/// Non-null pointer to a [`Block`] header.
pub(crate) type Link = Option<NonNull<Block>>;

/// Address of a header, used for address order comparisons.
#[inline]
pub(crate) fn address<T>(ptr: NonNull<T>) -> usize {
    ptr.as_ptr().addr()
}

/// Opaque identity of whoever owns an allocation, usually a call site address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Owner(pub usize);

impl Owner {
    pub const NONE: Owner = Owner(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Owner(ptr.addr())
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// Transient state while a block changes role.
    Unknown = 0,
    Free = 1,
    Allocated = 2,
    Sentinel = 3,
}

impl BlockStatus {
    /// Decodes a status read back from memory the client may have scribbled on.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Free),
            2 => Some(Self::Allocated),
            3 => Some(Self::Sentinel),
            _ => None,
        }
    }
}

/// Links of a free block inside the [`crate::freelist::FreeTree`].
///
/// For a member of an `equal` chain, `parent` points at its predecessor in
/// the chain (the tree node itself for the chain head).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeLinks {
    pub less: Link,
    pub equal: Link,
    pub greater: Link,
    pub parent: Link,
}

impl TreeLinks {
    /// True when the block is not linked into the tree at all.
    pub fn is_detached(&self) -> bool {
        self.less.is_none() && self.equal.is_none() && self.greater.is_none() && self.parent.is_none()
    }
}

/// What an allocated block remembers about the request that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    /// Requested payload size, not the block size.
    pub size: usize,
    pub owner: Owner,
    pub flags: Flags,
    pub alignment: u32,
}

/// The part of the header whose meaning depends on the block status.
#[repr(C)]
#[derive(Clone, Copy)]
union Body {
    links: TreeLinks,
    allocation: Allocation,
}

/// Header placed in front of every span of heap memory.
///
/// ```text
/// +---------------------+ <------+
/// | marker | status |fx |        |
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+        |
/// |      previous       |        | -> Header (HEADER_SIZE bytes)
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+        |
/// | tree links (free)   |        |
/// |   or allocation     |        |
/// +---------------------+ <------+
/// |     guard band      |        |
/// +---------------------+        |
/// |       payload       |        | -> size - HEADER_SIZE bytes
/// +---------------------+        |
/// | padding, guard band |        |
/// +---------------------+ <------+ next header
/// ```
///
/// `previous` and `next` link all the blocks of one system allocation in
/// address order, so `next == self + size` for every block except the fixed
/// nodes, which only take one header of memory whatever their size says.
///
/// Headers live in memory the client may corrupt, so the status is stored raw
/// and decoded with [`BlockStatus::from_raw`], and both body views are plain
/// data for which any bit pattern is valid.
#[repr(C)]
pub(crate) struct Block {
    marker: u32,
    status: u16,
    fixed: u16,
    /// Span of the block in bytes: header, payload, padding and guard bands.
    pub size: usize,
    pub previous: Link,
    pub next: Link,
    body: Body,
}

impl Block {
    pub fn new(status: BlockStatus, size: usize) -> Self {
        Self {
            marker: MARKER,
            status: status as u16,
            fixed: 0,
            size,
            previous: None,
            next: None,
            body: Body {
                links: TreeLinks::default(),
            },
        }
    }

    /// A permanent free node used as a pivot of the free tree.
    pub fn fixed(size: usize) -> Self {
        Self {
            fixed: 1,
            ..Self::new(BlockStatus::Free, size)
        }
    }

    /// Writes `block` at `addr` and returns the new header.
    ///
    /// **SAFETY**: `addr` must be valid for writes of [`HEADER_SIZE`] bytes and
    /// aligned to [`ALIGNMENT`].
    pub unsafe fn write(addr: NonNull<u8>, block: Block) -> NonNull<Block> {
        let header = addr.cast::<Block>();
        unsafe { header.as_ptr().write(block) };
        header
    }

    #[inline]
    pub fn has_marker(&self) -> bool {
        self.marker == MARKER
    }

    #[inline]
    pub fn status(&self) -> Option<BlockStatus> {
        BlockStatus::from_raw(self.status)
    }

    #[inline]
    pub fn is(&self, status: BlockStatus) -> bool {
        self.status == status as u16
    }

    #[inline]
    pub fn set_status(&mut self, status: BlockStatus) {
        self.status = status as u16;
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.fixed != 0
    }

    /// Bytes of memory actually covered by this header.
    #[inline]
    pub fn footprint(&self) -> usize {
        if self.is_fixed() { HEADER_SIZE } else { self.size }
    }

    #[inline]
    pub fn links(&self) -> &TreeLinks {
        // SAFETY: both views are plain data and every bit pattern is valid.
        unsafe { &self.body.links }
    }

    #[inline]
    pub fn links_mut(&mut self) -> &mut TreeLinks {
        // SAFETY: see `links`.
        unsafe { &mut self.body.links }
    }

    #[inline]
    pub fn allocation(&self) -> &Allocation {
        // SAFETY: see `links`.
        unsafe { &self.body.allocation }
    }

    #[inline]
    pub fn allocation_mut(&mut self) -> &mut Allocation {
        // SAFETY: see `links`.
        unsafe { &mut self.body.allocation }
    }

    /// First byte after the header.
    ///
    /// **SAFETY**: `block` must be a header inside a system allocation, so that
    /// at least [`HEADER_SIZE`] more bytes of the same span follow it.
    #[inline]
    pub unsafe fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Wipes the header of a block that has been absorbed by a neighbour.
    ///
    /// With `fill` the header becomes part of the free pattern of the block
    /// that absorbed it, otherwise it is zeroed.
    ///
    /// **SAFETY**: `block` must point to a header that is no longer linked
    /// anywhere.
    pub unsafe fn destroy(block: NonNull<Block>, fill: bool) {
        let byte = if fill { FREE_FILL } else { 0 };
        unsafe { ptr::write_bytes(block.cast::<u8>().as_ptr(), byte, HEADER_SIZE) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Slot([u8; HEADER_SIZE]);

    #[test]
    fn header_fits_in_one_alignment_unit() {
        assert!(mem::size_of::<Block>() <= HEADER_SIZE);
        assert_eq!(mem::size_of::<Allocation>() % mem::align_of::<usize>(), 0);
        assert!(mem::size_of::<Allocation>() <= mem::size_of::<TreeLinks>());
    }

    #[test]
    fn status_is_decoded_from_raw_memory() {
        assert_eq!(BlockStatus::from_raw(1), Some(BlockStatus::Free));
        assert_eq!(BlockStatus::from_raw(3), Some(BlockStatus::Sentinel));
        assert_eq!(BlockStatus::from_raw(0xefef), None);

        let block = Block::new(BlockStatus::Allocated, 256);
        assert!(block.has_marker());
        assert!(block.is(BlockStatus::Allocated));
        assert_eq!(block.status(), Some(BlockStatus::Allocated));
        assert_eq!(block.footprint(), 256);
        assert!(block.links().is_detached());
    }

    #[test]
    fn fixed_nodes_cover_a_single_header() {
        let block = Block::fixed(32 * 1024);
        assert!(block.is_fixed());
        assert!(block.is(BlockStatus::Free));
        assert_eq!(block.size, 32 * 1024);
        assert_eq!(block.footprint(), HEADER_SIZE);
    }

    #[test]
    fn allocation_view_leaves_parent_link_untouched() {
        let mut slots = [Slot([0; HEADER_SIZE]), Slot([0; HEADER_SIZE])];
        let other = NonNull::from(&mut slots[1]).cast::<Block>();

        let mut block = Block::new(BlockStatus::Free, 128);
        block.links_mut().parent = Some(other);
        block.set_status(BlockStatus::Allocated);
        *block.allocation_mut() = Allocation {
            size: 10,
            owner: Owner(0x1234),
            flags: Flags::MALLOC,
            alignment: 0,
        };

        assert_eq!(block.allocation().size, 10);
        assert_eq!(block.allocation().owner, Owner(0x1234));
        assert_eq!(block.links().parent, Some(other));
    }

    #[test]
    fn destroyed_headers_lose_their_marker() {
        let mut slot = Slot([0; HEADER_SIZE]);
        let addr = NonNull::from(&mut slot).cast::<u8>();

        unsafe {
            let block = Block::write(addr, Block::new(BlockStatus::Free, 128));
            assert!(block.as_ref().has_marker());

            Block::destroy(block, true);
            assert!(!block.as_ref().has_marker());
            assert_eq!(block.as_ref().status(), None);

            Block::destroy(block, false);
            assert_eq!(block.as_ref().status(), Some(BlockStatus::Unknown));
            assert_eq!(block.as_ref().size, 0);
        }

        assert!(slot.0.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn owner_prints_as_hex() {
        assert_eq!(Owner(255).to_string(), "0xff");
        assert_eq!(Owner::from_ptr(ptr::null::<u8>()), Owner::NONE);
    }
}
