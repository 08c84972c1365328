bitflags::bitflags! {
    /// Flags describing where an allocation came from and how the heap should
    /// treat it.
    ///
    /// There are three groups of bits:
    ///
    /// ```text
    /// +-----------------------------+------------------------------+----------------+
    /// |         provenance          |           behavior           |   reporting    |
    /// | new / scalar / array /      | guard bands, fills and       | report alloc / |
    /// | malloc + malloc sub-kinds   | validation toggles           | report free    |
    /// +-----------------------------+------------------------------+----------------+
    /// ```
    ///
    /// Heap wide flags given at construction are combined (OR) with the flags
    /// of every call. Only the bits in [`Flags::PROVENANCE_CHECK`] are compared
    /// when a free call is matched against its allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Memory comes from a language level object allocation.
        const FROM_NEW              = 1 << 0;
        /// Single object.
        const SCALAR                = 1 << 1;
        /// Array of objects.
        const ARRAY                 = 1 << 2;
        /// Memory comes from the malloc family.
        const FROM_MALLOC           = 1 << 4;
        const MALLOC_ALIGNED        = 1 << 5;
        /// The payload is zeroed before it is handed out.
        const MALLOC_CALLOC         = 1 << 6;
        const MALLOC_VALLOC         = 1 << 7;

        /// Surround every payload with guard bands. Only honoured heap wide.
        const GUARD_BANDS           = 1 << 8;
        /// Write [`crate::GUARD_BAND_FILL`] into the guard bands.
        const FILL_GUARD_BANDS      = 1 << 9;
        /// Write [`crate::ALLOCATION_FILL`] over new payloads.
        const FILL_ALLOCATIONS      = 1 << 10;
        /// Write [`crate::FREE_FILL`] over released memory.
        const FILL_FREES            = 1 << 11;
        const VALIDATE_GUARD_BANDS  = 1 << 12;
        const VALIDATE_FREE         = 1 << 13;

        /// Emit an operation record when the memory is allocated.
        const REPORT_ALLOCATION     = 1 << 16;
        /// Emit an operation record when the memory is freed.
        const REPORT_FREE           = 1 << 17;

        const NEW_SCALAR            = Self::FROM_NEW.bits() | Self::SCALAR.bits();
        const NEW_ARRAY             = Self::FROM_NEW.bits() | Self::ARRAY.bits();
        const MALLOC                = Self::FROM_MALLOC.bits();
        const CALLOC                = Self::FROM_MALLOC.bits() | Self::MALLOC_CALLOC.bits();
        const ALIGNED               = Self::FROM_MALLOC.bits() | Self::MALLOC_ALIGNED.bits();
        const ALIGNED_CALLOC        = Self::ALIGNED.bits() | Self::MALLOC_CALLOC.bits();
        const ALIGNED_VALLOC        = Self::ALIGNED.bits() | Self::MALLOC_VALLOC.bits();

        /// Bits compared between an allocation and the call that frees it. The
        /// malloc sub-kinds are left out since `free` can't know about them.
        const PROVENANCE_CHECK      = Self::FROM_NEW.bits()
                                    | Self::SCALAR.bits()
                                    | Self::ARRAY.bits()
                                    | Self::FROM_MALLOC.bits();
        const PROVENANCE            = Self::PROVENANCE_CHECK.bits()
                                    | Self::MALLOC_ALIGNED.bits()
                                    | Self::MALLOC_CALLOC.bits()
                                    | Self::MALLOC_VALLOC.bits();

        const VALIDATE_EVERYTHING   = Self::VALIDATE_GUARD_BANDS.bits() | Self::VALIDATE_FREE.bits();
        const FILL_EVERYTHING       = Self::FILL_GUARD_BANDS.bits()
                                    | Self::FILL_ALLOCATIONS.bits()
                                    | Self::FILL_FREES.bits();

        const HEAP_DEBUG            = Self::GUARD_BANDS.bits()
                                    | Self::VALIDATE_GUARD_BANDS.bits()
                                    | Self::FILL_EVERYTHING.bits();
    }
}

impl Flags {
    /// No debugging aids at all.
    pub const HEAP_FAST: Flags = Flags::empty();

    /// The provenance bits that take part in free matching.
    #[inline]
    pub fn provenance(self) -> Flags {
        self & Flags::PROVENANCE_CHECK
    }

    /// Name of the allocating function these flags describe.
    pub fn allocator_name(self) -> &'static str {
        let provenance = self.provenance();
        if provenance == Flags::MALLOC {
            "malloc"
        } else if provenance == Flags::NEW_SCALAR {
            "new"
        } else if provenance == Flags::NEW_ARRAY {
            "new[]"
        } else {
            "invalid"
        }
    }

    /// Name of the releasing function these flags describe.
    pub fn release_name(self) -> &'static str {
        let provenance = self.provenance();
        if provenance == Flags::MALLOC {
            "free"
        } else if provenance == Flags::NEW_SCALAR {
            "delete"
        } else if provenance == Flags::NEW_ARRAY {
            "delete[]"
        } else {
            "invalid"
        }
    }
}
