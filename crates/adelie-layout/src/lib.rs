//! Guest address-space layout.
//!
//! The guest sees a flat 32-bit address window `[0, 2^31)`. The upper region
//! `[0x7000_0000, 0x7200_0000)` is reserved for the compatibility layer's own
//! mutable state (translator block pool, code cache); guest allocations are
//! placed in `[0x0400_0000, 0x7000_0000)`.
//!
//! Pages (4 KiB) are the unit of protection; blocks (64 KiB) are the unit of
//! host allocation. Every mapped page lies inside exactly one host-allocated
//! block.

/// Unit of guest protection.
pub const PAGE_SIZE: u32 = 0x1000;
/// Unit of host allocation (one section object backs one block).
pub const BLOCK_SIZE: u32 = 0x1_0000;
/// Pages per host allocation block.
pub const PAGES_PER_BLOCK: u32 = BLOCK_SIZE / PAGE_SIZE;

/// Number of pages in the 4 GiB window (indexable by page number).
pub const PAGE_COUNT: usize = 0x10_0000;
/// Number of blocks in the 4 GiB window (indexable by block number).
pub const BLOCK_COUNT: usize = 0x1_0000;

/// Lower bound of the guest virtual address space.
pub const ADDRESS_SPACE_LOW: u32 = 0x0000_0000;
/// Upper bound (exclusive) of the guest virtual address space.
pub const ADDRESS_SPACE_HIGH: u32 = 0x8000_0000;

/// Lowest address handed out by a non-fixed allocation search.
pub const ADDRESS_ALLOCATION_LOW: u32 = 0x0400_0000;
/// Highest address (exclusive) handed out by a non-fixed allocation search.
pub const ADDRESS_ALLOCATION_HIGH: u32 = 0x7000_0000;

/// Lower bound of the internal heap window used by `MAP_HEAP` allocations,
/// below [`ADDRESS_ALLOCATION_LOW`] and clear of the host's low mappings.
pub const HEAP_BASE: u32 = 0x0020_0000;

/// Start of the region reserved for the compatibility layer itself.
pub const KERNEL_DATA_BASE: u32 = 0x7000_0000;
/// End (exclusive) of the reserved region.
pub const KERNEL_DATA_END: u32 = 0x7200_0000;

/// Canonical placement of the translator's code cache.
pub const DBT_CACHE_BASE: u32 = 0x7100_0000;
/// Default code cache capacity.
pub const DBT_CACHE_SIZE: u32 = 0x0080_0000;
/// Default capacity of the translated-block descriptor pool.
pub const DBT_MAX_BLOCKS: usize = 0x2_0000;

/// Page number containing `addr`.
#[inline]
pub const fn page_of(addr: u32) -> u32 {
    addr / PAGE_SIZE
}

/// Block number containing `addr`.
#[inline]
pub const fn block_of(addr: u32) -> u32 {
    addr / BLOCK_SIZE
}

/// First address of page `page`.
#[inline]
pub const fn page_address(page: u32) -> u32 {
    page * PAGE_SIZE
}

/// First address of block `block`.
#[inline]
pub const fn block_address(block: u32) -> u32 {
    block * BLOCK_SIZE
}

/// Block number containing page `page`.
#[inline]
pub const fn block_of_page(page: u32) -> u32 {
    page / PAGES_PER_BLOCK
}

/// First page of block `block`.
#[inline]
pub const fn first_page_of_block(block: u32) -> u32 {
    block * PAGES_PER_BLOCK
}

/// Index of `page` within its block.
#[inline]
pub const fn page_in_block(page: u32) -> u32 {
    page % PAGES_PER_BLOCK
}

/// Round `len` up to a whole number of pages.
///
/// Takes and returns `u64` so that lengths close to 4 GiB do not wrap; the
/// callers validate the result against [`ADDRESS_SPACE_HIGH`].
#[inline]
pub const fn align_to_page(len: u64) -> u64 {
    (len + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Whether `addr` is page-aligned.
#[inline]
pub const fn is_page_aligned(addr: u32) -> bool {
    addr % PAGE_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_block_arithmetic() {
        assert_eq!(PAGES_PER_BLOCK, 16);
        assert_eq!(page_of(0x1234_5678), 0x1_2345);
        assert_eq!(block_of(0x1234_5678), 0x1234);
        assert_eq!(block_of_page(page_of(0x1234_5678)), 0x1234);
        assert_eq!(first_page_of_block(0x1234), 0x1_2340);
        assert_eq!(page_in_block(0x1_2345), 5);
        assert_eq!(page_address(0x1_2345), 0x1234_5000);
        assert_eq!(block_address(0x1234), 0x1234_0000);
    }

    #[test]
    fn align_to_page_does_not_wrap() {
        assert_eq!(align_to_page(0), 0);
        assert_eq!(align_to_page(1), 0x1000);
        assert_eq!(align_to_page(0x1000), 0x1000);
        assert_eq!(align_to_page(0xFFFF_F001), 0x1_0000_0000);
    }

    #[test]
    fn reserved_window_contains_cache() {
        assert!(DBT_CACHE_BASE >= KERNEL_DATA_BASE);
        assert!(DBT_CACHE_BASE + DBT_CACHE_SIZE <= KERNEL_DATA_END);
    }
}
