//! Size and layout constants for the fragment cache.
//!
//! These values mirror the geometry of the underlying system: blocks are
//! multiples of the base page size, and the cache prefers one larger block
//! over many single pages so that neighbouring fragments share TLB entries
//! and the block allocator is called as rarely as possible.
//!
//! # Design Rationale
//!
//! The preferred block size balances two costs:
//! - Too small → a block allocator round-trip for every handful of fragments
//! - Too large → a failed compound allocation under memory pressure wastes
//!   time before the order-0 fallback kicks in
//!
//! 32 KiB (order 3 on a 4 KiB-page system) has proven a good middle ground
//! for high-rate producers of packet-sized buffers.

/// Size of the base page in bytes.
///
/// Blocks handed out by a [`BlockAllocator`](crate::BlockAllocator) are
/// always a power-of-two multiple of this size and naturally aligned to
/// their own length.
pub const PAGE_SIZE: usize = 4096;

/// Base-2 logarithm of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Preferred block size in bytes.
///
/// The cache first asks for a block of this size and only falls back to a
/// single page when the larger request cannot be satisfied cheaply.
pub const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// Order of the preferred block: `MAX_BLOCK_SIZE == PAGE_SIZE << MAX_BLOCK_ORDER`.
pub const MAX_BLOCK_ORDER: usize = (MAX_BLOCK_SIZE / PAGE_SIZE).trailing_zeros() as usize;

/// Initial contribution the cache makes to a block's reference counter.
///
/// Every fragment is at least one byte, so a block can never be split into
/// more than `MAX_BLOCK_SIZE` fragments. Charging the counter once with
/// this value up front lets each hand-out decrement only the cache-local
/// bias, keeping the shared atomic untouched on the hot path.
pub const MAX_BIAS: u32 = MAX_BLOCK_SIZE as u32;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(MAX_BLOCK_SIZE.is_power_of_two());
    assert!(MAX_BLOCK_SIZE >= PAGE_SIZE);
    assert!(MAX_BLOCK_SIZE == PAGE_SIZE << MAX_BLOCK_ORDER);
};
