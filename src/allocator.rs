//! Block allocator trait.

use crate::block::Block;
use crate::flags::AllocFlags;
use std::ptr::NonNull;
use std::sync::Arc;

/// Trait for block allocator backends.
///
/// A block allocator supplies naturally-aligned, ref-counted blocks of
/// `PAGE_SIZE << order` bytes and can find the containing block for any
/// address inside a live block. The fragment cache consumes it as an
/// `Arc<dyn BlockAllocator>`, so fragments allocated in one context can be
/// released from another long after the cache has moved on to a new block.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Block memory stays mapped until the block's reference count reaches
///   zero and [`free_block`](Self::free_block) runs
/// - Blocks are aligned to their own size
/// - `block_of` resolves every address inside every live block
pub trait BlockAllocator: Send + Sync {
    /// Allocate a block of `PAGE_SIZE << order` bytes.
    ///
    /// The block arrives with a reference count of one, owned by the
    /// caller. The pfmemalloc bit is set when the block was drawn from an
    /// emergency reserve.
    ///
    /// Returns `None` when no block of the requested order can be
    /// supplied under the given flags.
    fn alloc_block(&self, order: usize, flags: AllocFlags) -> Option<Arc<Block>>;

    /// Release a block whose reference count has fallen to zero.
    fn free_block(&self, block: &Block);

    /// Find the live block containing `addr`.
    ///
    /// Returns `None` when the address does not point into any block this
    /// allocator currently has outstanding.
    fn block_of(&self, addr: NonNull<u8>) -> Option<Arc<Block>>;

    /// Free one fragment by address.
    ///
    /// Drops one reference from the containing block's counter and
    /// releases the block when the count reaches zero. Works for
    /// fragments out of blocks the allocating cache has long forgotten.
    ///
    /// An address outside any live block is a debug assertion; in release
    /// builds it is ignored.
    fn free_fragment(&self, addr: NonNull<u8>) {
        let Some(block) = self.block_of(addr) else {
            debug_assert!(false, "freeing a fragment from an unknown block");
            return;
        };
        if block.put_and_test() {
            self.free_block(&block);
        }
    }
}
