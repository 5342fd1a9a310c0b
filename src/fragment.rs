//! Fragments: sub-ranges of a block handed to callers.

use crate::block::Block;
use std::ptr::NonNull;
use std::sync::Arc;

/// A contiguous sub-range of a block, handed out by the fragment cache.
///
/// A fragment returned by [`prepare`](crate::FragCache::prepare) or
/// [`probe`](crate::FragCache::probe) is tentative: its `len()` is the
/// maximum contiguous space available at the aligned offset, and nothing
/// is consumed until the fragment is passed to
/// [`commit`](crate::FragCache::commit). Committing takes the fragment by
/// value, so a fragment cannot be committed twice.
///
/// The cache keeps no record of fragments it has handed out; the block
/// reference travels with the fragment.
pub struct Fragment {
    block: Arc<Block>,
    offset: usize,
    size: usize,
}

impl Fragment {
    pub(crate) fn new(block: Arc<Block>, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= block.len(), "fragment exceeds its block");
        Self {
            block,
            offset,
            size,
        }
    }

    /// The block this fragment lives in.
    #[inline]
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Byte offset of the fragment inside its block.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Contiguous bytes available from the fragment's offset.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if no space is available (which the cache never
    /// hands out).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Virtual address of the fragment: block base plus offset.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset is within the block (constructor invariant).
        unsafe { NonNull::new_unchecked(self.block.base().as_ptr().add(self.offset)) }
    }

    /// View the fragment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this range of the
    /// block for the lifetime of the slice.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the range is inside the block's mapping; exclusivity is
        // the caller's obligation.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr().as_ptr(), self.size) }
    }
}
