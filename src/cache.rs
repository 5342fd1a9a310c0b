//! The page-fragment cache.
//!
//! A [`FragCache`] carves many small, variable-length, variable-alignment
//! byte ranges out of one block at a time by bumping an offset. What makes
//! it cheap is the reference-count bias: acquiring a block charges its
//! shared counter once with [`MAX_BIAS`], and every hand-out afterwards
//! decrements only the cache-local `bias`. The shared atomic is touched
//! again only when the block is exhausted or the cache is drained, when
//! the remaining bias is collapsed into it with a single subtract.
//!
//! # Block lifecycle
//!
//! ```text
//! (fresh)   offset = 0, bias = MAX_BIAS + 1
//!    │ commit
//!    ▼
//! (in-use)  offset > 0, bias < MAX_BIAS + 1
//!    │ exhausted at next request
//!    ▼
//!  collapse: counter -= bias
//!    │                         │
//!    │ reached zero            │ survivors remain
//!    ▼                         ▼
//! (recyclable)             (forgotten → refill)
//!    │ pfmemalloc?
//!    ▼ no            ▼ yes
//! (fresh again)   (released → refill)
//! ```
//!
//! A collapse that reaches zero proves no fragment reference survives, so
//! the block can be reset and reused in place without ever returning to
//! the block allocator. Blocks from the emergency reserve are the
//! exception: they are released on exhaustion so the reserve replenishes.
//!
//! # Concurrency
//!
//! One cache belongs to one context. All mutating operations take
//! `&mut self`; there is no internal locking, and adding any would defeat
//! the design. Fragments themselves may be released from any context via
//! [`BlockAllocator::free_fragment`].
//!
//! # Example
//!
//! ```rust
//! use pagefrag::{AllocFlags, BlockAllocator, FragCache, SystemAllocator};
//!
//! let allocator = SystemAllocator::new().unwrap();
//! let mut cache = FragCache::new(allocator.clone());
//!
//! // The dominant path: size in, address out.
//! let va = cache.alloc(128, AllocFlags::default()).unwrap();
//!
//! // Possibly much later, from another context:
//! allocator.free_fragment(va);
//! ```

use crate::allocator::BlockAllocator;
use crate::block::Block;
use crate::defaults::{MAX_BIAS, MAX_BLOCK_ORDER, PAGE_SIZE};
use crate::encoded::EncodedBlock;
use crate::error::{Error, Result};
use crate::flags::AllocFlags;
use crate::fragment::Fragment;
use std::ptr::NonNull;
use std::sync::{Arc, Once};

/// Align `offset` upwards per `align_mask`.
///
/// The mask convention is `!(align - 1)`: all-ones means no alignment.
#[inline]
fn align_up(offset: usize, align_mask: usize) -> usize {
    offset.wrapping_add(!align_mask) & align_mask
}

/// An oversized request is a caller bug, but not worth more than one
/// line of log per process.
fn warn_too_large(fragsz: usize) {
    static WARNED: Once = Once::new();
    WARNED.call_once(|| {
        tracing::warn!(
            fragsz,
            page_size = PAGE_SIZE,
            "fragment larger than a page can never be allocated"
        );
    });
}

/// Per-context cache slicing fragments out of ref-counted blocks.
///
/// Created empty; the first allocation refills it from the block
/// allocator. Dropping the cache drains it, releasing its reference to
/// the current block.
pub struct FragCache {
    /// Where blocks come from and where fragments are eventually freed.
    allocator: Arc<dyn BlockAllocator>,
    /// The current block, packed; `None` when the cache is empty.
    encoded: Option<EncodedBlock>,
    /// Byte offset of the next fragment inside the current block.
    offset: usize,
    /// References the cache still owes to the block's shared counter.
    bias: u32,
}

impl FragCache {
    /// Create an empty cache on top of a block allocator.
    pub fn new(allocator: Arc<dyn BlockAllocator>) -> Self {
        Self {
            allocator,
            encoded: None,
            offset: 0,
            bias: 0,
        }
    }

    /// The allocator this cache draws blocks from.
    ///
    /// Fragments are freed through it, from whichever context holds them.
    #[inline]
    pub fn allocator(&self) -> &Arc<dyn BlockAllocator> {
        &self.allocator
    }

    /// Whether the current block was drawn from the emergency reserve.
    ///
    /// Callers use this to mark data placed in such a block as
    /// unsuitable for non-emergency paths.
    #[inline]
    pub fn is_pfmemalloc(&self) -> bool {
        self.encoded.is_some_and(|encoded| encoded.is_pfmemalloc())
    }

    /// Ensure `fragsz` bytes are available at the current aligned offset,
    /// refilling from the allocator if the current block is exhausted.
    ///
    /// The returned fragment is tentative: its `len()` is the whole
    /// contiguous space up to the end of the block, so the caller may
    /// decide to use more than it asked for. Nothing is consumed until
    /// [`commit`](Self::commit).
    ///
    /// `align_mask` is `!(align - 1)` for a power-of-two `align` no
    /// larger than [`PAGE_SIZE`]; `!0` means no alignment.
    ///
    /// # Errors
    ///
    /// [`Error::TooLarge`] when `fragsz` exceeds [`PAGE_SIZE`] and the
    /// current block cannot serve it (the cache is left unmodified);
    /// [`Error::OutOfMemory`] when the allocator cannot supply a block
    /// (the cache is left empty).
    pub fn prepare(
        &mut self,
        fragsz: usize,
        flags: AllocFlags,
        align_mask: usize,
    ) -> Result<Fragment> {
        if let Some(encoded) = self.encoded {
            let size = encoded.block_size();
            let offset = align_up(self.offset, align_mask);
            if fragsz <= size && offset <= size - fragsz {
                // The current block still fits the request.
                let block = self.current_block(encoded);
                return Ok(Fragment::new(block, offset, size - offset));
            }

            // Nothing larger than a page is ever served by a refill;
            // fail before touching the block so the cache stays intact.
            if fragsz > PAGE_SIZE {
                warn_too_large(fragsz);
                return Err(Error::TooLarge {
                    requested: fragsz,
                    max: PAGE_SIZE,
                });
            }

            // The block is exhausted. Collapse the bias into the shared
            // counter to learn whether any fragment reference survives.
            let block = self.current_block(encoded);
            if block.ref_sub_and_test(self.bias) {
                if encoded.is_pfmemalloc() {
                    // Reserve memory must return promptly; never
                    // recycle it in place.
                    self.allocator.free_block(&block);
                } else {
                    // Count is zero, so no observer can race with the
                    // store: recycle the block in place.
                    block.ref_set(MAX_BIAS + 1);
                    self.bias = MAX_BIAS + 1;
                    self.offset = 0;
                    return Ok(Fragment::new(block, 0, size));
                }
            }
            // Survivors now own the old block; they free it fragment by
            // fragment.
        } else if fragsz > PAGE_SIZE {
            warn_too_large(fragsz);
            return Err(Error::TooLarge {
                requested: fragsz,
                max: PAGE_SIZE,
            });
        }

        let (encoded, block) = self.refill(flags).ok_or(Error::OutOfMemory)?;
        // The fresh block arrived holding one reference; charge the rest
        // of the bias with a single atomic add.
        block.ref_add(MAX_BIAS);
        self.bias = MAX_BIAS + 1;
        self.offset = 0;
        Ok(Fragment::new(block, 0, encoded.block_size()))
    }

    /// Non-refilling variant of [`prepare`](Self::prepare).
    ///
    /// Returns a fragment iff the current block already satisfies the
    /// request; never calls the block allocator. Used to decide whether
    /// a would-be new fragment can be merged with the preceding one.
    pub fn probe(&self, fragsz: usize, align_mask: usize) -> Option<Fragment> {
        let encoded = self.encoded?;
        let size = encoded.block_size();
        let offset = align_up(self.offset, align_mask);
        if fragsz > size || offset > size - fragsz {
            return None;
        }
        Some(Fragment::new(self.current_block(encoded), offset, size - offset))
    }

    /// Consume `used` bytes of a prepared fragment and take one fragment
    /// reference.
    ///
    /// Returns the true bytes consumed, including any alignment padding
    /// in front of the fragment, so batching callers account the same
    /// number the cache did.
    pub fn commit(&mut self, fragment: Fragment, used: usize) -> usize {
        debug_assert!(self.bias > 0, "commit on an empty cache");
        self.bias -= 1;
        self.commit_inner(fragment, used)
    }

    /// [`commit`](Self::commit) without taking a fragment reference.
    ///
    /// For callers coalescing the new range into a previously committed
    /// fragment that already holds a reference.
    pub fn commit_noref(&mut self, fragment: Fragment, used: usize) -> usize {
        self.commit_inner(fragment, used)
    }

    fn commit_inner(&mut self, fragment: Fragment, used: usize) -> usize {
        debug_assert!(used <= fragment.len(), "commit of more than was prepared");
        debug_assert!(
            self.encoded
                .is_some_and(|encoded| encoded.virt() == fragment.block().base()),
            "commit of a fragment from another block"
        );
        // The fragment can only sit ahead of the cache offset, by the
        // alignment padding prepare inserted.
        debug_assert!(self.offset <= fragment.offset(), "commit of a stale fragment");

        let consumed = fragment.offset() + used - self.offset;
        self.offset = fragment.offset() + used;
        consumed
    }

    /// Undo the most recent commit of exactly `fragsz` bytes.
    ///
    /// Valid only while no reference to that fragment has been handed
    /// onwards; otherwise use [`abort_ref`](Self::abort_ref).
    ///
    /// `abort(0)` is a complete no-op, so a prepare that was abandoned
    /// without committing can be unwound unconditionally.
    pub fn abort(&mut self, fragsz: usize) {
        if fragsz == 0 {
            return;
        }
        debug_assert!(self.encoded.is_some(), "abort on an empty cache");
        debug_assert!(fragsz <= self.offset, "abort of more than was committed");
        self.offset -= fragsz;
        self.bias += 1;
    }

    /// Return the fragment reference taken by the most recent commit of
    /// `fragsz` bytes, leaving the bytes consumed.
    ///
    /// For error paths where the fragment's memory has already been
    /// exposed but its reference was never handed onwards: cheaper than
    /// a full [`free_fragment`](BlockAllocator::free_fragment) because
    /// the shared counter is untouched.
    pub fn abort_ref(&mut self, fragsz: usize) {
        debug_assert!(self.encoded.is_some(), "abort on an empty cache");
        debug_assert!(fragsz <= self.offset, "abort of more than was committed");
        self.bias += 1;
    }

    /// Allocate a fragment and return its address: prepare plus commit
    /// in one call. The dominant caller path.
    ///
    /// # Errors
    ///
    /// Same as [`prepare`](Self::prepare).
    pub fn alloc(&mut self, fragsz: usize, flags: AllocFlags) -> Result<NonNull<u8>> {
        self.alloc_with_mask(fragsz, flags, !0)
    }

    /// [`alloc`](Self::alloc) with an alignment requirement.
    ///
    /// `align` must be a power of two no larger than [`PAGE_SIZE`];
    /// larger alignments cannot be honoured inside one block.
    pub fn alloc_aligned(
        &mut self,
        fragsz: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        debug_assert!(align <= PAGE_SIZE, "alignment beyond a page cannot be honoured");
        self.alloc_with_mask(fragsz, flags, align.wrapping_neg())
    }

    fn alloc_with_mask(
        &mut self,
        fragsz: usize,
        flags: AllocFlags,
        align_mask: usize,
    ) -> Result<NonNull<u8>> {
        let fragment = self.prepare(fragsz, flags, align_mask)?;
        let va = fragment.as_ptr();
        self.commit(fragment, fragsz);
        Ok(va)
    }

    /// Release the cache's reference to the current block and empty the
    /// cache. Idempotent.
    ///
    /// Fragments already handed out survive; their holders free them
    /// individually through the allocator.
    pub fn drain(&mut self) {
        let Some(encoded) = self.encoded.take() else {
            return;
        };

        let block = self.current_block(encoded);
        debug_assert!(block.ref_count() != 0, "draining a block with no references");
        if block.ref_sub_and_test(self.bias) {
            self.allocator.free_block(&block);
        }
        self.offset = 0;
        self.bias = 0;
    }

    /// Install a fresh block, preferring the large order.
    fn refill(&mut self, flags: AllocFlags) -> Option<(EncodedBlock, Arc<Block>)> {
        // The large block is an optimisation; its failure must be cheap.
        let mut order = MAX_BLOCK_ORDER;
        let mut block = if MAX_BLOCK_ORDER > 0 {
            self.allocator
                .alloc_block(MAX_BLOCK_ORDER, flags.for_large_block())
        } else {
            None
        };
        if block.is_none() {
            // Fall back to a single page with the caller's own flags.
            block = self.allocator.alloc_block(0, flags);
            order = 0;
        }

        match block {
            Some(block) => {
                let encoded = EncodedBlock::new(block.base(), order, block.is_pfmemalloc());
                self.encoded = Some(encoded);
                Some((encoded, block))
            }
            None => {
                self.encoded = None;
                self.offset = 0;
                self.bias = 0;
                None
            }
        }
    }

    /// Resolve the current block from its encoded word.
    fn current_block(&self, encoded: EncodedBlock) -> Arc<Block> {
        self.allocator
            .block_of(encoded.virt())
            .expect("cached block missing from its allocator")
    }
}

impl Drop for FragCache {
    fn drop(&mut self) {
        self.drain();
    }
}
