//! System block allocator backed by anonymous mmap.
//!
//! This is the crate's production [`BlockAllocator`]: blocks are anonymous
//! private mappings, naturally aligned to their own size, tracked in a
//! registry so that any interior address can be resolved back to its block.
//!
//! # Design
//!
//! - **Natural alignment**: a block of `PAGE_SIZE << order` bytes is
//!   aligned to its full length. `mmap` only guarantees page alignment, so
//!   larger blocks over-map and trim the misaligned head and tail.
//! - **Watermark**: an optional byte limit makes the normal path fail
//!   deterministically under pressure, the way a real system runs out of
//!   free pages.
//! - **Emergency reserve**: a configurable number of single pages is
//!   mapped up front. When the normal path fails and the request permits
//!   it, a reserve page is handed out with the pfmemalloc bit set, and it
//!   returns to the reserve when freed.
//!
//! # Example
//!
//! ```rust
//! use pagefrag::{AllocFlags, BlockAllocator, SystemAllocator};
//!
//! let allocator = SystemAllocator::new().unwrap();
//! let block = allocator.alloc_block(0, AllocFlags::default()).unwrap();
//! assert_eq!(block.len(), 4096);
//!
//! // The allocator's reference is the only one; drop it.
//! assert!(block.put_and_test());
//! allocator.free_block(&block);
//! ```

use crate::allocator::BlockAllocator;
use crate::block::Block;
use crate::defaults::{MAX_BLOCK_ORDER, PAGE_SIZE};
use crate::error::Result;
use crate::flags::AllocFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Configuration for a [`SystemAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Byte budget for normally-allocated blocks. `None` means unlimited.
    ///
    /// Requests that would exceed the budget fail the normal path and may
    /// fall through to the emergency reserve.
    pub memory_limit: Option<usize>,
    /// Number of single pages mapped up front as the emergency reserve.
    pub reserve_pages: usize,
    /// Largest order the allocator will serve.
    ///
    /// Requests above this ceiling fail outright; compound blocks beyond
    /// it are considered too costly to assemble.
    pub max_order: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            reserve_pages: 0,
            max_order: MAX_BLOCK_ORDER,
        }
    }
}

/// Block allocator backed by anonymous private mappings.
///
/// Blocks allocated here stay mapped until their reference count reaches
/// zero and [`free_block`](BlockAllocator::free_block) runs, regardless of
/// which context drops the last reference.
pub struct SystemAllocator {
    /// Live blocks keyed by base address, for containing-block lookup.
    blocks: RwLock<BTreeMap<usize, Arc<Block>>>,
    /// Pre-mapped emergency pages.
    reserve: Mutex<Vec<NonNull<u8>>>,
    /// Bytes currently handed out through the normal path.
    in_use: AtomicUsize,
    memory_limit: Option<usize>,
    max_order: usize,
}

// SAFETY: the reserve holds raw pointers to mappings the allocator owns
// exclusively; the registry and counters are synchronised.
unsafe impl Send for SystemAllocator {}
unsafe impl Sync for SystemAllocator {}

impl SystemAllocator {
    /// Create an allocator with the default configuration (no limit, no
    /// reserve).
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(AllocatorConfig::default())
    }

    /// Create an allocator with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the emergency reserve cannot be mapped.
    pub fn with_config(config: AllocatorConfig) -> Result<Arc<Self>> {
        let mut reserve = Vec::with_capacity(config.reserve_pages);
        for _ in 0..config.reserve_pages {
            reserve.push(map_aligned(PAGE_SIZE)?);
        }

        Ok(Arc::new(Self {
            blocks: RwLock::new(BTreeMap::new()),
            reserve: Mutex::new(reserve),
            in_use: AtomicUsize::new(0),
            memory_limit: config.memory_limit,
            max_order: config.max_order,
        }))
    }

    /// Bytes currently handed out through the normal path.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of pages currently sitting in the emergency reserve.
    pub fn reserve_available(&self) -> usize {
        self.reserve.lock().unwrap().len()
    }

    /// Number of blocks currently outstanding.
    pub fn live_blocks(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    /// Charge `size` bytes against the watermark.
    fn try_charge(&self, size: usize) -> bool {
        let Some(limit) = self.memory_limit else {
            self.in_use.fetch_add(size, Ordering::Relaxed);
            return true;
        };

        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current + size > limit {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn uncharge(&self, size: usize) {
        let old = self.in_use.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "watermark accounting underflow");
    }

    /// Record a new block in the registry.
    fn register(&self, base: NonNull<u8>, order: usize, pfmemalloc: bool) -> Arc<Block> {
        let block = Arc::new(Block::new(base, order, pfmemalloc));
        let prev = self
            .blocks
            .write()
            .unwrap()
            .insert(base.as_ptr() as usize, Arc::clone(&block));
        debug_assert!(prev.is_none(), "overlapping block registration");
        block
    }
}

impl BlockAllocator for SystemAllocator {
    fn alloc_block(&self, order: usize, flags: AllocFlags) -> Option<Arc<Block>> {
        // Orders above the ceiling are too costly to assemble.
        if order > self.max_order {
            return None;
        }

        let size = PAGE_SIZE << order;
        if self.try_charge(size) {
            match map_aligned(size) {
                Ok(base) => return Some(self.register(base, order, false)),
                Err(err) => {
                    self.uncharge(size);
                    if !flags.contains(AllocFlags::NO_WARN) {
                        tracing::warn!(order, %err, "block mapping failed");
                    }
                }
            }
        }

        // Normal path failed. The emergency reserve holds single pages
        // only, and the request must permit drawing from it.
        if order == 0 && !flags.contains(AllocFlags::NO_MEMALLOC) {
            if let Some(base) = self.reserve.lock().unwrap().pop() {
                return Some(self.register(base, 0, true));
            }
        }

        if !flags.contains(AllocFlags::NO_WARN) {
            tracing::warn!(order, "block allocation failed");
        }
        None
    }

    fn free_block(&self, block: &Block) {
        debug_assert_eq!(block.ref_count(), 0, "freeing a block with live references");

        let base = block.base().as_ptr() as usize;
        let removed = self.blocks.write().unwrap().remove(&base);
        debug_assert!(removed.is_some(), "freeing a block unknown to this allocator");
        if removed.is_none() {
            return;
        }

        if block.is_pfmemalloc() {
            // Reserve pages replenish the reserve rather than returning
            // to the system.
            self.reserve.lock().unwrap().push(block.base());
        } else {
            self.uncharge(block.len());
            // SAFETY: the mapping was created by this allocator and its
            // reference count is zero, so no live fragment points into it.
            let _ = unsafe { rustix::mm::munmap(block.base().as_ptr().cast(), block.len()) };
        }
    }

    fn block_of(&self, addr: NonNull<u8>) -> Option<Arc<Block>> {
        let blocks = self.blocks.read().unwrap();
        let (_, block) = blocks.range(..=addr.as_ptr() as usize).next_back()?;
        block.contains(addr).then(|| Arc::clone(block))
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        // Blocks still registered at this point have leaked references;
        // their mappings go down with the allocator.
        let blocks = std::mem::take(self.blocks.get_mut().unwrap());
        for block in blocks.into_values() {
            // SAFETY: the allocator owns every registered mapping and is
            // being torn down.
            let _ = unsafe { rustix::mm::munmap(block.base().as_ptr().cast(), block.len()) };
        }

        for base in self.reserve.get_mut().unwrap().drain(..) {
            // SAFETY: reserve pages were mapped by this allocator and
            // never handed out (pages that were are in the registry).
            let _ = unsafe { rustix::mm::munmap(base.as_ptr().cast(), PAGE_SIZE) };
        }
    }
}

/// Map `size` bytes of anonymous memory aligned to `size`.
///
/// `mmap` only promises page alignment, so larger requests map a wider
/// span and unmap the misaligned head and tail.
fn map_aligned(size: usize) -> std::result::Result<NonNull<u8>, rustix::io::Errno> {
    debug_assert!(size.is_power_of_two() && size >= PAGE_SIZE);

    if size == PAGE_SIZE {
        // Page alignment is natural alignment here.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        return NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM);
    }

    // Worst-case misalignment of a page-aligned address is size - PAGE_SIZE.
    let span = size + size - PAGE_SIZE;
    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            span,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )?
    };

    let addr = ptr as usize;
    let aligned = (addr + size - 1) & !(size - 1);
    let head = aligned - addr;
    if head > 0 {
        // SAFETY: trimming the front of the span just mapped.
        unsafe { rustix::mm::munmap(addr as *mut _, head)? };
    }
    let tail = span - head - size;
    if tail > 0 {
        // SAFETY: trimming the back of the span just mapped.
        unsafe { rustix::mm::munmap((aligned + size) as *mut _, tail)? };
    }

    NonNull::new(aligned as *mut u8).ok_or(rustix::io::Errno::NOMEM)
}
