//! # pagefrag
//!
//! A page-fragment cache allocator: a thin, per-context sub-allocator that
//! carves many small, variable-length byte ranges out of one ref-counted
//! block at a time.
//!
//! High-rate producers of small buffers — packet headers, receive and
//! transmit scratch regions — cannot afford a full allocator round-trip
//! per buffer, nor an atomic reference-count update per hand-out. The
//! fragment cache amortises both: one block allocation serves thousands
//! of fragments, and the block's shared counter is charged once up front
//! so each hand-out only decrements a cache-local bias.
//!
//! ## Features
//!
//! - **Bump allocation**: a fragment is an offset bump inside the current
//!   block, no bookkeeping per fragment
//! - **Batched refcounting**: at most two atomic operations per block
//!   lifetime in the cache, regardless of fragment count
//! - **Prepare/commit protocol**: discover the maximum contiguous space
//!   before committing to a size, probe without side effects, abort on
//!   error paths
//! - **Cross-context free**: allocate in one context, release in another;
//!   the block survives as long as any fragment does
//! - **Emergency-reserve awareness**: blocks drawn from reserves carry a
//!   pfmemalloc bit and are never recycled in place
//!
//! ## Quick Start
//!
//! ```rust
//! use pagefrag::prelude::*;
//!
//! let allocator = SystemAllocator::new().unwrap();
//! let mut cache = FragCache::new(allocator.clone());
//!
//! // The dominant path: size in, address out.
//! let va = cache.alloc(1500, AllocFlags::default()).unwrap();
//!
//! // Discover available space before choosing a size.
//! let fragment = cache.prepare(64, AllocFlags::default(), !0).unwrap();
//! let take = fragment.len().min(256);
//! cache.commit(fragment, take);
//!
//! // Fragments outlive the cache's interest in their block.
//! allocator.free_fragment(va);
//! ```
//!
//! One cache belongs to one context: all mutating operations take
//! `&mut self` and the cache has no internal locking. Pin it per thread,
//! or wrap it in the lock of your choice.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod block;
pub mod cache;
pub mod defaults;
mod encoded;
pub mod error;
pub mod flags;
pub mod fragment;
pub mod system;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::BlockAllocator;
    pub use crate::block::Block;
    pub use crate::cache::FragCache;
    pub use crate::error::{Error, Result};
    pub use crate::flags::AllocFlags;
    pub use crate::fragment::Fragment;
    pub use crate::system::{AllocatorConfig, SystemAllocator};
}

pub use allocator::BlockAllocator;
pub use block::Block;
pub use cache::FragCache;
pub use defaults::{MAX_BIAS, MAX_BLOCK_ORDER, MAX_BLOCK_SIZE, PAGE_SIZE};
pub use error::{Error, Result};
pub use flags::AllocFlags;
pub use fragment::Fragment;
pub use system::{AllocatorConfig, SystemAllocator};
