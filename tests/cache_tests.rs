//! Integration tests for the fragment-cache protocol.
//!
//! These exercise the caller-facing prepare/commit/probe/abort surface
//! end to end against the system allocator, checking the offsets,
//! alignment and reference counts a consumer would observe.

use pagefrag::{
    AllocFlags, BlockAllocator, FragCache, SystemAllocator, MAX_BIAS, MAX_BLOCK_SIZE, PAGE_SIZE,
};

// ============================================================================
// Basic Allocation
// ============================================================================

/// A fresh cache serves an aligned fragment and charges the block's
/// counter exactly once.
#[test]
fn test_fresh_alloc() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    let va = cache.alloc_aligned(100, 4, AllocFlags::default()).unwrap();
    assert_eq!(va.as_ptr() as usize % 4, 0);

    let block = allocator.block_of(va).unwrap();
    assert_eq!(block.len(), MAX_BLOCK_SIZE);
    assert_eq!(block.ref_count(), MAX_BIAS + 1);

    // The next fragment starts right after the first.
    let next = cache.probe(1, !0).unwrap();
    assert_eq!(next.offset(), 100);
}

/// Fragments are written through and read back independently.
#[test]
fn test_fragments_do_not_overlap() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    let mut vas = Vec::new();
    for fill in 0..16u8 {
        let va = cache.alloc(64, AllocFlags::default()).unwrap();
        unsafe { std::ptr::write_bytes(va.as_ptr(), fill, 64) };
        vas.push(va);
    }

    for (fill, va) in vas.iter().enumerate() {
        let slice = unsafe { std::slice::from_raw_parts(va.as_ptr(), 64) };
        assert!(slice.iter().all(|&b| b == fill as u8));
    }

    for va in vas {
        allocator.free_fragment(va);
    }
}

/// Alignment requests are honoured for every power of two up to a page.
#[test]
fn test_alignment_honoured() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator);

    for shift in 0..=12 {
        let align = 1usize << shift;
        let va = cache.alloc_aligned(13, align, AllocFlags::default()).unwrap();
        assert_eq!(va.as_ptr() as usize % align, 0, "align {align}");
    }
}

/// An all-ones alignment mask means no alignment at all.
#[test]
fn test_noop_alignment_mask() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator);

    cache.alloc(13, AllocFlags::default()).unwrap();
    let fragment = cache.prepare(1, AllocFlags::default(), !0).unwrap();
    assert_eq!(fragment.offset(), 13);
}

// ============================================================================
// Boundaries
// ============================================================================

/// Exactly one page fits a fresh order-0 block; one byte more never does.
#[test]
fn test_page_sized_fragment_boundary() {
    let order0 = SystemAllocator::with_config(pagefrag::AllocatorConfig {
        max_order: 0,
        ..pagefrag::AllocatorConfig::default()
    })
    .unwrap();
    let mut cache = FragCache::new(order0);

    let va = cache.alloc(PAGE_SIZE, AllocFlags::default());
    assert!(va.is_ok());

    let err = cache.alloc(PAGE_SIZE + 1, AllocFlags::default());
    assert!(matches!(err, Err(pagefrag::Error::TooLarge { .. })));
}

/// A request larger than a page allocates nothing, even on an empty cache.
#[test]
fn test_too_large_allocates_nothing() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    let err = cache.alloc(PAGE_SIZE + 1, AllocFlags::default());
    assert!(matches!(err, Err(pagefrag::Error::TooLarge { .. })));
    assert_eq!(allocator.live_blocks(), 0);
}

// ============================================================================
// Prepare / Probe / Commit Coalescing
// ============================================================================

/// Probing near the end of a block reports the full remaining space, and
/// committing without a reference leaves the refcount budget alone.
#[test]
fn test_probe_commit_noref_coalescing() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    // Fill the block down to the last 100 bytes.
    let first = cache.alloc(64, AllocFlags::default()).unwrap();
    for _ in 0..7 {
        cache.alloc(PAGE_SIZE, AllocFlags::default()).unwrap();
    }
    cache.alloc(PAGE_SIZE - 64 - 100, AllocFlags::default()).unwrap();

    // 100 bytes left: a 32-byte probe sees all of them.
    let fragment = cache.probe(32, !0).unwrap();
    assert_eq!(fragment.offset(), MAX_BLOCK_SIZE - 100);
    assert_eq!(fragment.len(), 100);

    // The caller appends to the previous fragment: no new reference.
    let consumed = cache.commit_noref(fragment, 32);
    assert_eq!(consumed, 32);

    // 68 bytes remain; a larger probe misses.
    let rest = cache.probe(1, !0).unwrap();
    assert_eq!(rest.len(), 68);
    assert!(cache.probe(69, !0).is_none());

    allocator.free_fragment(first);
}

/// Prepare alone consumes nothing, no matter how often it runs.
#[test]
fn test_prepare_is_repeatable() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator);

    let a = cache.prepare(128, AllocFlags::default(), !0).unwrap();
    let a_offset = a.offset();
    drop(a);
    let b = cache.prepare(128, AllocFlags::default(), !0).unwrap();
    assert_eq!(b.offset(), a_offset);
}

// ============================================================================
// Abort
// ============================================================================

/// Commit followed by abort of the same size restores the next-fragment
/// offset.
#[test]
fn test_commit_abort_roundtrip() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator);

    cache.alloc(100, AllocFlags::default()).unwrap();
    let fragment = cache.prepare(64, AllocFlags::default(), !0).unwrap();
    cache.commit(fragment, 64);
    cache.abort(64);

    let next = cache.probe(1, !0).unwrap();
    assert_eq!(next.offset(), 100);
}

/// Aborting only the reference leaves the bytes consumed.
#[test]
fn test_abort_ref_keeps_bytes() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator);

    cache.alloc(100, AllocFlags::default()).unwrap();
    cache.abort_ref(100);

    let next = cache.probe(1, !0).unwrap();
    assert_eq!(next.offset(), 100);
}

// ============================================================================
// Free by Address
// ============================================================================

/// Alloc, free, drain: the block goes back to the allocator exactly once.
#[test]
fn test_alloc_free_drain_releases_block() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    let va = cache.alloc(256, AllocFlags::default()).unwrap();
    allocator.free_fragment(va);
    assert_eq!(allocator.live_blocks(), 1);

    cache.drain();
    assert_eq!(allocator.live_blocks(), 0);
    assert_eq!(allocator.bytes_in_use(), 0);
}

/// Fragments allocated in one thread can be freed from another.
#[test]
fn test_cross_thread_free() {
    let allocator = SystemAllocator::new().unwrap();
    let mut cache = FragCache::new(allocator.clone());

    let (tx, rx) = std::sync::mpsc::channel::<usize>();
    let consumer = {
        let allocator = allocator.clone();
        std::thread::spawn(move || {
            for addr in rx {
                let va = std::ptr::NonNull::new(addr as *mut u8).unwrap();
                allocator.free_fragment(va);
            }
        })
    };

    for _ in 0..10_000 {
        let va = cache.alloc(512, AllocFlags::default()).unwrap();
        tx.send(va.as_ptr() as usize).unwrap();
    }
    drop(tx);
    consumer.join().unwrap();

    cache.drain();
    assert_eq!(allocator.live_blocks(), 0);
}
