//! Allocation-request flags understood by block allocators.

use bitflags::bitflags;

bitflags! {
    /// Flags a caller attaches to a block-allocation request.
    ///
    /// The cache forwards the caller's flags unchanged on the order-0
    /// fallback path and augments them on the preferred large-block path
    /// so that a failed compound allocation under memory pressure is
    /// cheap: no blocking, no retries, no log noise, and no dipping into
    /// the emergency reserve for what is only an optimisation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The allocator may block or do significant work to satisfy the
        /// request.
        const DIRECT_RECLAIM = 1 << 0;
        /// Request a higher-order block rather than a single page.
        const COMPOUND = 1 << 1;
        /// Suppress allocation-failure logging.
        const NO_WARN = 1 << 2;
        /// Fail fast instead of retrying under pressure.
        const NO_RETRY = 1 << 3;
        /// Never draw from the emergency reserve.
        const NO_MEMALLOC = 1 << 4;
    }
}

impl AllocFlags {
    /// Flags used for the preferred large-block attempt, derived from the
    /// caller's flags.
    ///
    /// Direct reclaim is stripped: the large block is an optimisation and
    /// must fail cheaply so the order-0 fallback can run with the caller's
    /// original flags.
    #[inline]
    pub fn for_large_block(self) -> Self {
        (self - Self::DIRECT_RECLAIM)
            | Self::COMPOUND
            | Self::NO_WARN
            | Self::NO_RETRY
            | Self::NO_MEMALLOC
    }
}

impl Default for AllocFlags {
    /// The ordinary baseline: blocking allowed, everything else off.
    fn default() -> Self {
        Self::DIRECT_RECLAIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_block_flags_strip_reclaim() {
        let flags = AllocFlags::default().for_large_block();
        assert!(!flags.contains(AllocFlags::DIRECT_RECLAIM));
        assert!(flags.contains(AllocFlags::COMPOUND));
        assert!(flags.contains(AllocFlags::NO_WARN));
        assert!(flags.contains(AllocFlags::NO_RETRY));
        assert!(flags.contains(AllocFlags::NO_MEMALLOC));
    }

    #[test]
    fn test_large_block_flags_preserve_other_bits() {
        let flags = (AllocFlags::NO_WARN | AllocFlags::DIRECT_RECLAIM).for_large_block();
        assert!(flags.contains(AllocFlags::NO_WARN));
        assert!(!flags.contains(AllocFlags::DIRECT_RECLAIM));
    }
}
