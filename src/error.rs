//! Error types for the fragment cache.

use thiserror::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the fragment cache.
///
/// Probe misses are not errors: [`FragCache::probe`](crate::FragCache::probe)
/// returns `None` when the current block cannot satisfy a request without a
/// refill. Misuse of the commit/abort protocol is a debug assertion, not an
/// error variant.
#[derive(Error, Debug)]
pub enum Error {
    /// The block allocator could not supply a block of any order.
    ///
    /// The cache is left in a consistent empty state.
    #[error("out of memory: block allocator could not supply a block")]
    OutOfMemory,

    /// The requested fragment exceeds the page size and can never be
    /// satisfied from the slow path.
    ///
    /// The cache is left unmodified.
    #[error("fragment of {requested} bytes exceeds the page size ({max} bytes)")]
    TooLarge {
        /// The fragment size that was requested.
        requested: usize,
        /// The largest size the slow path can serve.
        max: usize,
    },

    /// System call error while setting up allocator-owned mappings.
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
