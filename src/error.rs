//! Error handling.
//!
//! All public cache operations return [`Result<T>`]. Errors are
//! surfaced to the caller of the operation that triggered them, with
//! the page lock already released; unlocking itself never fails.

use std::io;

use thiserror::Error;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while attaching to or operating on a cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration: geometry out of bounds, a page size
    /// that is not a power of two after rounding, an unparsable size
    /// or duration string, or a missing share path.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The underlying open/stat/unlink/write/mmap failed.
    #[error("share file I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The advisory lock on a page could not be acquired within the
    /// timeout budget.
    #[error("timed out locking page {page}")]
    LockTimeout { page: u32 },

    /// Magic mismatch or header invariant violation observed when a
    /// page was locked. During an attach-time integrity pass the page
    /// is re-initialised instead and this is never surfaced.
    #[error("page {page} is corrupt")]
    PageCorrupt { page: u32 },

    /// An embedder-supplied hook or codec failed. Hook failures are
    /// contained: they are logged and leave the cache state as if the
    /// hook had no effect. Codec failures are returned to the caller.
    #[error("callback failed: {0}")]
    Callback(String),

    /// A public operation was invoked while a page lock was already
    /// held by this handle, e.g. from inside a hook. Rejected rather
    /// than deadlocking against ourselves.
    #[error("re-entrant cache call while a page is locked")]
    Reentrancy,
}
