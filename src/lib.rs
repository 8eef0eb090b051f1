//! Shared-memory key/value cache backed by a single memory-mapped
//! file.
//!
//! Multiple cooperating processes on one host attach to the same
//! share file and observe a consistent view: any process may read,
//! insert, update, delete, expire or iterate entries. The file is
//! split into independently locked pages; a key hashes to one page
//! and all work on it happens under that page's exclusive advisory
//! byte-range lock. Capacity is managed per page by LRU eviction,
//! with optional time-based expiry.
//!
//! ```no_run
//! use shmcache::{Cache, CacheOptions};
//!
//! # fn main() -> shmcache::Result<()> {
//! let mut cache = Cache::new(
//!     CacheOptions::new()
//!         .share_file("/tmp/example-cache")
//!         .num_pages(89)
//!         .page_size(64 * 1024),
//! )?;
//!
//! cache.set(b"greeting", b"hello")?;
//! assert_eq!(cache.get(b"greeting")?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! A `Cache` handle is process-local and single-threaded by contract;
//! cross-process coordination happens entirely through the per-page
//! file locks. A process killed mid-write may corrupt the page it was
//! writing — other pages are untouched, and attaching with
//! `test_file` repairs any page that fails its integrity check.

mod cache;
mod error;
mod expunge;
mod hash;
mod iter;
mod layout;
mod lock;
mod options;
mod page;
mod region;

pub use cache::{Cache, KeyInfo, KeyMeta, KeysMode};
pub use error::{Error, Result};
pub use iter::Entries;
pub use layout::{FLAG_DIRTY, FLAG_NOT_FOUND};
pub use options::{
    parse_duration, parse_size, CacheOptions, DeleteHook, HookError, ReadHook, ValueCodec,
    WriteAction, WriteHook, DEFAULT_SHARE_FILE,
};
pub use page::CacheEntry;
