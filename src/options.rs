//! Cache configuration.
//!
//! [`CacheOptions`] collects the geometry, policy switches, value
//! codec and embedder hooks, and resolves them into a validated
//! geometry when the cache attaches. Sizes accept `k`/`m`/`g`
//! suffixes, expiry durations accept `s`/`m`/`h`/`d`/`w`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::layout::{self, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Error type embedder hooks and codecs may fail with.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Read-through hook: given a key, produce the backing-store value or
/// report that there is none.
pub type ReadHook = Box<dyn FnMut(&[u8]) -> std::result::Result<Option<Vec<u8>>, HookError>>;

/// Write-through / write-back hook: `(key, value, expire_time)`.
pub type WriteHook = Box<dyn FnMut(&[u8], &[u8], u32) -> std::result::Result<(), HookError>>;

/// Delete hook: `(key, flags)` of the removed entry.
pub type DeleteHook = Box<dyn FnMut(&[u8], u32) -> std::result::Result<(), HookError>>;

/// Reversible byte transform applied to values on their way into and
/// out of the share file. Supplied by the embedder; the cache treats
/// the encoded form as opaque bytes.
pub trait ValueCodec {
    fn encode(&self, value: &[u8]) -> std::result::Result<Vec<u8>, HookError>;
    fn decode(&self, stored: &[u8]) -> std::result::Result<Vec<u8>, HookError>;
}

/// What `set` does about the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteAction {
    /// Every `set` also invokes the write hook immediately.
    #[default]
    WriteThrough,
    /// `set` only marks the entry dirty; the write hook runs when the
    /// entry is evicted or the cache is flushed with `empty`.
    WriteBack,
}

/// Default share file location. A process-wide fallback only; set
/// [`CacheOptions::share_file`] per handle for anything real.
pub const DEFAULT_SHARE_FILE: &str = "/tmp/sharefile";

const DEFAULT_NUM_PAGES: u32 = 89;
const DEFAULT_PAGE_SIZE: u32 = 64 * 1024;
const DEFAULT_START_SLOTS: u32 = 89;

/// Options for [`crate::Cache::new`].
pub struct CacheOptions {
    pub(crate) share_file: PathBuf,
    pub(crate) init_file: bool,
    pub(crate) test_file: bool,
    pub(crate) raw_values: bool,
    pub(crate) expire_secs: u32,
    pub(crate) page_size: u32,
    pub(crate) num_pages: u32,
    pub(crate) start_slots: u32,
    cache_size: Option<u64>,
    pub(crate) write_action: WriteAction,
    pub(crate) cache_not_found: bool,
    pub(crate) empty_on_exit: bool,
    pub(crate) codec: Option<Box<dyn ValueCodec>>,
    pub(crate) read_cb: Option<ReadHook>,
    pub(crate) write_cb: Option<WriteHook>,
    pub(crate) delete_cb: Option<DeleteHook>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            share_file: PathBuf::from(DEFAULT_SHARE_FILE),
            init_file: false,
            test_file: false,
            raw_values: false,
            expire_secs: 0,
            page_size: DEFAULT_PAGE_SIZE,
            num_pages: DEFAULT_NUM_PAGES,
            start_slots: DEFAULT_START_SLOTS,
            cache_size: None,
            write_action: WriteAction::default(),
            cache_not_found: false,
            empty_on_exit: false,
            codec: None,
            read_cb: None,
            write_cb: None,
            delete_cb: None,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the share file all processes attach to.
    pub fn share_file(mut self, path: impl AsRef<Path>) -> Self {
        self.share_file = path.as_ref().to_path_buf();
        self
    }

    /// Force re-initialisation of the share file on attach.
    pub fn init_file(mut self, yes: bool) -> Self {
        self.init_file = yes;
        self
    }

    /// Integrity-test every page on attach, re-initialising any that
    /// fail.
    pub fn test_file(mut self, yes: bool) -> Self {
        self.test_file = yes;
        self
    }

    /// Store values exactly as supplied, bypassing the codec.
    pub fn raw_values(mut self, yes: bool) -> Self {
        self.raw_values = yes;
        self
    }

    /// Default per-entry time-to-live in seconds; 0 disables time
    /// expiry (LRU only).
    pub fn expire_time(mut self, secs: u32) -> Self {
        self.expire_secs = secs;
        self
    }

    /// Default time-to-live from a string like `"90"`, `"2m"`, `"1h"`,
    /// `"1d"` or `"1w"`.
    pub fn expire_time_str(mut self, spec: &str) -> Result<Self> {
        self.expire_secs = parse_duration(spec)?;
        Ok(self)
    }

    /// Page size in bytes; rounded up to a power of two, which must
    /// land in [4 KiB, 1 MiB].
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Number of independently locked pages. A prime count spreads
    /// keys best.
    pub fn num_pages(mut self, pages: u32) -> Self {
        self.num_pages = pages;
        self
    }

    /// Initial slot directory size per page.
    pub fn start_slots(mut self, slots: u32) -> Self {
        self.start_slots = slots;
        self
    }

    /// Total cache size in bytes; `num_pages` is derived as the next
    /// prime at least `size / page_size`.
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = Some(bytes);
        self
    }

    /// Total cache size from a string like `"65536"`, `"512k"` or
    /// `"16m"`.
    pub fn cache_size_str(mut self, spec: &str) -> Result<Self> {
        self.cache_size = Some(parse_size(spec)?);
        Ok(self)
    }

    pub fn write_action(mut self, action: WriteAction) -> Self {
        self.write_action = action;
        self
    }

    /// Memoise read-through misses so the backing store is not asked
    /// again within the same second.
    pub fn cache_not_found(mut self, yes: bool) -> Self {
        self.cache_not_found = yes;
        self
    }

    /// Run `empty(false)` when the handle is dropped. Only one
    /// process (typically the parent) should set this.
    pub fn empty_on_exit(mut self, yes: bool) -> Self {
        self.empty_on_exit = yes;
        self
    }

    /// Value codec applied on `set` and reversed on `get`. Without
    /// one, values pass through unchanged.
    pub fn codec(mut self, codec: impl ValueCodec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Read-through hook, consulted on `get` misses. Embedder context
    /// belongs in the closure's captures.
    pub fn read_hook(
        mut self,
        hook: impl FnMut(&[u8]) -> std::result::Result<Option<Vec<u8>>, HookError> + 'static,
    ) -> Self {
        self.read_cb = Some(Box::new(hook));
        self
    }

    /// Write hook, invoked per write-through store, unstorable value,
    /// or flushed dirty victim.
    pub fn write_hook(
        mut self,
        hook: impl FnMut(&[u8], &[u8], u32) -> std::result::Result<(), HookError> + 'static,
    ) -> Self {
        self.write_cb = Some(Box::new(hook));
        self
    }

    /// Delete hook, invoked after `remove` drops an entry.
    pub fn delete_hook(
        mut self,
        hook: impl FnMut(&[u8], u32) -> std::result::Result<(), HookError> + 'static,
    ) -> Self {
        self.delete_cb = Some(Box::new(hook));
        self
    }

    /// Normalise and bounds-check the geometry.
    pub(crate) fn resolve_geometry(&mut self) -> Result<()> {
        if self.share_file.as_os_str().is_empty() {
            return Err(Error::Config("no share file specified".into()));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        let rounded = self.page_size.next_power_of_two();
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&rounded) {
            return Err(Error::Config(format!(
                "page size {} (rounded to {}) outside {}..={}",
                self.page_size, rounded, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        self.page_size = rounded;

        if let Some(size) = self.cache_size {
            let pages = (size / u64::from(self.page_size)).max(1);
            let pages = u32::try_from(pages)
                .map_err(|_| Error::Config(format!("cache size {size} needs too many pages")))?;
            self.num_pages = next_prime(pages);
        }
        if self.num_pages == 0 {
            return Err(Error::Config("num_pages must be at least 1".into()));
        }

        if self.start_slots < 4 {
            return Err(Error::Config("start_slots must be at least 4".into()));
        }
        // The directory must leave at least half the page for records.
        if layout::heap_start(self.start_slots) > self.page_size / 2 {
            return Err(Error::Config(format!(
                "start_slots {} leaves no room in a {}-byte page",
                self.start_slots, self.page_size
            )));
        }

        Ok(())
    }
}

/// Parse a byte size: plain bytes, or `k`/`m`/`g` suffixed.
pub fn parse_size(spec: &str) -> Result<u64> {
    let spec = spec.trim();
    let bad = || Error::Config(format!("unparsable size: {spec:?}"));
    let (digits, multiplier) = match spec.char_indices().last().ok_or_else(bad)? {
        (i, 'k') | (i, 'K') => (&spec[..i], 1024),
        (i, 'm') | (i, 'M') => (&spec[..i], 1024 * 1024),
        (i, 'g') | (i, 'G') => (&spec[..i], 1024 * 1024 * 1024),
        _ => (spec, 1),
    };
    let value: u64 = digits.parse().map_err(|_| bad())?;
    value.checked_mul(multiplier).ok_or_else(bad)
}

/// Parse a duration in seconds: plain seconds, or `s`/`m`/`h`/`d`/`w`
/// suffixed.
pub fn parse_duration(spec: &str) -> Result<u32> {
    let spec = spec.trim();
    let bad = || Error::Config(format!("unparsable duration: {spec:?}"));
    let (digits, multiplier) = match spec.char_indices().last().ok_or_else(bad)? {
        (i, 's') => (&spec[..i], 1),
        (i, 'm') => (&spec[..i], 60),
        (i, 'h') => (&spec[..i], 60 * 60),
        (i, 'd') => (&spec[..i], 24 * 60 * 60),
        (i, 'w') => (&spec[..i], 7 * 24 * 60 * 60),
        _ => (spec, 1),
    };
    let value: u32 = digits.parse().map_err(|_| bad())?;
    value.checked_mul(multiplier).ok_or_else(bad)
}

/// Smallest prime ≥ `n`.
fn next_prime(n: u32) -> u32 {
    fn is_prime(n: u32) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2u32;
        while d.saturating_mul(d) <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}
