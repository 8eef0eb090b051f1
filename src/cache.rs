//! The cache facade.
//!
//! [`Cache`] is a process-local handle to a shared cache: it owns the
//! file descriptor and mapping, tracks the (at most one) page lock
//! this handle holds, and applies the embedder's policy around the
//! core page operations — value codec, read-through, write-through or
//! write-back, and the delete hook.
//!
//! A handle is not meant to be shared between threads without
//! external serialisation: it carries single-page lock state, and the
//! only cross-process primitive is the per-page file lock.
//!
//! Hooks run under the page lock (read-through) or right after it
//! (write-back flush, delete); they must not call back into the cache
//! for the same key. A re-entrant call is rejected with
//! [`Error::Reentrancy`] rather than deadlocking.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{Error, Result};
use crate::expunge::{self, ExpungeMode};
use crate::hash::hash_key;
use crate::iter::Entries;
use crate::layout::{FLAG_DIRTY, FLAG_NOT_FOUND};
use crate::lock;
use crate::options::{CacheOptions, DeleteHook, ReadHook, ValueCodec, WriteAction, WriteHook};
use crate::page::{now_secs, CacheEntry, PageCursor};
use crate::region::Region;

/// How much [`Cache::get_keys`] returns per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysMode {
    /// Keys only.
    KeysOnly,
    /// Keys plus per-entry metadata.
    WithMeta,
    /// Keys, metadata and decoded values.
    WithValues,
}

/// Per-entry metadata reported by [`Cache::get_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMeta {
    pub last_access: u32,
    pub expire_time: u32,
    pub flags: u32,
}

/// One [`Cache::get_keys`] result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: Vec<u8>,
    pub meta: Option<KeyMeta>,
    pub value: Option<Vec<u8>>,
}

/// Where a locked-page lookup found its answer.
enum Hit {
    /// Live entry in the page; value still encoded.
    Stored(Vec<u8>),
    /// Value produced by the read-through hook; already plain.
    Loaded(Vec<u8>),
    Miss,
}

/// Process-local handle to a shared cache.
pub struct Cache {
    region: Region,
    start_slots: u32,
    default_expire: u32,
    raw_values: bool,
    write_action: WriteAction,
    cache_not_found: bool,
    empty_on_exit: bool,
    codec: Option<Box<dyn ValueCodec>>,
    read_cb: Option<ReadHook>,
    write_cb: Option<WriteHook>,
    delete_cb: Option<DeleteHook>,
    cur: Option<PageCursor>,
}

impl Cache {
    /// Attach to (creating if needed) the shared cache described by
    /// `options`.
    pub fn new(mut options: CacheOptions) -> Result<Cache> {
        options.resolve_geometry()?;
        let region = Region::open(
            &options.share_file,
            options.num_pages,
            options.page_size,
            options.start_slots,
            options.init_file,
        )?;

        let mut cache = Cache {
            region,
            start_slots: options.start_slots,
            default_expire: options.expire_secs,
            raw_values: options.raw_values,
            write_action: options.write_action,
            cache_not_found: options.cache_not_found,
            empty_on_exit: options.empty_on_exit,
            codec: options.codec,
            read_cb: options.read_cb,
            write_cb: options.write_cb,
            delete_cb: options.delete_cb,
            cur: None,
        };

        if options.test_file {
            cache.verify_all_pages()?;
        }
        Ok(cache)
    }

    pub fn num_pages(&self) -> u32 {
        self.region.num_pages()
    }

    pub fn page_size(&self) -> u32 {
        self.region.page_size()
    }

    /// Look up `key`. On a miss the read-through hook, if any, is
    /// consulted (under the page lock) and its value admitted into
    /// the page.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let kh = hash_key(key, self.num_pages());
        self.lock_page(kh.page)?;
        let now = now_secs();
        let (hit, victims) = self.get_locked(kh.slot_seed, key, now);
        self.unlock_page();
        self.flush_victims(victims);

        match hit {
            Hit::Stored(bytes) => Ok(Some(self.decode_value(&bytes)?)),
            Hit::Loaded(value) => Ok(Some(value)),
            Hit::Miss => Ok(None),
        }
    }

    /// Store `key` → `value`, evicting by LRU when the page is under
    /// pressure. Returns whether the value landed in the page; either
    /// way the write hook is invoked per the write policy.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let encoded = self.encode_value(value)?;
        let kh = hash_key(key, self.num_pages());
        self.lock_page(kh.page)?;
        let now = now_secs();
        let flags = if self.write_back() { FLAG_DIRTY } else { 0 };
        let expire = self.expire_for(now);
        let (stored, victims) = self.make_room_and_write(kh.slot_seed, key, &encoded, flags, expire, now);
        self.unlock_page();

        self.flush_victims(victims);
        if !stored || !self.write_back() {
            self.invoke_write_hook(key, value, expire);
        }
        Ok(stored)
    }

    /// Atomic read-modify-write of one key: the page lock taken for
    /// the lookup is reused for the store, so no peer can interleave.
    /// `f` receives the key and the current value and returns the new
    /// value, which is also handed back to the caller.
    pub fn get_and_set<F>(&mut self, key: &[u8], f: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&[u8], Option<Vec<u8>>) -> Vec<u8>,
    {
        let kh = hash_key(key, self.num_pages());
        self.lock_page(kh.page)?;
        let now = now_secs();
        let (hit, mut victims) = self.get_locked(kh.slot_seed, key, now);

        let current = match hit {
            Hit::Stored(bytes) => match self.decode_value(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.unlock_page();
                    self.flush_victims(victims);
                    return Err(e);
                }
            },
            Hit::Loaded(value) => Some(value),
            Hit::Miss => None,
        };

        let new_value = f(key, current);
        let encoded = match self.encode_value(&new_value) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.unlock_page();
                self.flush_victims(victims);
                return Err(e);
            }
        };

        let flags = if self.write_back() { FLAG_DIRTY } else { 0 };
        let expire = self.expire_for(now);
        let (stored, more) = self.make_room_and_write(kh.slot_seed, key, &encoded, flags, expire, now);
        victims.extend(more);
        self.unlock_page();

        self.flush_victims(victims);
        if !stored || !self.write_back() {
            self.invoke_write_hook(key, &new_value, expire);
        }
        Ok(new_value)
    }

    /// Remove `key`, invoking the delete hook (outside the lock) when
    /// an entry was actually dropped.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let kh = hash_key(key, self.num_pages());
        self.lock_page(kh.page)?;
        let deleted = self
            .cur
            .as_mut()
            .expect("page locked")
            .delete(kh.slot_seed, key);
        self.unlock_page();

        match deleted {
            Some(flags) => {
                if let Some(cb) = self.delete_cb.as_mut() {
                    if let Err(e) = cb(key, flags) {
                        contain_hook_failure("delete hook", key, e);
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every entry. No hooks are invoked; dirty values are lost.
    pub fn clear(&mut self) -> Result<()> {
        self.expunge_all_pages(ExpungeMode::All, false)
    }

    /// Drop expired entries. No hooks are invoked.
    pub fn purge(&mut self) -> Result<()> {
        self.expunge_all_pages(ExpungeMode::Expired, false)
    }

    /// Expunge entries — all of them, or only expired ones — writing
    /// dirty victims back through the write hook first. Dirty victims
    /// are flushed regardless of their expiry state.
    pub fn empty(&mut self, only_expired: bool) -> Result<()> {
        let mode = if only_expired {
            ExpungeMode::Expired
        } else {
            ExpungeMode::All
        };
        self.expunge_all_pages(mode, true)
    }

    /// Iterate over every live entry, page at a time. Values are the
    /// stored bytes, before decoding.
    pub fn entries(&mut self) -> Entries<'_> {
        Entries::new(self)
    }

    /// List entries across the whole cache. Expired entries and
    /// memoised not-found markers are skipped.
    pub fn get_keys(&mut self, mode: KeysMode) -> Result<Vec<KeyInfo>> {
        let now = now_secs();
        let mut raw = Vec::new();
        for item in self.entries() {
            raw.push(item?);
        }

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            if entry.expire_time != 0 && now > entry.expire_time {
                continue;
            }
            if entry.flags & FLAG_NOT_FOUND != 0 {
                continue;
            }
            let meta = match mode {
                KeysMode::KeysOnly => None,
                _ => Some(KeyMeta {
                    last_access: entry.last_access,
                    expire_time: entry.expire_time,
                    flags: entry.flags,
                }),
            };
            let value = match mode {
                KeysMode::WithValues => Some(self.decode_value(&entry.value)?),
                _ => None,
            };
            out.push(KeyInfo {
                key: entry.key,
                meta,
                value,
            });
        }
        Ok(out)
    }

    /// Fetch several related entries under a single page lock. All
    /// subkeys live on the page chosen by hashing `page_key` alone;
    /// the stored keys are the page-key/subkey composition.
    pub fn multi_get(&mut self, page_key: &[u8], keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let num_pages = self.num_pages();
        let page = hash_key(page_key, num_pages).page;
        self.lock_page(page)?;
        let now = now_secs();

        let mut raw = Vec::new();
        {
            let cursor = self.cur.as_mut().expect("page locked");
            for &key in keys {
                let full = compose_key(page_key, key);
                let seed = hash_key(&full, num_pages).slot_seed;
                if let Some((bytes, flags)) = cursor.read(seed, &full, now) {
                    if flags & FLAG_NOT_FOUND == 0 {
                        raw.push((key.to_vec(), bytes));
                    }
                }
            }
        }
        self.unlock_page();

        let mut out = HashMap::with_capacity(raw.len());
        for (key, bytes) in raw {
            let value = self.decode_value(&bytes)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Store several related entries under a single page lock, on the
    /// page chosen by hashing `page_key` alone. The write hook, when
    /// it runs, sees the composed keys.
    pub fn multi_set(&mut self, page_key: &[u8], entries: &[(&[u8], &[u8])]) -> Result<()> {
        let num_pages = self.num_pages();
        let mut prepared = Vec::with_capacity(entries.len());
        for &(key, value) in entries {
            let encoded = self.encode_value(value)?;
            prepared.push((compose_key(page_key, key), encoded, value));
        }

        let page = hash_key(page_key, num_pages).page;
        self.lock_page(page)?;
        let now = now_secs();
        let flags = if self.write_back() { FLAG_DIRTY } else { 0 };
        let expire = self.expire_for(now);

        let mut victims = Vec::new();
        let mut unstored = Vec::new();
        for (idx, (full, encoded, _)) in prepared.iter().enumerate() {
            let seed = hash_key(full, num_pages).slot_seed;
            let (stored, more) = self.make_room_and_write(seed, full, encoded, flags, expire, now);
            victims.extend(more);
            if !stored {
                unstored.push(idx);
            }
        }
        self.unlock_page();

        self.flush_victims(victims);
        for (idx, (full, _, value)) in prepared.iter().enumerate() {
            if !self.write_back() || unstored.contains(&idx) {
                self.invoke_write_hook(full, value, expire);
            }
        }
        Ok(())
    }

    // --- Page lock state machine ---

    /// Lock `page` and attach the cursor. At most one page may be
    /// locked per handle; a second lock attempt is a re-entrant call.
    pub(crate) fn lock_page(&mut self, page: u32) -> Result<()> {
        if self.cur.is_some() {
            return Err(Error::Reentrancy);
        }
        let offset = self.region.page_offset(page);
        let len = u64::from(self.region.page_size());
        lock::lock_range(self.region.fd(), page, offset, len)?;

        let ptr = self.region.page_ptr(page);
        match PageCursor::attach(page, ptr, self.region.page_size()) {
            Ok(cursor) => {
                self.cur = Some(cursor);
                Ok(())
            }
            Err(e) => {
                lock::unlock_range(self.region.fd(), offset, len);
                Err(e)
            }
        }
    }

    /// Write the header back if the cursor saw writes, then release
    /// the page lock. Never fails.
    pub(crate) fn unlock_page(&mut self) {
        debug_assert!(self.cur.is_some(), "unlock with no page locked");
        if let Some(mut cursor) = self.cur.take() {
            if cursor.is_dirty() {
                cursor.flush_header();
            }
            let offset = self.region.page_offset(cursor.page());
            lock::unlock_range(self.region.fd(), offset, u64::from(self.region.page_size()));
        }
    }

    pub(crate) fn cursor(&self) -> Option<&PageCursor> {
        self.cur.as_ref()
    }

    // --- Internals ---

    fn write_back(&self) -> bool {
        self.write_action == WriteAction::WriteBack
    }

    fn expire_for(&self, now: u32) -> u32 {
        if self.default_expire != 0 {
            now.saturating_add(self.default_expire)
        } else {
            0
        }
    }

    /// Locked-page half of `get`: read, then read-through on a miss.
    /// Returns the hit and any dirty victims evicted by admission.
    fn get_locked(&mut self, slot_seed: u32, key: &[u8], now: u32) -> (Hit, Vec<CacheEntry>) {
        let cursor = self.cur.as_mut().expect("page locked");
        if let Some((bytes, flags)) = cursor.read(slot_seed, key, now) {
            if flags & FLAG_NOT_FOUND != 0 {
                // Memoised miss: report it without asking the backing
                // store again.
                return (Hit::Miss, Vec::new());
            }
            return (Hit::Stored(bytes), Vec::new());
        }

        let Some(cb) = self.read_cb.as_mut() else {
            return (Hit::Miss, Vec::new());
        };
        match cb(key) {
            Ok(Some(value)) => {
                let mut victims = Vec::new();
                match self.encode_value(&value) {
                    Ok(encoded) => {
                        let expire = self.expire_for(now);
                        let (_, more) =
                            self.make_room_and_write(slot_seed, key, &encoded, 0, expire, now);
                        victims = more;
                    }
                    // The value is still a hit even if it could not be
                    // admitted.
                    Err(e) => contain_hook_failure("value codec", key, Box::new(e)),
                }
                (Hit::Loaded(value), victims)
            }
            Ok(None) if self.cache_not_found => {
                let (_, victims) =
                    self.make_room_and_write(slot_seed, key, &[], FLAG_NOT_FOUND, now, now);
                (Hit::Miss, victims)
            }
            Ok(None) => (Hit::Miss, Vec::new()),
            Err(e) => {
                contain_hook_failure("read hook", key, e);
                (Hit::Miss, Vec::new())
            }
        }
    }

    /// Run the admission expunge for a record of this size, then
    /// write. Dirty victims are copied out before compaction when a
    /// write hook is registered.
    fn make_room_and_write(
        &mut self,
        slot_seed: u32,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expire: u32,
        now: u32,
    ) -> (bool, Vec<CacheEntry>) {
        let collect = self.write_cb.is_some();
        let cursor = self.cur.as_mut().expect("page locked");
        let len = (key.len() + value.len()) as u32;

        let mut victims = Vec::new();
        if let Some(plan) = expunge::calc_expunge(cursor, ExpungeMode::MakeRoom(len), now) {
            if collect {
                victims = plan
                    .victims
                    .iter()
                    .map(|&offset| cursor.entry_data(offset))
                    .filter(|entry| entry.flags & FLAG_DIRTY != 0)
                    .collect();
            }
            expunge::do_expunge(cursor, &plan);
        }

        let stored = cursor.write(slot_seed, key, value, flags, expire, now);
        (stored, victims)
    }

    /// Lock, expunge and unlock every page in turn. With `flush`,
    /// dirty victims are pushed through the write hook after each
    /// page's lock is released.
    fn expunge_all_pages(&mut self, mode: ExpungeMode, flush: bool) -> Result<()> {
        for page in 0..self.num_pages() {
            self.lock_page(page)?;
            let now = now_secs();
            let collect = flush && self.write_cb.is_some();

            let cursor = self.cur.as_mut().expect("page locked");
            let mut victims = Vec::new();
            if let Some(plan) = expunge::calc_expunge(cursor, mode, now) {
                if !plan.is_noop(cursor) {
                    if collect {
                        victims = plan
                            .victims
                            .iter()
                            .map(|&offset| cursor.entry_data(offset))
                            .filter(|entry| entry.flags & FLAG_DIRTY != 0)
                            .collect();
                    }
                    expunge::do_expunge(cursor, &plan);
                }
            }
            self.unlock_page();
            self.flush_victims(victims);
        }
        Ok(())
    }

    /// Integrity-test every page, re-initialising the corrupt ones in
    /// place. Repairs are logged, never surfaced.
    fn verify_all_pages(&mut self) -> Result<()> {
        for page in 0..self.num_pages() {
            let offset = self.region.page_offset(page);
            let len = u64::from(self.region.page_size());
            lock::lock_range(self.region.fd(), page, offset, len)?;

            let ptr = self.region.page_ptr(page);
            let healthy = match PageCursor::attach(page, ptr, self.region.page_size()) {
                Ok(cursor) => cursor.test_page(),
                Err(_) => false,
            };
            if !healthy {
                warn!(page, "corrupt page re-initialised");
                self.region.reinit_page(page, self.start_slots);
            }
            lock::unlock_range(self.region.fd(), offset, len);
        }
        Ok(())
    }

    /// Write evicted dirty entries back through the write hook,
    /// outside any page lock.
    fn flush_victims(&mut self, victims: Vec<CacheEntry>) {
        if victims.is_empty() {
            return;
        }
        for victim in victims {
            let value = match (&self.codec, self.raw_values) {
                (Some(codec), false) => match codec.decode(&victim.value) {
                    Ok(value) => value,
                    Err(e) => {
                        contain_hook_failure("value codec", &victim.key, e);
                        continue;
                    }
                },
                _ => victim.value,
            };
            self.invoke_write_hook(&victim.key, &value, victim.expire_time);
        }
    }

    fn invoke_write_hook(&mut self, key: &[u8], value: &[u8], expire: u32) {
        if let Some(cb) = self.write_cb.as_mut() {
            if let Err(e) = cb(key, value, expire) {
                contain_hook_failure("write hook", key, e);
            }
        }
    }

    fn encode_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        match &self.codec {
            Some(codec) if !self.raw_values => codec
                .encode(value)
                .map_err(|e| Error::Callback(e.to_string())),
            _ => Ok(value.to_vec()),
        }
    }

    fn decode_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match &self.codec {
            Some(codec) if !self.raw_values => codec
                .decode(stored)
                .map_err(|e| Error::Callback(e.to_string())),
            _ => Ok(stored.to_vec()),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.cur.is_some() {
            self.unlock_page();
        }
        if self.empty_on_exit {
            self.empty_on_exit = false;
            if let Err(e) = self.empty(false) {
                warn!(error = %e, "empty-on-exit failed");
            }
        }
    }
}

/// Stored key for a `multi_get`/`multi_set` entry: the page key,
/// length-prefixed, followed by the subkey. The length prefix keeps
/// distinct (page_key, subkey) pairs distinct.
fn compose_key(page_key: &[u8], subkey: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(4 + page_key.len() + subkey.len());
    full.extend_from_slice(&(page_key.len() as u32).to_ne_bytes());
    full.extend_from_slice(page_key);
    full.extend_from_slice(subkey);
    full
}

/// A failed hook or codec has no effect on the cache; report it on
/// the embedder's error channel and move on.
fn contain_hook_failure(what: &str, key: &[u8], err: crate::options::HookError) {
    let err = Error::Callback(err.to_string());
    warn!(what, key = ?String::from_utf8_lossy(key), error = %err, "hook failure contained");
}
