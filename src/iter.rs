//! Iteration over every live entry, one page at a time.
//!
//! The iterator locks page 0, walks its slot directory, unlocks, and
//! advances until all pages have been visited, so it owns at most one
//! page lock at any moment. There is no cross-page snapshot: entries
//! added or expunged in an already-visited page are not revisited,
//! and a not-yet-visited page is seen in whatever state it has when
//! its turn comes.

use crate::cache::Cache;
use crate::error::Result;
use crate::layout::SLOT_TOMBSTONE;
use crate::page::CacheEntry;

/// Iterator returned by [`Cache::entries`]. Yields each live entry
/// copied out of its page, with the stored (still encoded) value
/// bytes.
pub struct Entries<'a> {
    cache: &'a mut Cache,
    next_page: u32,
    slot_idx: usize,
    holds_lock: bool,
    done: bool,
}

impl<'a> Entries<'a> {
    pub(crate) fn new(cache: &'a mut Cache) -> Entries<'a> {
        Entries {
            cache,
            next_page: 0,
            slot_idx: 0,
            holds_lock: false,
            done: false,
        }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<CacheEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if !self.holds_lock {
                if self.next_page == self.cache.num_pages() {
                    self.done = true;
                    return None;
                }
                if let Err(e) = self.cache.lock_page(self.next_page) {
                    self.done = true;
                    return Some(Err(e));
                }
                self.holds_lock = true;
                self.slot_idx = 0;
            }

            let cursor = self.cache.cursor().expect("page locked above");
            while self.slot_idx < cursor.num_slots as usize {
                let offset = cursor.slot(self.slot_idx);
                self.slot_idx += 1;
                if offset > SLOT_TOMBSTONE {
                    return Some(Ok(cursor.entry_data(offset)));
                }
            }

            self.cache.unlock_page();
            self.holds_lock = false;
            self.next_page += 1;
        }
    }
}

impl Drop for Entries<'_> {
    fn drop(&mut self) {
        // An abandoned iterator must not keep its current page locked.
        if self.holds_lock {
            self.cache.unlock_page();
        }
    }
}
