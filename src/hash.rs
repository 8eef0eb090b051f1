//! Key hashing.
//!
//! One rotate-add pass over the key bytes yields a 32-bit value that
//! is split into a page index and a slot seed. The seed (not the page
//! part) is stored with each entry so a directory resize can reassign
//! entries with `slot_hash % new_num_slots` without re-reading keys.

use crate::layout::PAGE_MAGIC;

/// Where a key lives: which page, and where to start probing inside
/// that page's slot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHash {
    pub page: u32,
    pub slot_seed: u32,
}

/// Hash `key` for a cache of `num_pages` pages.
///
/// `num_pages` must be nonzero.
pub fn hash_key(key: &[u8], num_pages: u32) -> KeyHash {
    let mut h: u32 = PAGE_MAGIC;
    for &b in key {
        h = h
            .wrapping_shl(4)
            .wrapping_add(h >> 28)
            .wrapping_add(u32::from(b));
    }
    KeyHash {
        page: h % num_pages,
        slot_seed: h / num_pages,
    }
}
